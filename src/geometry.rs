// 该文件是 Xunying （寻影） 项目的一部分。
// src/geometry.rs - 边界框几何运算
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ndarray::{Array2, ArrayView2, Axis};

/// [cx, cy, w, h] -> [x1, y1, x2, y2]
pub fn box_to_corners(b: [f32; 4]) -> [f32; 4] {
  let [cx, cy, w, h] = b;
  [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// [x1, y1, x2, y2] -> [cx, cy, w, h]
pub fn box_from_corners(b: [f32; 4]) -> [f32; 4] {
  let [x1, y1, x2, y2] = b;
  [(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1]
}

fn map_rows(boxes: ArrayView2<f32>, f: fn([f32; 4]) -> [f32; 4]) -> Array2<f32> {
  let mut out = Array2::zeros((boxes.nrows(), 4));
  for (src, mut dst) in boxes.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
    let converted = f([src[0], src[1], src[2], src[3]]);
    for (d, v) in dst.iter_mut().zip(converted) {
      *d = v;
    }
  }
  out
}

/// 对 `[N, 4]` 的中心格式框逐行转换为角点格式
pub fn to_corners(boxes: ArrayView2<f32>) -> Array2<f32> {
  map_rows(boxes, box_to_corners)
}

/// 对 `[N, 4]` 的角点格式框逐行转换为中心格式
pub fn from_corners(boxes: ArrayView2<f32>) -> Array2<f32> {
  map_rows(boxes, box_from_corners)
}

/// 两个角点格式框的 IoU，并集面积为 0 时定义为 0
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    (intersection / union).clamp(0.0, 1.0)
  } else {
    0.0
  }
}

fn row(boxes: &ArrayView2<f32>, i: usize) -> [f32; 4] {
  [boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]]
}

/// 两组角点格式框的两两 IoU，返回 `[A, B]` 矩阵
pub fn box_iou(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Array2<f32> {
  Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| iou(row(&a, i), row(&b, j)))
}

/// 贪心非极大值抑制。
///
/// `boxes` 为角点格式。按分数从高到低（同分保持输入顺序）遍历，与已保留框 IoU
/// 大于等于 `iou_threshold` 的框被抑制。返回保留框的下标，按分数降序排列。
pub fn nms(boxes: ArrayView2<f32>, scores: &[f32], iou_threshold: f32) -> Vec<usize> {
  debug_assert_eq!(boxes.nrows(), scores.len());

  let mut order: Vec<usize> = (0..scores.len()).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

  let mut suppressed = vec![false; scores.len()];
  let mut keep = Vec::new();

  for (pos, &i) in order.iter().enumerate() {
    if suppressed[i] {
      continue;
    }
    keep.push(i);
    let best = row(&boxes, i);
    for &j in &order[pos + 1..] {
      if !suppressed[j] && iou(best, row(&boxes, j)) >= iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  keep
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  const EPS: f32 = 1e-5;

  #[test]
  fn test_corner_round_trip() {
    let boxes = [
      [0.5, 0.5, 0.2, 0.4],
      [0.1, 0.9, 0.05, 0.3],
      [12.0, 7.5, 3.0, 1.0],
      [0.0, 0.0, 0.0, 0.0],
    ];
    for b in boxes {
      let back = box_from_corners(box_to_corners(b));
      for (x, y) in b.iter().zip(back) {
        assert!((x - y).abs() < EPS, "{:?} != {:?}", b, back);
      }
    }

    let arr = array![[0.5f32, 0.5, 0.2, 0.4], [0.3, 0.2, 0.1, 0.1]];
    let back = from_corners(to_corners(arr.view()).view());
    assert!(arr.iter().zip(back.iter()).all(|(a, b)| (a - b).abs() < EPS));
  }

  #[test]
  fn test_to_corners_values() {
    assert_eq!(box_to_corners([2.0, 3.0, 2.0, 4.0]), [1.0, 1.0, 3.0, 5.0]);
  }

  #[test]
  fn test_iou_bounds() {
    let a = [0.0, 0.0, 2.0, 2.0];
    assert!((iou(a, a) - 1.0).abs() < EPS);
    assert_eq!(iou(a, [3.0, 3.0, 4.0, 4.0]), 0.0);
    // 只接触边界
    assert_eq!(iou(a, [2.0, 0.0, 4.0, 2.0]), 0.0);
    // 一半重叠: 2 / (4 + 4 - 2)
    assert!((iou(a, [1.0, 0.0, 3.0, 2.0]) - 1.0 / 3.0).abs() < EPS);
    // 退化框
    assert_eq!(iou([1.0, 1.0, 1.0, 1.0], [1.0, 1.0, 1.0, 1.0]), 0.0);
  }

  #[test]
  fn test_box_iou_matrix_shape() {
    let a = array![[0.0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 2.0, 2.0]];
    let b = array![[0.0f32, 0.0, 1.0, 1.0], [5.0, 5.0, 6.0, 6.0], [0.0, 0.0, 2.0, 2.0]];
    let m = box_iou(a.view(), b.view());
    assert_eq!(m.dim(), (2, 3));
    assert!((m[[0, 0]] - 1.0).abs() < EPS);
    assert_eq!(m[[0, 1]], 0.0);
    assert!((m[[1, 0]] - 0.25).abs() < EPS);
    assert!(m.iter().all(|v| (0.0..=1.0).contains(v)));
  }

  #[test]
  fn test_nms_suppresses_overlaps() {
    let boxes = array![
      [0.0f32, 0.0, 1.0, 1.0],
      [0.05, 0.0, 1.05, 1.0],
      [2.0, 2.0, 3.0, 3.0],
    ];
    let keep = nms(boxes.view(), &[0.8, 0.9, 0.1], 0.5);
    assert_eq!(keep, vec![1, 2]);
  }

  #[test]
  fn test_nms_threshold_is_inclusive() {
    let boxes = array![[0.0f32, 0.0, 2.0, 2.0], [1.0, 0.0, 3.0, 2.0]];
    let iou_value = iou([0.0, 0.0, 2.0, 2.0], [1.0, 0.0, 3.0, 2.0]);
    assert_eq!(nms(boxes.view(), &[0.9, 0.8], iou_value), vec![0]);
    assert_eq!(nms(boxes.view(), &[0.9, 0.8], iou_value + 0.01), vec![0, 1]);
  }

  #[test]
  fn test_nms_empty() {
    let boxes = Array2::<f32>::zeros((0, 4));
    assert!(nms(boxes.view(), &[], 0.3).is_empty());
  }
}
