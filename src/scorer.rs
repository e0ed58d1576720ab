// 该文件是 Xunying （寻影） 项目的一部分。
// src/scorer.rs - 区域评分与非极大值抑制
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
use tracing::debug;

use crate::embedding::RegionSet;
use crate::error::DetectorError;
use crate::geometry::{nms, to_corners};
use crate::model::ClassHead;
use crate::prototype::ClassPrototypeSet;

/// 分类头中表示背景的类别名，不会出现在检测结果中
pub const BACKGROUND_CLASS: &str = "_background";

/// 一个检测结果，坐标为按 max(宽, 高) 归一化的中心格式
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_name: String,
  pub class_id: usize,
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
  pub confidence: f32,
}

/// 一个候选：区域下标、分数、是否来自正原型
#[derive(Debug, Clone, Copy)]
struct Candidate {
  region: usize,
  score: f32,
  positive: bool,
}

/// 每个区域与一组原型的最大点积相似度
fn max_similarity(embeds: ArrayView2<f32>, prototypes: &Array2<f32>) -> Vec<f32> {
  let similarity = embeds.dot(&prototypes.t());
  similarity
    .axis_iter(Axis(0))
    .map(|row| row.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    .collect()
}

fn run_nms(
  regions: &RegionSet,
  indices: &[usize],
  scores: &[f32],
  iou_threshold: f32,
) -> Vec<usize> {
  let boxes = regions.boxes.select(Axis(0), indices);
  nms(to_corners(boxes.view()).view(), scores, iou_threshold)
}

/// 用原型对一张图像的候选区域评分。
///
/// 每个类别先分别用正、负原型筛出相似度大于 `confidence` 的区域，合并后做类内 NMS，
/// 只保留来自正原型的幸存者；负原型的候选仅用于抑制与之重叠的正候选。所有类别的
/// 结果最后再做一次跨类别 NMS。原型维度与区域嵌入维度不一致时返回
/// [`DetectorError::PrototypeDimension`]。
pub fn score_image(
  regions: &RegionSet,
  prototypes: &ClassPrototypeSet,
  confidence: f32,
  iou_threshold: f32,
) -> Result<Vec<Detection>, DetectorError> {
  let mut detections: Vec<(usize, usize, f32)> = Vec::new();
  let mut class_names = Vec::with_capacity(prototypes.len());

  for (class_id, (class_name, class_prototypes)) in prototypes.iter().enumerate() {
    class_names.push(class_name);

    let mut candidates = Vec::new();
    let polarities = [
      (&class_prototypes.positive, true),
      (&class_prototypes.negative, false),
    ];
    for (polarity, positive) in polarities {
      let Some(polarity) = polarity else {
        continue;
      };
      if regions.is_empty() || polarity.nrows() == 0 {
        continue;
      }
      if polarity.ncols() != regions.embedding_dim() {
        return Err(DetectorError::PrototypeDimension {
          class_name: class_name.to_string(),
          expected: regions.embedding_dim(),
          found: polarity.ncols(),
        });
      }
      let scores = max_similarity(regions.class_embeds.view(), polarity);
      candidates.extend(
        scores
          .into_iter()
          .enumerate()
          .filter(|(_, score)| *score > confidence)
          .map(|(region, score)| Candidate {
            region,
            score,
            positive,
          }),
      );
    }
    if candidates.is_empty() {
      continue;
    }

    let indices: Vec<usize> = candidates.iter().map(|c| c.region).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    let survivors = run_nms(regions, &indices, &scores, iou_threshold);
    let before = detections.len();
    detections.extend(
      survivors
        .into_iter()
        .map(|i| candidates[i])
        .filter(|c| c.positive)
        .map(|c| (class_id, c.region, c.score)),
    );
    debug!(
      "类别 {}: 候选 {} 个, 类内 NMS 后保留正样本 {} 个",
      class_name,
      candidates.len(),
      detections.len() - before
    );
  }

  if detections.is_empty() {
    return Ok(Vec::new());
  }

  let indices: Vec<usize> = detections.iter().map(|d| d.1).collect();
  let scores: Vec<f32> = detections.iter().map(|d| d.2).collect();
  let survivors = run_nms(regions, &indices, &scores, iou_threshold);
  debug!("跨类别 NMS: {} -> {}", detections.len(), survivors.len());

  Ok(
    survivors
      .into_iter()
      .map(|i| {
        let (class_id, region, score) = detections[i];
        make_detection(regions, region, class_names[class_id], class_id, score)
      })
      .collect(),
  )
}

fn make_detection(
  regions: &RegionSet,
  region: usize,
  class_name: &str,
  class_id: usize,
  confidence: f32,
) -> Detection {
  let b = regions.boxes.row(region);
  Detection {
    class_name: class_name.to_string(),
    class_id,
    x: b[0],
    y: b[1],
    w: b[2],
    h: b[3],
    confidence,
  }
}

fn softmax_rows(logits: &mut Array2<f32>) {
  for mut row in logits.axis_iter_mut(Axis(0)) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    row.mapv_inplace(|v| (v - max).exp());
    let sum = row.sum();
    if sum > 0.0 {
      row.mapv_inplace(|v| v / sum);
    }
  }
}

/// 用训练好的分类头对一张图像的候选区域评分。
///
/// 每个区域取 softmax 后概率最大的类别及其概率，对全部区域做一次 NMS，最后丢弃
/// [`BACKGROUND_CLASS`]。`class_id` 为类别在 `class_names` 中的下标。
pub fn score_with_head<H: ClassHead + ?Sized>(
  regions: &RegionSet,
  head: &H,
  class_names: &[String],
  iou_threshold: f32,
) -> Result<Vec<Detection>, DetectorError> {
  if regions.is_empty() {
    return Ok(Vec::new());
  }

  let mut probabilities = head.logits(regions.class_embeds.view())?;
  if probabilities.dim() != (regions.len(), class_names.len()) {
    return Err(DetectorError::ClassHead(format!(
      "预期输出形状为 [{}, {}], 实际为 {:?}",
      regions.len(),
      class_names.len(),
      probabilities.shape()
    )));
  }
  softmax_rows(&mut probabilities);

  let (classes, scores): (Vec<usize>, Vec<f32>) = probabilities
    .axis_iter(Axis(0))
    .map(|row| {
      row.iter().copied().enumerate().fold(
        (0, f32::NEG_INFINITY),
        |best, (i, p)| if p > best.1 { (i, p) } else { best },
      )
    })
    .unzip();

  let indices: Vec<usize> = (0..regions.len()).collect();
  let survivors = run_nms(regions, &indices, &scores, iou_threshold);

  Ok(
    survivors
      .into_iter()
      .filter(|&i| class_names[classes[i]] != BACKGROUND_CLASS)
      .map(|i| {
        let class_id = classes[i];
        make_detection(regions, i, &class_names[class_id], class_id, scores[i])
      })
      .collect(),
  )
}
