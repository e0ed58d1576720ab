// 该文件是 Xunying （寻影） 项目的一部分。
// src/embedding.rs - 图像区域嵌入
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

use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};
use tracing::debug;

use crate::cache::Caches;
use crate::config::DetectorConfig;
use crate::error::DetectorError;
use crate::frame::NormalizedFrame;
use crate::geometry::{from_corners, to_corners};
use crate::hash::ImageHash;
use crate::input::LazyImage;
use crate::model::{Backbone, BackboneOutput};

/// 一张图像经过筛选后的候选区域。五个字段长度相同，缓存后不可变。
#[derive(Debug, Clone)]
pub struct RegionSet {
  /// sigmoid 后的 object-ness, `[R]`
  pub objectness: Array1<f32>,
  /// 中心格式框，按 max(宽, 高) 归一化, `[R, 4]`
  pub boxes: Array2<f32>,
  /// 单位长度的类别嵌入, `[R, D]`
  pub class_embeds: Array2<f32>,
  pub logit_shift: Array1<f32>,
  pub logit_scale: Array1<f32>,
}

impl RegionSet {
  pub fn len(&self) -> usize {
    self.objectness.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn embedding_dim(&self) -> usize {
    self.class_embeds.ncols()
  }

  fn select(&self, indices: &[usize]) -> RegionSet {
    RegionSet {
      objectness: self.objectness.select(Axis(0), indices),
      boxes: self.boxes.select(Axis(0), indices),
      class_embeds: self.class_embeds.select(Axis(0), indices),
      logit_shift: self.logit_shift.select(Axis(0), indices),
      logit_scale: self.logit_scale.select(Axis(0), indices),
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 逐行 L2 归一化。零向量保持为零。
fn l2_normalize_rows(embeds: &mut Array2<f32>) {
  for mut row in embeds.axis_iter_mut(Axis(0)) {
    let norm = row.dot(&row).sqrt();
    if norm > 0.0 {
      row.mapv_inplace(|v| v / norm);
    }
  }
}

/// 骨干网络原始输出 -> 缓存用的区域集合。
///
/// 按 object-ness 取前 `max_detections` 个区域，丢弃左上角落在原图外（填充区域内）
/// 的框，并把右下角裁剪到原图范围内。
pub fn postprocess(
  output: BackboneOutput,
  max_detections: usize,
  original: (u32, u32),
) -> RegionSet {
  let BackboneOutput {
    objectness,
    boxes,
    mut class_embeds,
    logit_shift,
    logit_scale,
  } = output;

  let objectness = objectness.mapv(sigmoid);
  l2_normalize_rows(&mut class_embeds);

  let mut order: Vec<usize> = (0..objectness.len()).collect();
  order.sort_by(|&a, &b| objectness[b].total_cmp(&objectness[a]));
  order.truncate(max_detections);

  let regions = RegionSet {
    objectness,
    boxes,
    class_embeds,
    logit_shift,
    logit_scale,
  }
  .select(&order);
  debug!("object-ness 前 {} 个区域保留 {} 个", max_detections, regions.len());

  let (width, height) = (original.0 as f32, original.1 as f32);
  let max_dim = width.max(height);
  let mut corners = to_corners(regions.boxes.view()) * max_dim;

  let valid: Vec<usize> = corners
    .axis_iter(Axis(0))
    .enumerate()
    .filter(|(_, c)| c[0] < width && c[1] < height)
    .map(|(i, _)| i)
    .collect();
  corners = corners.select(Axis(0), &valid);
  for mut c in corners.axis_iter_mut(Axis(0)) {
    c[2] = c[2].min(width);
    c[3] = c[3].min(height);
  }
  corners /= max_dim;

  let mut regions = regions.select(&valid);
  regions.boxes = from_corners(corners.view());
  debug!("边界过滤后剩余 {} 个区域", regions.len());
  regions
}

/// 原图尺寸 (宽, 高)。尺寸缓存命中时不解码图像。
pub fn image_size(caches: &Caches, image: &LazyImage) -> Result<(u32, u32), DetectorError> {
  let hash = image.hash();
  if let Some(size) = caches.image_sizes.get(hash) {
    return Ok(size);
  }
  let size = image.pixels()?.dimensions();
  caches.image_sizes.insert(hash.clone(), size);
  Ok(size)
}

/// 嵌入一张图像并写入缓存，返回图像哈希。已缓存时不调用骨干网络。
pub fn embed_image<B: Backbone>(
  backbone: &B,
  config: &DetectorConfig,
  caches: &Caches,
  image: &LazyImage,
) -> Result<ImageHash, DetectorError> {
  embed_image_regions(backbone, config, caches, image).map(|(hash, _)| hash)
}

/// 同 [`embed_image`]，同时返回区域集合，调用方不必再查一次缓存（期间可能被淘汰）
pub fn embed_image_regions<B: Backbone>(
  backbone: &B,
  config: &DetectorConfig,
  caches: &Caches,
  image: &LazyImage,
) -> Result<(ImageHash, Arc<RegionSet>), DetectorError> {
  let hash = image.hash().clone();
  if let Some(regions) = caches.image_embeds.get(&hash) {
    debug!("图像嵌入缓存命中: {}", hash);
    return Ok((hash, regions));
  }

  let regions = caches.embedding_flights.run(&hash, || -> Result<Arc<RegionSet>, DetectorError> {
    if let Some(regions) = caches.image_embeds.get(&hash) {
      debug!("等待期间图像已被嵌入: {}", hash);
      return Ok(regions);
    }

    let pixels = image.pixels()?;
    let frame = NormalizedFrame::from_image(&pixels, config);

    debug!("执行骨干网络推理: {}", hash);
    let now = std::time::Instant::now();
    let output = backbone
      .forward(frame.as_nchw())
      .map_err(DetectorError::backbone)?;
    output.validate()?;
    debug!(
      "骨干网络推理完成, 原生区域 {} 个, 耗时: {:.2?}",
      output.num_regions(),
      now.elapsed()
    );

    let regions = Arc::new(postprocess(output, config.max_detections, pixels.dimensions()));
    caches.image_sizes.insert(hash.clone(), pixels.dimensions());
    caches.image_embeds.insert(hash.clone(), regions.clone());
    Ok(regions)
  })?;

  Ok((hash, regions))
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  fn raw_output() -> BackboneOutput {
    BackboneOutput {
      objectness: array![0.0f32, 3.0, -2.0, 1.0],
      boxes: array![
        [0.25f32, 0.25, 0.2, 0.2],
        // 右下角超出原图高度，需要裁剪
        [0.5, 0.4, 0.4, 0.4],
        [0.1, 0.1, 0.1, 0.1],
        // 左上角在填充区域
        [0.5, 0.9, 0.2, 0.1],
      ],
      class_embeds: array![[3.0f32, 4.0], [0.0, 2.0], [1.0, 0.0], [0.0, 0.0]],
      logit_shift: array![0.1f32, 0.2, 0.3, 0.4],
      logit_scale: array![1.0f32, 2.0, 3.0, 4.0],
    }
  }

  #[test]
  fn test_top_k_by_objectness() {
    // 100x100 的图像没有任何框会被过滤
    let regions = postprocess(raw_output(), 2, (100, 100));
    assert_eq!(regions.len(), 2);
    assert_eq!(regions.logit_scale, array![2.0f32, 4.0]);
    assert!((regions.objectness[0] - sigmoid(3.0)).abs() < 1e-6);
    assert!(regions.objectness[0] >= regions.objectness[1]);
  }

  #[test]
  fn test_embeddings_are_unit_norm() {
    let regions = postprocess(raw_output(), 10, (100, 100));
    assert_eq!(regions.len(), 4);
    for row in regions.class_embeds.axis_iter(Axis(0)) {
      let norm = row.dot(&row).sqrt();
      assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-6);
    }
    // 排序后第三个区域的原始嵌入为 [3, 4]
    assert!((regions.class_embeds[[2, 0]] - 0.6).abs() < 1e-6);
    assert!((regions.class_embeds[[2, 1]] - 0.8).abs() < 1e-6);
    // 零向量保持为零
    assert_eq!(regions.class_embeds.row(1), array![0.0f32, 0.0]);
  }

  #[test]
  fn test_bounds_filter_and_clip() {
    // 宽 100 高 60, 填充正方形边长 100
    let regions = postprocess(raw_output(), 10, (100, 60));
    assert_eq!(regions.len(), 3);
    assert_eq!(regions.logit_scale, array![2.0f32, 1.0, 3.0]);

    // [0.3, 0.2, 0.7, 0.6] 的右下角 y 被裁剪到 0.6，本身恰好在边界上
    let clipped = regions.boxes.row(0);
    assert!((clipped[0] - 0.5).abs() < 1e-6);
    assert!((clipped[3] - 0.4).abs() < 1e-6);

    let wide = postprocess(raw_output(), 10, (100, 50));
    let clipped = wide.boxes.row(0);
    // 原角点 [0.3, 0.2, 0.7, 0.6] -> [0.3, 0.2, 0.7, 0.5]
    assert!((clipped[1] - 0.35).abs() < 1e-6);
    assert!((clipped[3] - 0.3).abs() < 1e-6);
  }

  #[test]
  fn test_empty_output_is_valid() {
    let output = BackboneOutput {
      objectness: Array1::zeros(0),
      boxes: Array2::zeros((0, 4)),
      class_embeds: Array2::zeros((0, 16)),
      logit_shift: Array1::zeros(0),
      logit_scale: Array1::zeros(0),
    };
    let regions = postprocess(output, 300, (640, 480));
    assert!(regions.is_empty());
    assert_eq!(regions.boxes.dim(), (0, 4));
  }
}
