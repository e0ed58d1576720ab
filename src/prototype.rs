// 该文件是 Xunying （寻影） 项目的一部分。
// src/prototype.rs - 类别原型嵌入
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

//! 把用户标注的训练框转换为类别原型嵌入。
//!
//! 每个标注框与该图像缓存的候选区域计算 IoU，取 IoU 最大的区域；最大 IoU 不低于
//! 阈值时，该区域的嵌入按标注框的负样本标记加入对应类别的正/负原型。
//! 面积为零等退化框不做校验，它们与任何区域的 IoU 都很低，只会静默地不起作用。

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::Caches;
use crate::config::DetectorConfig;
use crate::embedding::{RegionSet, embed_image_regions, image_size};
use crate::error::DetectorError;
use crate::geometry::{box_iou, to_corners};
use crate::hash::{ImageHash, TrainingDataHash, hash_training_data};
use crate::input::{ImageReference, LazyImage};
use crate::model::Backbone;

/// 一个标注框，(x, y) 为框中心，像素坐标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
  #[serde(rename = "cls")]
  pub class_name: String,
  #[serde(default)]
  pub negative: bool,
}

impl TrainingBox {
  pub fn positive(class_name: impl Into<String>, x: f32, y: f32, w: f32, h: f32) -> Self {
    Self {
      x,
      y,
      w,
      h,
      class_name: class_name.into(),
      negative: false,
    }
  }

  pub fn negative(class_name: impl Into<String>, x: f32, y: f32, w: f32, h: f32) -> Self {
    Self {
      negative: true,
      ..Self::positive(class_name, x, y, w, h)
    }
  }

  fn normalized(&self, scale: f32) -> [f32; 4] {
    [self.x / scale, self.y / scale, self.w / scale, self.h / scale]
  }
}

/// 一张标注过的训练图像
#[derive(Debug)]
pub struct TrainingImage {
  pub image: LazyImage,
  pub boxes: Vec<TrainingBox>,
}

impl TrainingImage {
  pub fn new(image: impl Into<ImageReference>, boxes: Vec<TrainingBox>) -> Self {
    Self {
      image: LazyImage::new(image),
      boxes,
    }
  }

  pub fn from_lazy(image: LazyImage, boxes: Vec<TrainingBox>) -> Self {
    Self { image, boxes }
  }
}

/// 训练样本的 JSON 形式：`{"image": {"type": "url", "value": ...}, "boxes": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingExample {
  pub image: ImageReference,
  pub boxes: Vec<TrainingBox>,
}

impl From<TrainingExample> for TrainingImage {
  fn from(example: TrainingExample) -> Self {
    TrainingImage::new(example.image, example.boxes)
  }
}

/// 单个类别的原型。没有匹配到任何样本的极性为 `None`。
#[derive(Debug, Clone, Default)]
pub struct ClassPrototypes {
  /// `[P, D]`
  pub positive: Option<Array2<f32>>,
  /// `[N, D]`
  pub negative: Option<Array2<f32>>,
}

/// 类别名 -> 原型，按类别名排序，排序位置即类别下标
#[derive(Debug, Clone, Default)]
pub struct ClassPrototypeSet {
  classes: BTreeMap<String, ClassPrototypes>,
}

impl ClassPrototypeSet {
  pub fn insert(&mut self, class_name: impl Into<String>, prototypes: ClassPrototypes) {
    self.classes.insert(class_name.into(), prototypes);
  }

  pub fn get(&self, class_name: &str) -> Option<&ClassPrototypes> {
    self.classes.get(class_name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassPrototypes)> {
    self.classes.iter().map(|(name, p)| (name.as_str(), p))
  }

  pub fn class_names(&self) -> Vec<String> {
    self.classes.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }
}

fn stack_rows(rows: &[Array1<f32>]) -> Result<Option<Array2<f32>>, DetectorError> {
  if rows.is_empty() {
    return Ok(None);
  }
  let views: Vec<ArrayView1<f32>> = rows.iter().map(|r| r.view()).collect();
  ndarray::stack(Axis(0), &views)
    .map(Some)
    .map_err(|e| DetectorError::malformed(format!("嵌入维度不一致: {}", e)))
}

/// 对每个查询框返回 IoU 最大的区域下标，最大 IoU 低于阈值时为 `None`。
///
/// `query_boxes` 为归一化的中心格式。多个区域 IoU 相同时取下标最小的一个。
pub fn match_boxes(
  regions: &RegionSet,
  query_boxes: ArrayView2<f32>,
  iou_threshold: f32,
) -> Vec<Option<usize>> {
  if regions.is_empty() || query_boxes.nrows() == 0 {
    return vec![None; query_boxes.nrows()];
  }

  let ious = box_iou(
    to_corners(regions.boxes.view()).view(),
    to_corners(query_boxes).view(),
  );

  ious
    .axis_iter(Axis(1))
    .map(|column| {
      let mut best: Option<(usize, f32)> = None;
      for (i, &value) in column.iter().enumerate() {
        if best.is_none_or(|(_, b)| value > b) {
          best = Some((i, value));
        }
      }
      best.and_then(|(i, value)| (value >= iou_threshold).then_some(i))
    })
    .collect()
}

/// 查询结果：匹配上的区域嵌入，以及（可选）从未被匹配的区域嵌入（隐式背景负样本）
#[derive(Debug, Clone, Default)]
pub struct QueryEmbeddings {
  pub matched: Option<Array2<f32>>,
  pub missed: Option<Array2<f32>>,
}

/// 按图像查询标注框对应的区域嵌入。图像必须已经嵌入，否则返回 `NotEmbedded`。
pub fn embed_query(
  caches: &Caches,
  query: &[(ImageHash, Vec<[f32; 4]>)],
  iou_threshold: f32,
  return_missed: bool,
) -> Result<QueryEmbeddings, DetectorError> {
  let mut matched = Vec::new();
  let mut missed = Vec::new();

  for (image_hash, boxes) in query {
    let regions = caches
      .image_embeds
      .get(image_hash)
      .ok_or_else(|| DetectorError::NotEmbedded(image_hash.clone()))?;

    let query_boxes = boxes_to_array(boxes);
    let matches = match_boxes(&regions, query_boxes.view(), iou_threshold);
    let mut selected = vec![false; regions.len()];
    for i in matches.into_iter().flatten() {
      selected[i] = true;
      matched.push(regions.class_embeds.row(i).to_owned());
    }

    if return_missed {
      missed.extend(
        selected
          .iter()
          .enumerate()
          .filter(|(_, s)| !**s)
          .map(|(i, _)| regions.class_embeds.row(i).to_owned()),
      );
    }
  }

  Ok(QueryEmbeddings {
    matched: stack_rows(&matched)?,
    missed: if return_missed { stack_rows(&missed)? } else { None },
  })
}

fn boxes_to_array(boxes: &[[f32; 4]]) -> Array2<f32> {
  let mut out = Array2::zeros((boxes.len(), 4));
  for (mut row, b) in out.axis_iter_mut(Axis(0)).zip(boxes) {
    row.assign(&ArrayView1::from(&b[..]));
  }
  out
}

/// 训练数据的缓存键：按顺序哈希 (图像哈希, 标注框)，再附加 IoU 阈值
pub fn training_data_hash(
  training_data: &[TrainingImage],
  iou_threshold: f32,
) -> Result<TrainingDataHash, DetectorError> {
  let entries: Vec<(ImageHash, &[TrainingBox])> = training_data
    .iter()
    .map(|t| (t.image.hash().clone(), t.boxes.as_slice()))
    .collect();
  let digest = hash_training_data(&entries)?;
  Ok(TrainingDataHash::new(&digest, iou_threshold))
}

/// 嵌入一张训练图像并把标注框与区域逐一配对
fn match_training_image<B: Backbone>(
  backbone: &B,
  config: &DetectorConfig,
  caches: &Caches,
  training_image: &TrainingImage,
  iou_threshold: f32,
) -> Result<(Arc<RegionSet>, Vec<Option<usize>>), DetectorError> {
  let (_, regions) = embed_image_regions(backbone, config, caches, &training_image.image)?;
  let (width, height) = image_size(caches, &training_image.image)?;
  let scale = width.max(height) as f32;

  let coords: Vec<[f32; 4]> = training_image
    .boxes
    .iter()
    .map(|b| b.normalized(scale))
    .collect();
  let matches = match_boxes(&regions, boxes_to_array(&coords).view(), iou_threshold);
  Ok((regions, matches))
}

/// 构建（或复用缓存的）类别原型，返回缓存键
pub fn build_class_embeddings<B: Backbone>(
  backbone: &B,
  config: &DetectorConfig,
  caches: &Caches,
  training_data: &[TrainingImage],
  iou_threshold: f32,
) -> Result<(TrainingDataHash, Arc<ClassPrototypeSet>), DetectorError> {
  let key = training_data_hash(training_data, iou_threshold)?;
  if let Some(prototypes) = caches.class_embeddings.get(&key) {
    debug!("类别原型缓存命中: {}", key);
    return Ok((key, prototypes));
  }

  let prototypes = caches.training_flights.run(
    &key,
    || -> Result<Arc<ClassPrototypeSet>, DetectorError> {
      if let Some(prototypes) = caches.class_embeddings.get(&key) {
        return Ok(prototypes);
      }

      let mut lists: BTreeMap<String, (Vec<Array1<f32>>, Vec<Array1<f32>>)> = BTreeMap::new();
      let mut total_boxes = 0usize;
      let mut total_matches = 0usize;

      for training_image in training_data {
        let (regions, matches) =
          match_training_image(backbone, config, caches, training_image, iou_threshold)?;
        total_boxes += training_image.boxes.len();

        for (training_box, matched) in training_image.boxes.iter().zip(matches) {
          let Some(index) = matched else {
            warn!(
              "标注框 {:?} 没有 IoU 不低于 {} 的候选区域, 已忽略",
              training_box, iou_threshold
            );
            continue;
          };
          total_matches += 1;
          let embedding = regions.class_embeds.row(index).to_owned();
          let (positive, negative) = lists.entry(training_box.class_name.clone()).or_default();
          if training_box.negative {
            negative.push(embedding);
          } else {
            positive.push(embedding);
          }
        }
      }
      debug!("标注框总数: {}, 匹配数: {}", total_boxes, total_matches);

      let mut prototypes = ClassPrototypeSet::default();
      for (class_name, (positive, negative)) in lists {
        prototypes.insert(
          class_name,
          ClassPrototypes {
            positive: stack_rows(&positive)?,
            negative: stack_rows(&negative)?,
          },
        );
      }

      let prototypes = Arc::new(prototypes);
      caches.class_embeddings.insert(key.clone(), prototypes.clone());
      Ok(prototypes)
    },
  )?;

  Ok((key, prototypes))
}

/// 训练数据挖掘结果：每个类别匹配到的嵌入，以及所有图像中未被匹配的区域嵌入
#[derive(Debug, Clone, Default)]
pub struct MinedTrainingData {
  pub class_examples: BTreeMap<String, Array2<f32>>,
  pub background: Option<Array2<f32>>,
}

/// 为训练新的分类头准备样本：匹配上的区域作为对应类别的样本，其余区域作为背景
pub fn mine_training_data<B: Backbone>(
  backbone: &B,
  config: &DetectorConfig,
  caches: &Caches,
  training_data: &[TrainingImage],
  iou_threshold: f32,
) -> Result<MinedTrainingData, DetectorError> {
  let mut class_lists: BTreeMap<String, Vec<Array1<f32>>> = BTreeMap::new();
  let mut misses = Vec::new();

  for training_image in training_data {
    let (regions, matches) =
      match_training_image(backbone, config, caches, training_image, iou_threshold)?;

    let mut selected = vec![false; regions.len()];
    for (training_box, matched) in training_image.boxes.iter().zip(matches) {
      if let Some(index) = matched {
        selected[index] = true;
        class_lists
          .entry(training_box.class_name.clone())
          .or_default()
          .push(regions.class_embeds.row(index).to_owned());
      }
    }

    misses.extend(
      selected
        .iter()
        .enumerate()
        .filter(|(_, s)| !**s)
        .map(|(i, _)| regions.class_embeds.row(i).to_owned()),
    );
    debug!(
      "挖掘: 匹配 {} 个区域, 背景 {} 个区域",
      selected.iter().filter(|s| **s).count(),
      selected.iter().filter(|s| !**s).count()
    );
  }

  let mut class_examples = BTreeMap::new();
  for (class_name, rows) in class_lists {
    if let Some(stacked) = stack_rows(&rows)? {
      class_examples.insert(class_name, stacked);
    }
  }

  Ok(MinedTrainingData {
    class_examples,
    background: stack_rows(&misses)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  fn regions() -> RegionSet {
    RegionSet {
      objectness: array![0.9f32, 0.8, 0.7],
      boxes: array![
        [0.25f32, 0.25, 0.5, 0.5],
        [0.75, 0.75, 0.5, 0.5],
        // 与第一个区域完全相同，用于检查同分取第一个
        [0.25, 0.25, 0.5, 0.5],
      ],
      class_embeds: array![[1.0f32, 0.0], [0.0, 1.0], [0.6, 0.8]],
      logit_shift: array![0.0f32, 0.0, 0.0],
      logit_scale: array![1.0f32, 1.0, 1.0],
    }
  }

  #[test]
  fn test_match_boxes_threshold_and_ties() {
    let query = array![
      [0.25f32, 0.25, 0.5, 0.5],
      [0.75, 0.75, 0.4, 0.4],
      [0.5, 0.5, 0.1, 0.1],
    ];
    let matches = match_boxes(&regions(), query.view(), 0.5);
    assert_eq!(matches, vec![Some(0), Some(1), None]);
  }

  #[test]
  fn test_match_boxes_empty_inputs() {
    let empty = RegionSet {
      objectness: Array1::zeros(0),
      boxes: Array2::zeros((0, 4)),
      class_embeds: Array2::zeros((0, 2)),
      logit_shift: Array1::zeros(0),
      logit_scale: Array1::zeros(0),
    };
    let query = array![[0.5f32, 0.5, 0.1, 0.1]];
    assert_eq!(match_boxes(&empty, query.view(), 0.1), vec![None]);
    assert!(match_boxes(&regions(), Array2::zeros((0, 4)).view(), 0.1).is_empty());
  }

  #[test]
  fn test_embed_query_requires_embedding() {
    let caches = Caches::new(&DetectorConfig::default());
    let hash = crate::hash::hash_bytes(b"never embedded");
    let result = embed_query(&caches, &[(hash, vec![[0.5, 0.5, 0.1, 0.1]])], 0.3, false);
    assert!(matches!(result, Err(DetectorError::NotEmbedded(_))));
  }

  #[test]
  fn test_embed_query_matched_and_missed() {
    let caches = Caches::new(&DetectorConfig::default());
    let hash = crate::hash::hash_bytes(b"image");
    caches.image_embeds.insert(hash.clone(), Arc::new(regions()));

    let query = vec![(hash.clone(), vec![[0.25, 0.25, 0.5, 0.5], [0.5, 0.5, 0.01, 0.01]])];
    let result = embed_query(&caches, &query, 0.5, true).unwrap();
    assert_eq!(result.matched.unwrap(), array![[1.0f32, 0.0]]);
    assert_eq!(result.missed.unwrap(), array![[0.0f32, 1.0], [0.6, 0.8]]);

    let nothing = vec![(hash, vec![[0.5, 0.5, 0.01, 0.01]])];
    let result = embed_query(&caches, &nothing, 0.5, false).unwrap();
    assert!(result.matched.is_none());
    assert!(result.missed.is_none());
  }

  #[test]
  fn test_training_box_json() {
    let json = r#"{"x": 10, "y": 20, "w": 5, "h": 6, "cls": "cat"}"#;
    let parsed: TrainingBox = serde_json::from_str(json).unwrap();
    assert_eq!(parsed, TrainingBox::positive("cat", 10.0, 20.0, 5.0, 6.0));

    let json = r#"{"image": {"type": "url", "value": "https://example.com/a.png"},
                   "boxes": [{"x": 1, "y": 2, "w": 3, "h": 4, "cls": "dog", "negative": true}]}"#;
    let example: TrainingExample = serde_json::from_str(json).unwrap();
    assert!(example.boxes[0].negative);
    assert!(matches!(example.image, ImageReference::Url(_)));
  }

  #[test]
  fn test_training_data_hash_depends_on_order_and_threshold() {
    let a = || TrainingImage::new(url::Url::parse("https://example.com/a.png").unwrap(), vec![
      TrainingBox::positive("cat", 1.0, 2.0, 3.0, 4.0),
    ]);
    let b = || TrainingImage::new(url::Url::parse("https://example.com/b.png").unwrap(), vec![
      TrainingBox::negative("cat", 1.0, 2.0, 3.0, 4.0),
    ]);

    let forward = training_data_hash(&[a(), b()], 0.3).unwrap();
    assert_eq!(forward, training_data_hash(&[a(), b()], 0.3).unwrap());
    assert_ne!(forward, training_data_hash(&[b(), a()], 0.3).unwrap());
    assert_ne!(forward, training_data_hash(&[a(), b()], 0.4).unwrap());
    assert_eq!(forward.iou_threshold().unwrap(), 0.3);
  }
}
