// 该文件是 Xunying （寻影） 项目的一部分。
// src/detector.rs - 小样本检测器
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

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::cache::Caches;
use crate::config::DetectorConfig;
use crate::embedding;
use crate::error::{ConfigError, DetectorError};
use crate::hash::{ImageHash, TrainingDataHash};
use crate::input::{DefaultImageLoader, ImageLoader, ImageReference, LazyImage};
use crate::model::{Backbone, ClassHead};
use crate::output::DetectionResponse;
use crate::prototype::{self, ClassPrototypeSet, MinedTrainingData, QueryEmbeddings, TrainingImage};
use crate::scorer::{self, Detection};

pub const DEFAULT_CONFIDENCE: f32 = 0.99;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;

/// 小样本检测器。持有骨干网络与三个有界缓存，构造一次后以引用方式共享。
pub struct FewShotDetector<B: Backbone> {
  backbone: B,
  config: DetectorConfig,
  loader: Arc<dyn ImageLoader>,
  caches: RwLock<Arc<Caches>>,
}

impl<B: Backbone> FewShotDetector<B> {
  pub fn new(backbone: B, config: DetectorConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    info!(
      "创建小样本检测器: 输入 {}x{}, 每图最多 {} 个区域, 缓存容量 {}/{}/{}",
      config.image_size.1,
      config.image_size.0,
      config.max_detections,
      config.image_embed_cache_size,
      config.image_size_cache_size,
      config.class_embeddings_cache_size
    );
    Ok(Self {
      caches: RwLock::new(Arc::new(Caches::new(&config))),
      backbone,
      config,
      loader: Arc::new(DefaultImageLoader),
    })
  }

  /// 替换 [`FewShotDetector::image`] 使用的图像加载器
  pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
    self.loader = loader;
    self
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn backbone(&self) -> &B {
    &self.backbone
  }

  /// 用检测器的加载器包装一个图像引用
  pub fn image(&self, reference: impl Into<ImageReference>) -> LazyImage {
    LazyImage::with_loader(reference, self.loader.clone())
  }

  /// 当前一代缓存。一次操作从头到尾只使用同一代。
  pub fn caches(&self) -> Arc<Caches> {
    self
      .caches
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 清空全部缓存。之前返回的图像哈希和训练数据键随之失效。
  pub fn reset_cache(&self) {
    let fresh = Arc::new(Caches::new(&self.config));
    *self.caches.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    info!("缓存已重置");
  }

  pub fn compute_image_size(&self, image: &LazyImage) -> Result<(u32, u32), DetectorError> {
    embedding::image_size(&self.caches(), image)
  }

  pub fn embed_image(&self, image: &LazyImage) -> Result<ImageHash, DetectorError> {
    embedding::embed_image(&self.backbone, &self.config, &self.caches(), image)
  }

  /// 查询已嵌入图像中与给定框最匹配的区域嵌入。
  ///
  /// 框为按 max(宽, 高) 归一化的中心格式；`return_missed` 时同时返回未被匹配的区域。
  pub fn embed_query(
    &self,
    query: &[(ImageHash, Vec<[f32; 4]>)],
    iou_threshold: f32,
    return_missed: bool,
  ) -> Result<QueryEmbeddings, DetectorError> {
    prototype::embed_query(&self.caches(), query, iou_threshold, return_missed)
  }

  /// 用给定原型对一张已嵌入的图像评分，返回归一化坐标的检测结果
  pub fn infer_from_embed(
    &self,
    image_hash: &ImageHash,
    prototypes: &ClassPrototypeSet,
    confidence: f32,
    iou_threshold: f32,
  ) -> Result<Vec<Detection>, DetectorError> {
    let regions = self
      .caches()
      .image_embeds
      .get(image_hash)
      .ok_or_else(|| DetectorError::NotEmbedded(image_hash.clone()))?;
    scorer::score_image(&regions, prototypes, confidence, iou_threshold)
  }

  /// 构建训练数据的类别原型并缓存，返回缓存键
  pub fn embed_training_data(
    &self,
    training_data: &[TrainingImage],
    iou_threshold: f32,
  ) -> Result<TrainingDataHash, DetectorError> {
    prototype::build_class_embeddings(
      &self.backbone,
      &self.config,
      &self.caches(),
      training_data,
      iou_threshold,
    )
    .map(|(key, _)| key)
  }

  pub fn class_embeddings(
    &self,
    training_data: &[TrainingImage],
    iou_threshold: f32,
  ) -> Result<Arc<ClassPrototypeSet>, DetectorError> {
    prototype::build_class_embeddings(
      &self.backbone,
      &self.config,
      &self.caches(),
      training_data,
      iou_threshold,
    )
    .map(|(_, prototypes)| prototypes)
  }

  pub fn infer(
    &self,
    images: &[LazyImage],
    training_data: &[TrainingImage],
    confidence: f32,
    iou_threshold: f32,
  ) -> Result<Vec<DetectionResponse>, DetectorError> {
    let caches = self.caches();
    let (key, prototypes) = prototype::build_class_embeddings(
      &self.backbone,
      &self.config,
      &caches,
      training_data,
      iou_threshold,
    )?;
    debug!("训练数据键: {}", key);
    self.score_images(&caches, images, &prototypes, confidence, iou_threshold)
  }

  /// 用之前 [`FewShotDetector::embed_training_data`] 得到的键推理，IoU 阈值取自键的后缀
  pub fn infer_from_training_data_hash(
    &self,
    images: &[LazyImage],
    key: &TrainingDataHash,
    confidence: f32,
  ) -> Result<Vec<DetectionResponse>, DetectorError> {
    let iou_threshold = key.iou_threshold()?;
    let caches = self.caches();
    let prototypes = caches
      .class_embeddings
      .get(key)
      .ok_or_else(|| DetectorError::UnknownTrainingData(key.clone()))?;
    self.score_images(&caches, images, &prototypes, confidence, iou_threshold)
  }

  fn score_images(
    &self,
    caches: &Caches,
    images: &[LazyImage],
    prototypes: &ClassPrototypeSet,
    confidence: f32,
    iou_threshold: f32,
  ) -> Result<Vec<DetectionResponse>, DetectorError> {
    images
      .iter()
      .map(|image| {
        let size = embedding::image_size(caches, image)?;
        let (_, regions) =
          embedding::embed_image_regions(&self.backbone, &self.config, caches, image)?;
        let detections = scorer::score_image(&regions, prototypes, confidence, iou_threshold)?;
        debug!("图像 {}: {} 个检测结果", image.hash(), detections.len());
        Ok(DetectionResponse::new(detections, size))
      })
      .collect()
  }

  pub fn mine_training_data(
    &self,
    training_data: &[TrainingImage],
    iou_threshold: f32,
  ) -> Result<MinedTrainingData, DetectorError> {
    prototype::mine_training_data(
      &self.backbone,
      &self.config,
      &self.caches(),
      training_data,
      iou_threshold,
    )
  }

  /// 用训练好的分类头推理。`class_names` 与分类头的输出列一一对应。
  pub fn infer_via_head<H: ClassHead + ?Sized>(
    &self,
    images: &[LazyImage],
    head: &H,
    class_names: &[String],
    iou_threshold: f32,
  ) -> Result<Vec<DetectionResponse>, DetectorError> {
    let caches = self.caches();
    images
      .iter()
      .map(|image| {
        let size = embedding::image_size(&caches, image)?;
        let (_, regions) =
          embedding::embed_image_regions(&self.backbone, &self.config, &caches, image)?;
        let detections = scorer::score_with_head(&regions, head, class_names, iou_threshold)?;
        Ok(DetectionResponse::new(detections, size))
      })
      .collect()
  }
}
