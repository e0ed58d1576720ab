// 该文件是 Xunying （寻影） 项目的一部分。
// src/lib.rs - 库主文件
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

//! 基于原型嵌入的小样本目标检测。
//!
//! 用户给出少量带框标注（包括显式负样本）的示例图像，检测器从预训练的视觉-语言
//! 检测骨干网络中取出与标注框最匹配的区域嵌入作为类别原型，随后在新图像上按
//! 最近原型相似度对候选区域分类，不需要任何反向传播。

pub mod cache;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod hash;
pub mod input;
pub mod model;
pub mod output;
pub mod prototype;
pub mod scorer;

pub use crate::config::DetectorConfig;
pub use crate::detector::{DEFAULT_CONFIDENCE, DEFAULT_IOU_THRESHOLD, FewShotDetector};
pub use crate::error::{ConfigError, DetectorError, ImageLoadError};
pub use crate::hash::{ImageHash, TrainingDataHash};
pub use crate::input::{DefaultImageLoader, ImageLoader, ImageReference, LazyImage};
pub use crate::model::{Backbone, BackboneOutput, ClassHead, LinearHead};
pub use crate::output::{DetectionPrediction, DetectionResponse, ImageInfo};
pub use crate::prototype::{ClassPrototypeSet, ClassPrototypes, TrainingBox, TrainingImage};
pub use crate::scorer::Detection;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
