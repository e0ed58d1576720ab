// 该文件是 Xunying （寻影） 项目的一部分。
// src/hash.rs - 内容哈希
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

//! 图像与训练数据的确定性内容哈希，用作各级缓存的键。

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::DetectorError;

/// 标识图像内容的稳定字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageHash(String);

impl ImageHash {
  /// URL 引用直接以 URL 字符串作为哈希，不需要读取内容
  pub fn from_url(url: &url::Url) -> Self {
    ImageHash(url.as_str().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ImageHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// 训练数据缓存键：训练数据摘要加上 `-<iou_threshold>` 后缀
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrainingDataHash(String);

impl TrainingDataHash {
  pub fn new(digest: &str, iou_threshold: f32) -> Self {
    TrainingDataHash(format!("{}-{}", digest, iou_threshold))
  }

  /// 解析外部传入的键（例如上一次请求返回的键）
  pub fn parse(key: &str) -> Result<Self, DetectorError> {
    let hash = TrainingDataHash(key.to_string());
    hash.iou_threshold()?;
    Ok(hash)
  }

  /// 从键的后缀恢复构建原型时使用的 IOU 阈值
  pub fn iou_threshold(&self) -> Result<f32, DetectorError> {
    self
      .0
      .rsplit_once('-')
      .and_then(|(_, suffix)| suffix.parse::<f32>().ok())
      .ok_or_else(|| DetectorError::InvalidTrainingDataHash(self.0.clone()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TrainingDataHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

pub fn hash_bytes(bytes: &[u8]) -> ImageHash {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  ImageHash(format!("{:x}", hasher.finalize()))
}

/// 原始像素的摘要，宽高也参与哈希，避免相同字节不同形状的图像冲突
pub fn hash_pixels(width: u32, height: u32, pixels: &[u8]) -> ImageHash {
  let mut hasher = Sha256::new();
  hasher.update(width.to_le_bytes());
  hasher.update(height.to_le_bytes());
  hasher.update(pixels);
  ImageHash(format!("{:x}", hasher.finalize()))
}

/// 训练数据摘要，按顺序序列化每个样本的 (图像哈希, 标注框列表)。
///
/// 对顺序敏感：同样的样本换一个顺序得到不同的摘要。
pub fn hash_training_data<B: Serialize>(
  entries: &[(ImageHash, &[B])],
) -> Result<String, DetectorError> {
  let payload = serde_json::to_vec(entries)?;
  Ok(hash_bytes(&payload).0)
}
