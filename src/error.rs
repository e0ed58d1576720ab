// 该文件是 Xunying （寻影） 项目的一部分。
// src/error.rs - 错误类型定义
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

use thiserror::Error;

use crate::hash::{ImageHash, TrainingDataHash};

#[derive(Error, Debug)]
pub enum ImageLoadError {
  #[error("不支持的 URI 方案: {0}")]
  UnsupportedScheme(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  DecodeError(#[from] image::ImageError),
  #[cfg(feature = "base64_input")]
  #[error("Base64 解码错误: {0}")]
  Base64Error(#[from] base64::DecodeError),
  #[error("无效的 data URL: {0}")]
  InvalidDataUrl(String),
  #[error("无法把 URL 转换为本地路径: {0}")]
  InvalidPath(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置 URI 必须使用 {expected} 方案, 实际为 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("配置项 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
  #[error("缓存容量 {0} 必须大于 0")]
  ZeroCapacity(&'static str),
}

#[derive(Error, Debug)]
pub enum DetectorError {
  /// 查询或评分前没有先嵌入图像，属于调用方的错误。
  #[error("图像 {0} 尚未嵌入")]
  NotEmbedded(ImageHash),
  #[error("训练数据 {0} 不在缓存中")]
  UnknownTrainingData(TrainingDataHash),
  #[error("无法从训练数据哈希中解析 IOU 阈值: {0}")]
  InvalidTrainingDataHash(String),
  #[error("骨干网络错误: {0}")]
  Backbone(Box<dyn std::error::Error + Send + Sync>),
  #[error("骨干网络输出格式错误: {0}")]
  MalformedBackboneOutput(String),
  #[error("分类头输出错误: {0}")]
  ClassHead(String),
  #[error("类别 {class_name} 的原型维度为 {found}, 区域嵌入维度为 {expected}")]
  PrototypeDimension {
    class_name: String,
    expected: usize,
    found: usize,
  },
  #[error("图像加载错误: {0}")]
  ImageLoad(#[from] ImageLoadError),
  #[error("训练数据序列化错误: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl DetectorError {
  pub fn backbone<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    DetectorError::Backbone(Box::new(err))
  }

  pub fn malformed(msg: impl Into<String>) -> Self {
    DetectorError::MalformedBackboneOutput(msg.into())
  }
}
