// 该文件是 Xunying （寻影） 项目的一部分。
// src/config.rs - 检测器配置
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

use std::str::FromStr;

use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, error::ConfigError};

const DEFAULT_IMAGE_SIZE: (u32, u32) = (960, 960);
const DEFAULT_IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const DEFAULT_IMAGE_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];
const DEFAULT_PAD_VALUE: f32 = 0.5;
const DEFAULT_MAX_DETECTIONS: usize = 300;
// 每个区域嵌入集约 300*4KB，1000 条约 400MB
const DEFAULT_IMAGE_EMBED_CACHE_SIZE: usize = 1000;
const DEFAULT_IMAGE_SIZE_CACHE_SIZE: usize = 1000;
// 原型集大小随样本数量变化
const DEFAULT_CLASS_EMBEDDINGS_CACHE_SIZE: usize = 100;

pub const MAX_DETECTIONS_ENV: &str = "MAX_DETECTIONS";

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
  /// 骨干网络输入尺寸 (高, 宽)
  pub image_size: (u32, u32),
  pub image_mean: [f32; 3],
  pub image_std: [f32; 3],
  /// 填充区域的灰度值（归一化前，0~1）
  pub pad_value: f32,
  /// 按 object-ness 保留的最大区域数
  pub max_detections: usize,
  pub image_embed_cache_size: usize,
  pub image_size_cache_size: usize,
  pub class_embeddings_cache_size: usize,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      image_size: DEFAULT_IMAGE_SIZE,
      image_mean: DEFAULT_IMAGE_MEAN,
      image_std: DEFAULT_IMAGE_STD,
      pad_value: DEFAULT_PAD_VALUE,
      max_detections: DEFAULT_MAX_DETECTIONS,
      image_embed_cache_size: DEFAULT_IMAGE_EMBED_CACHE_SIZE,
      image_size_cache_size: DEFAULT_IMAGE_SIZE_CACHE_SIZE,
      class_embeddings_cache_size: DEFAULT_CLASS_EMBEDDINGS_CACHE_SIZE,
    }
  }
}

impl DetectorConfig {
  pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
    self.image_size = (height, width);
    self
  }

  pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
    self.image_mean = mean;
    self.image_std = std;
    self
  }

  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn with_cache_sizes(
    mut self,
    image_embeds: usize,
    image_sizes: usize,
    classes: usize,
  ) -> Self {
    self.image_embed_cache_size = image_embeds;
    self.image_size_cache_size = image_sizes;
    self.class_embeddings_cache_size = classes;
    self
  }

  /// 读取 `MAX_DETECTIONS` 环境变量覆盖默认值
  pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
    if let Ok(value) = std::env::var(MAX_DETECTIONS_ENV) {
      self.max_detections = parse_value(MAX_DETECTIONS_ENV, &value)?;
      debug!("环境变量覆盖 max_detections = {}", self.max_detections);
    }
    Ok(self)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.image_embed_cache_size == 0 {
      return Err(ConfigError::ZeroCapacity("embed_cache"));
    }
    if self.image_size_cache_size == 0 {
      return Err(ConfigError::ZeroCapacity("size_cache"));
    }
    if self.class_embeddings_cache_size == 0 {
      return Err(ConfigError::ZeroCapacity("class_cache"));
    }
    if self.image_size.0 == 0 || self.image_size.1 == 0 {
      return Err(ConfigError::InvalidValue {
        key: "image_size".to_string(),
        value: format!("{}x{}", self.image_size.0, self.image_size.1),
      });
    }
    Ok(())
  }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}

impl FromUrlWithScheme for DetectorConfig {
  const SCHEME: &'static str = "fewshot";
}

impl FromUrl for DetectorConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let mut config = DetectorConfig::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "image_size" => {
          let side = parse_value(&key, &value)?;
          config.image_size = (side, side);
        }
        "max_detections" => config.max_detections = parse_value(&key, &value)?,
        "embed_cache" => config.image_embed_cache_size = parse_value(&key, &value)?,
        "size_cache" => config.image_size_cache_size = parse_value(&key, &value)?,
        "class_cache" => config.class_embeddings_cache_size = parse_value(&key, &value)?,
        _ => warn!("忽略未知配置项: {}={}", key, value),
      }
    }

    config.validate()?;
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_matches_backbone_preprocessing() {
    let config = DetectorConfig::default();
    assert_eq!(config.image_size, (960, 960));
    assert_eq!(config.max_detections, 300);
    assert_eq!(config.image_embed_cache_size, 1000);
    assert_eq!(config.image_size_cache_size, 1000);
    assert_eq!(config.class_embeddings_cache_size, 100);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_from_url() {
    let url =
      Url::parse("fewshot://detector?image_size=64&max_detections=20&class_cache=5&color=red")
        .unwrap();
    let config = DetectorConfig::from_url(&url).unwrap();
    assert_eq!(config.image_size, (64, 64));
    assert_eq!(config.max_detections, 20);
    assert_eq!(config.class_embeddings_cache_size, 5);
    assert_eq!(config.image_embed_cache_size, 1000);
  }

  #[test]
  fn test_from_url_rejects_bad_input() {
    let url = Url::parse("owlv2:///models/owlv2-large-patch14-ensemble").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&url),
      Err(ConfigError::SchemeMismatch { .. })
    ));

    let url = Url::parse("fewshot://detector?max_detections=many").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&url),
      Err(ConfigError::InvalidValue { .. })
    ));

    let url = Url::parse("fewshot://detector?embed_cache=0").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&url),
      Err(ConfigError::ZeroCapacity("embed_cache"))
    ));
  }
}
