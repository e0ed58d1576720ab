// 该文件是 Xunying （寻影） 项目的一部分。
// src/input.rs - 图像输入
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

use image::RgbImage;
use serde::Deserialize;
use url::Url;

use crate::error::ImageLoadError;

mod lazy_image;
mod loader;

pub use self::lazy_image::LazyImage;
pub use self::loader::DefaultImageLoader;

/// 图像引用。只有 URL 与 Base64 两种可以从 JSON 反序列化。
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ImageReference {
  /// 远程或本地 URL，哈希时直接使用 URL 字符串
  Url(Url),
  /// Base64 编码的压缩图像，可带 `data:image/...;base64,` 前缀
  Base64(String),
  /// 内存中的压缩图像字节
  #[serde(skip)]
  Bytes(Vec<u8>),
  /// 已解码的 RGB 像素
  #[serde(skip)]
  Pixels(RgbImage),
}

impl ImageReference {
  pub fn kind(&self) -> &'static str {
    match self {
      ImageReference::Url(_) => "url",
      ImageReference::Base64(_) => "base64",
      ImageReference::Bytes(_) => "bytes",
      ImageReference::Pixels(_) => "pixels",
    }
  }
}

impl From<Url> for ImageReference {
  fn from(url: Url) -> Self {
    ImageReference::Url(url)
  }
}

impl From<RgbImage> for ImageReference {
  fn from(image: RgbImage) -> Self {
    ImageReference::Pixels(image)
  }
}

impl From<Vec<u8>> for ImageReference {
  fn from(bytes: Vec<u8>) -> Self {
    ImageReference::Bytes(bytes)
  }
}

/// 把图像引用解码为 RGB 像素。服务层可以提供自己的实现（例如支持 HTTP 下载）。
pub trait ImageLoader: Send + Sync {
  fn load(&self, reference: &ImageReference) -> Result<RgbImage, ImageLoadError>;
}
