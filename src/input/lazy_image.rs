// 该文件是 Xunying （寻影） 项目的一部分。
// src/input/lazy_image.rs - 延迟解码的图像
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

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use image::RgbImage;
use tracing::debug;

use super::{DefaultImageLoader, ImageLoader, ImageReference};
use crate::cache::lock;
use crate::error::ImageLoadError;
use crate::hash::{ImageHash, hash_bytes, hash_pixels};

/// 图像引用的包装：像素在第一次访问时解码，哈希在第一次访问时用最便宜的表示计算。
///
/// 缓存命中时既不需要下载也不需要解码。
pub struct LazyImage {
  reference: ImageReference,
  loader: Arc<dyn ImageLoader>,
  pixels: OnceLock<Arc<RgbImage>>,
  hash: OnceLock<ImageHash>,
  decoding: Mutex<()>,
}

impl LazyImage {
  pub fn new(reference: impl Into<ImageReference>) -> Self {
    Self::with_loader(reference, Arc::new(DefaultImageLoader))
  }

  pub fn with_loader(reference: impl Into<ImageReference>, loader: Arc<dyn ImageLoader>) -> Self {
    Self {
      reference: reference.into(),
      loader,
      pixels: OnceLock::new(),
      hash: OnceLock::new(),
      decoding: Mutex::new(()),
    }
  }

  pub fn reference(&self) -> &ImageReference {
    &self.reference
  }

  /// 解码后的像素，多线程同时首次访问时只解码一次
  pub fn pixels(&self) -> Result<Arc<RgbImage>, ImageLoadError> {
    if let Some(pixels) = self.pixels.get() {
      return Ok(pixels.clone());
    }

    let _guard = lock(&self.decoding);
    if let Some(pixels) = self.pixels.get() {
      return Ok(pixels.clone());
    }

    let image = match &self.reference {
      ImageReference::Pixels(image) => image.clone(),
      reference => self.loader.load(reference)?,
    };
    debug!("图像解码完成: {}x{}", image.width(), image.height());
    Ok(self.pixels.get_or_init(|| Arc::new(image)).clone())
  }

  /// 内容哈希：URL 直接使用字符串，Base64 与字节哈希压缩数据，像素哈希原始像素
  pub fn hash(&self) -> &ImageHash {
    self.hash.get_or_init(|| match &self.reference {
      ImageReference::Url(url) => ImageHash::from_url(url),
      ImageReference::Base64(payload) => hash_bytes(payload.as_bytes()),
      ImageReference::Bytes(bytes) => hash_bytes(bytes),
      ImageReference::Pixels(image) => hash_pixels(image.width(), image.height(), image.as_raw()),
    })
  }

  pub fn is_decoded(&self) -> bool {
    self.pixels.get().is_some()
  }
}

impl From<ImageReference> for LazyImage {
  fn from(reference: ImageReference) -> Self {
    LazyImage::new(reference)
  }
}

impl fmt::Debug for LazyImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LazyImage")
      .field("kind", &self.reference.kind())
      .field("hash", &self.hash.get())
      .field("decoded", &self.is_decoded())
      .finish()
  }
}
