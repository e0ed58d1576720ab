// 该文件是 Xunying （寻影） 项目的一部分。
// src/input/loader.rs - 默认图像加载器
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
use tracing::{debug, error};
use url::Url;

use super::{ImageLoader, ImageReference};
use crate::error::ImageLoadError;

#[cfg(feature = "read_image_file")]
const FILE_SCHEME: &str = "file";
#[cfg(feature = "read_image_file")]
const READ_IMAGE_FILE_SCHEME: &str = "image";
const DATA_SCHEME: &str = "data";

/// 支持本地文件 URL（`file://`、`image://`）、`data:` URL、Base64 与内存字节
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImageLoader;

impl ImageLoader for DefaultImageLoader {
  fn load(&self, reference: &ImageReference) -> Result<RgbImage, ImageLoadError> {
    debug!("加载图像, 类型: {}", reference.kind());
    match reference {
      ImageReference::Url(url) => load_url(url),
      ImageReference::Base64(payload) => decode_base64(payload),
      ImageReference::Bytes(bytes) => Ok(image::load_from_memory(bytes)?.to_rgb8()),
      ImageReference::Pixels(image) => Ok(image.clone()),
    }
  }
}

fn load_url(url: &Url) -> Result<RgbImage, ImageLoadError> {
  match url.scheme() {
    #[cfg(feature = "read_image_file")]
    FILE_SCHEME | READ_IMAGE_FILE_SCHEME => {
      let path = local_path(url)?;
      debug!("读取本地图像: {}", path.display());
      let image = image::ImageReader::open(&path)?
        .with_guessed_format()?
        .decode()?;
      Ok(image.to_rgb8())
    }
    DATA_SCHEME => decode_base64(url.as_str()),
    scheme => {
      error!("不支持的图像 URI 方案: {}", scheme);
      Err(ImageLoadError::UnsupportedScheme(scheme.to_string()))
    }
  }
}

/// URL 路径是百分号编码的，需要解码后才能打开
#[cfg(feature = "read_image_file")]
fn local_path(url: &Url) -> Result<std::path::PathBuf, ImageLoadError> {
  if url.scheme() == FILE_SCHEME {
    return url
      .to_file_path()
      .map_err(|()| ImageLoadError::InvalidPath(url.to_string()));
  }
  let decoded = urlencoding::decode(url.path())
    .map_err(|_| ImageLoadError::InvalidPath(url.to_string()))?;
  Ok(std::path::PathBuf::from(decoded.into_owned()))
}

/// 去掉可选的 `data:<mime>;base64,` 前缀后解码
#[cfg(feature = "base64_input")]
fn decode_base64(payload: &str) -> Result<RgbImage, ImageLoadError> {
  use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

  let encoded = match payload.strip_prefix("data:") {
    Some(rest) => {
      let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| ImageLoadError::InvalidDataUrl(truncate(payload)))?;
      if !header.ends_with(";base64") {
        return Err(ImageLoadError::InvalidDataUrl(truncate(payload)));
      }
      data
    }
    None => payload,
  };

  let bytes = B64.decode(encoded.trim())?;
  Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

#[cfg(not(feature = "base64_input"))]
fn decode_base64(_payload: &str) -> Result<RgbImage, ImageLoadError> {
  Err(ImageLoadError::UnsupportedScheme("base64".to_string()))
}

fn truncate(payload: &str) -> String {
  payload.chars().take(32).collect()
}
