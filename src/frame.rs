// 该文件是 Xunying （寻影） 项目的一部分。
// src/frame.rs - 骨干网络输入帧
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
use image::imageops::{self, FilterType};
use ndarray::{Array4, ArrayView4};
use tracing::debug;

use crate::config::DetectorConfig;

const RGB_CHANNELS: usize = 3;

/// 归一化后的 NCHW 浮点帧，形状为 `[1, 3, H, W]`
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
  data: Array4<f32>,
  /// 缩放后有效图像区域 (宽, 高)，其余为填充
  content: (u32, u32),
}

impl NormalizedFrame {
  /// 保持宽高比缩放到输入尺寸内，右侧与下方用灰色填充，再按通道做均值方差归一化
  pub fn from_image(image: &RgbImage, config: &DetectorConfig) -> Self {
    let (target_h, target_w) = config.image_size;
    let (width, height) = image.dimensions();

    let ratio = (target_h as f32 / height.max(1) as f32).min(target_w as f32 / width.max(1) as f32);
    let resized_h = ((ratio * height as f32) as u32).clamp(1, target_h);
    let resized_w = ((ratio * width as f32) as u32).clamp(1, target_w);
    debug!(
      "预处理: {}x{} -> {}x{}, 填充到 {}x{}",
      width, height, resized_w, resized_h, target_w, target_h
    );

    let resized = if (resized_w, resized_h) == (width, height) {
      image.clone()
    } else {
      imageops::resize(image, resized_w, resized_h, FilterType::Triangle)
    };

    let mut data = Array4::from_elem(
      (1, RGB_CHANNELS, target_h as usize, target_w as usize),
      config.pad_value,
    );
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..RGB_CHANNELS {
        data[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
      }
    }

    for c in 0..RGB_CHANNELS {
      let mean = config.image_mean[c];
      let std = config.image_std[c];
      data
        .slice_mut(ndarray::s![0, c, .., ..])
        .mapv_inplace(|v| (v - mean) / std);
    }

    Self {
      data,
      content: (resized_w, resized_h),
    }
  }

  pub fn as_nchw(&self) -> ArrayView4<'_, f32> {
    self.data.view()
  }

  pub fn height(&self) -> usize {
    self.data.shape()[2]
  }

  pub fn width(&self) -> usize {
    self.data.shape()[3]
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn content_size(&self) -> (u32, u32) {
    self.content
  }
}
