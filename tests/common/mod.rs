// 该文件是 Xunying （寻影） 项目的一部分。
// tests/common/mod.rs - 集成测试用的确定性骨干网络
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

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array2, ArrayView4, s};
use thiserror::Error;
use xunying::{
  Backbone, BackboneOutput, DetectorConfig, FewShotDetector, ImageLoadError, ImageLoader,
  ImageReference,
};

pub const SIDE: u32 = 64;
pub const GRAY: Rgb<u8> = Rgb([128, 128, 128]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
/// 红色方块：中心 (24, 24)，边长 16
pub const CAT_BOX: [f32; 4] = [24.0, 24.0, 16.0, 16.0];

const PROPOSAL_SIZES: [usize; 2] = [16, 32];
const STRIDE: usize = 8;

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 以固定网格生成候选框，区域嵌入为框内平均颜色（减去 0.5）加一个常数分量
#[derive(Default)]
pub struct GridBackbone {
  calls: AtomicUsize,
  delay: Option<Duration>,
}

impl GridBackbone {
  pub fn slow(delay: Duration) -> Self {
    Self {
      calls: AtomicUsize::new(0),
      delay: Some(delay),
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Backbone for GridBackbone {
  type Error = MockError;

  fn forward(&self, pixels: ArrayView4<'_, f32>) -> Result<BackboneOutput, Self::Error> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      std::thread::sleep(delay);
    }

    let (_, _, height, width) = pixels.dim();
    let side = height.max(width) as f32;

    let mut rows = Vec::new();
    for size in PROPOSAL_SIZES {
      for y0 in (0..=height.saturating_sub(size)).step_by(STRIDE) {
        for x0 in (0..=width.saturating_sub(size)).step_by(STRIDE) {
          let mut embed = [0.0f32; 4];
          for (c, value) in embed.iter_mut().take(3).enumerate() {
            let window = pixels.slice(s![0, c, y0..y0 + size, x0..x0 + size]);
            *value = window.mean().unwrap_or(0.0) - 0.5;
          }
          embed[3] = 0.05;
          let center = [
            (x0 as f32 + size as f32 / 2.0) / side,
            (y0 as f32 + size as f32 / 2.0) / side,
            size as f32 / side,
            size as f32 / side,
          ];
          rows.push((center, embed));
        }
      }
    }

    let n = rows.len();
    let mut boxes = Array2::zeros((n, 4));
    let mut class_embeds = Array2::zeros((n, 4));
    let mut objectness = Array1::zeros(n);
    for (i, (center, embed)) in rows.into_iter().enumerate() {
      boxes.row_mut(i).assign(&Array1::from(center.to_vec()));
      class_embeds.row_mut(i).assign(&Array1::from(embed.to_vec()));
      objectness[i] = embed[..3].iter().map(|v| v.abs()).sum::<f32>() * 10.0 - 1.0;
    }

    Ok(BackboneOutput {
      objectness,
      boxes,
      class_embeds,
      logit_shift: Array1::zeros(n),
      logit_scale: Array1::ones(n),
    })
  }
}

#[derive(Debug, Error)]
pub enum MockError {
  #[error("设备不可用")]
  DeviceUnavailable,
}

pub struct FailingBackbone;

impl Backbone for FailingBackbone {
  type Error = MockError;

  fn forward(&self, _pixels: ArrayView4<'_, f32>) -> Result<BackboneOutput, Self::Error> {
    Err(MockError::DeviceUnavailable)
  }
}

/// 对任何引用都返回同一张图像，并记录加载次数
pub struct CountingLoader {
  pub image: RgbImage,
  pub loads: AtomicUsize,
}

impl CountingLoader {
  pub fn new(image: RgbImage) -> Arc<Self> {
    Arc::new(Self {
      image,
      loads: AtomicUsize::new(0),
    })
  }

  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }
}

impl ImageLoader for CountingLoader {
  fn load(&self, _reference: &ImageReference) -> Result<RgbImage, ImageLoadError> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    Ok(self.image.clone())
  }
}

pub fn config() -> DetectorConfig {
  DetectorConfig::default()
    .with_image_size(SIDE, SIDE)
    .with_normalization([0.0; 3], [1.0; 3])
    .with_max_detections(100)
}

pub fn detector() -> FewShotDetector<GridBackbone> {
  init_tracing();
  FewShotDetector::new(GridBackbone::default(), config()).expect("有效配置")
}

/// 灰色背景上一个 16x16 的红色方块
pub fn cat_image() -> RgbImage {
  RgbImage::from_fn(SIDE, SIDE, |x, y| {
    if (16..32).contains(&x) && (16..32).contains(&y) {
      RED
    } else {
      GRAY
    }
  })
}

pub fn gray_image() -> RgbImage {
  RgbImage::from_pixel(SIDE, SIDE, GRAY)
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
  let mut bytes = std::io::Cursor::new(Vec::new());
  image
    .write_to(&mut bytes, ImageFormat::Png)
    .expect("PNG 编码");
  bytes.into_inner()
}

/// 像素坐标中心格式框的 IoU
pub fn pixel_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
  xunying::geometry::iou(
    xunying::geometry::box_to_corners(a),
    xunying::geometry::box_to_corners(b),
  )
}
