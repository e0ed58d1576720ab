// 该文件是 Xunying （寻影） 项目的一部分。
// src/output.rs - 检测响应
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

use serde::Serialize;

use crate::scorer::Detection;

/// 像素坐标下的一个检测，(x, y) 为框中心
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionPrediction {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
  pub confidence: f32,
  #[serde(rename = "class")]
  pub class_name: String,
  pub class_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
  pub width: u32,
  pub height: u32,
}

/// 一张图像的检测响应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResponse {
  pub predictions: Vec<DetectionPrediction>,
  pub image: ImageInfo,
}

impl DetectionResponse {
  /// 归一化坐标乘以 max(宽, 高) 还原为像素坐标
  pub fn new(detections: Vec<Detection>, (width, height): (u32, u32)) -> Self {
    let scale = width.max(height) as f32;
    let predictions = detections
      .into_iter()
      .map(|d| DetectionPrediction {
        x: d.x * scale,
        y: d.y * scale,
        width: d.w * scale,
        height: d.h * scale,
        confidence: d.confidence,
        class_name: d.class_name,
        class_id: d.class_id,
      })
      .collect();

    Self {
      predictions,
      image: ImageInfo { width, height },
    }
  }

  pub fn is_empty(&self) -> bool {
    self.predictions.is_empty()
  }
}
