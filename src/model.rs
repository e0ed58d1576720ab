// 该文件是 Xunying （寻影） 项目的一部分。
// src/model.rs - 模型接口
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

use ndarray::{Array1, Array2, ArrayView2, ArrayView4};

use crate::error::DetectorError;

mod head;
pub use self::head::LinearHead;

/// 视觉-语言检测骨干网络。调用之间无状态。
pub trait Backbone: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 输入为归一化后的 `[1, 3, H, W]` 张量
  fn forward(&self, pixels: ArrayView4<'_, f32>) -> Result<BackboneOutput, Self::Error>;
}

/// 骨干网络对每个原生区域的原始输出，R 为区域数，D 为嵌入维度
#[derive(Debug, Clone)]
pub struct BackboneOutput {
  /// object-ness logits, `[R]`
  pub objectness: Array1<f32>,
  /// 中心格式框，按填充后正方形边长归一化, `[R, 4]`
  pub boxes: Array2<f32>,
  /// 未归一化的类别嵌入, `[R, D]`
  pub class_embeds: Array2<f32>,
  pub logit_shift: Array1<f32>,
  pub logit_scale: Array1<f32>,
}

impl BackboneOutput {
  pub fn num_regions(&self) -> usize {
    self.objectness.len()
  }

  pub fn validate(&self) -> Result<(), DetectorError> {
    let regions = self.num_regions();
    if self.boxes.dim() != (regions, 4) {
      return Err(DetectorError::malformed(format!(
        "预期框张量形状为 [{}, 4], 实际为 {:?}",
        regions,
        self.boxes.shape()
      )));
    }
    if self.class_embeds.nrows() != regions {
      return Err(DetectorError::malformed(format!(
        "预期 {} 个类别嵌入, 实际为 {}",
        regions,
        self.class_embeds.nrows()
      )));
    }
    if self.logit_shift.len() != regions || self.logit_scale.len() != regions {
      return Err(DetectorError::malformed(format!(
        "预期 {} 个校准参数, 实际为 shift={}, scale={}",
        regions,
        self.logit_shift.len(),
        self.logit_scale.len()
      )));
    }
    Ok(())
  }
}

/// 在区域嵌入上训练得到的分类头，输出每个区域对每个类别的 logits `[R, C]`
pub trait ClassHead {
  /// 嵌入维度与分类头不一致时返回 [`DetectorError::ClassHead`]
  fn logits(&self, embeds: ArrayView2<'_, f32>) -> Result<Array2<f32>, DetectorError>;
}
