// 该文件是 Xunying （寻影） 项目的一部分。
// src/model/head.rs - 线性分类头
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

use ndarray::{Array1, Array2, ArrayView2};

use super::ClassHead;
use crate::error::DetectorError;

/// `logits = embeds · weight + bias`
#[derive(Debug, Clone)]
pub struct LinearHead {
  /// `[D, C]`
  weight: Array2<f32>,
  /// `[C]`
  bias: Array1<f32>,
}

impl LinearHead {
  pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, DetectorError> {
    if weight.ncols() != bias.len() {
      return Err(DetectorError::ClassHead(format!(
        "权重列数 {} 与偏置长度 {} 不一致",
        weight.ncols(),
        bias.len()
      )));
    }
    Ok(Self { weight, bias })
  }

  pub fn num_classes(&self) -> usize {
    self.bias.len()
  }
}

impl ClassHead for LinearHead {
  fn logits(&self, embeds: ArrayView2<'_, f32>) -> Result<Array2<f32>, DetectorError> {
    if embeds.ncols() != self.weight.nrows() {
      return Err(DetectorError::ClassHead(format!(
        "嵌入维度 {} 与分类头输入维度 {} 不一致",
        embeds.ncols(),
        self.weight.nrows()
      )));
    }
    Ok(embeds.dot(&self.weight) + &self.bias)
  }
}
