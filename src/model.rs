// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use candle_core::Tensor;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

impl<M: Model> Model for &M {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

/// 一次前向的结果：分类分数和倒数第二层特征一并返回
#[derive(Debug, Clone)]
pub struct TsnOutput {
  /// `(N, num_classes)`
  pub scores: Tensor,
  /// `(N, feature_dim)`
  pub features: Tensor,
}

mod consensus;
mod resnet;
mod tsn;

pub use self::consensus::Consensus;
pub use self::resnet::{BlockKind, ResNet, ResNetConfig};
pub use self::tsn::{Tsn, TsnBuilder, TsnConfig, TsnError};
