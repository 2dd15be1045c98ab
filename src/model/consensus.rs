// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/model/consensus.rs - 分数融合
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ndarray::{Array, ArrayView, Axis, RemoveAxis};

/// 多个裁剪（或时间段）的分数融合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consensus {
  Avg,
  Max,
  /// 取最大的 k 个求平均
  TopK(usize),
}

impl Consensus {
  /// 沿第 0 维融合
  pub fn reduce<D: RemoveAxis>(&self, scores: ArrayView<f32, D>) -> Array<f32, D::Smaller> {
    let axis = Axis(0);
    match *self {
      Consensus::Avg => scores
        .mean_axis(axis)
        .unwrap_or_else(|| Array::zeros(scores.raw_dim().remove_axis(axis))),
      Consensus::Max => scores.fold_axis(axis, f32::NEG_INFINITY, |&acc, &v| acc.max(v)),
      Consensus::TopK(k) => scores.map_axis(axis, |lane| {
        let mut values = lane.to_vec();
        values.sort_by(|a, b| b.total_cmp(a));
        let k = k.clamp(1, values.len().max(1));
        values.iter().take(k).sum::<f32>() / k as f32
      }),
    }
  }
}
