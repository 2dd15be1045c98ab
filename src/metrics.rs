// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/metrics.rs - 分类精度统计
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

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetricsError {
  #[error("标签 {label} 超出类别范围 0..{num_classes}")]
  LabelOutOfRange { label: usize, num_classes: usize },
  #[error("预测 {prediction} 超出类别范围 0..{num_classes}")]
  PredictionOutOfRange {
    prediction: usize,
    num_classes: usize,
  },
  #[error("分数为空")]
  EmptyScores,
}

/// 第一个最大值的位置
pub fn argmax(scores: ArrayView1<f32>) -> Option<usize> {
  scores
    .iter()
    .enumerate()
    .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
      Some((_, b)) if b >= v => best,
      _ => Some((i, v)),
    })
    .map(|(i, _)| i)
}

/// `(segments, 1, classes)` 的分数先对时间段求平均，再取最大类别
pub fn video_prediction(scores: ArrayView3<f32>) -> Result<usize, MetricsError> {
  let mean = scores.mean_axis(Axis(0)).ok_or(MetricsError::EmptyScores)?;
  let flat = mean
    .into_shape_with_order(scores.shape()[1] * scores.shape()[2])
    .map_err(|_| MetricsError::EmptyScores)?;
  argmax(flat.view()).ok_or(MetricsError::EmptyScores)
}

/// 行为真实类别，列为预测类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
  counts: Array2<u64>,
}

impl ConfusionMatrix {
  pub fn new(num_classes: usize) -> Self {
    Self {
      counts: Array2::zeros((num_classes, num_classes)),
    }
  }

  pub fn from_pairs(
    num_classes: usize,
    labels: &[usize],
    predictions: &[usize],
  ) -> Result<Self, MetricsError> {
    let mut matrix = Self::new(num_classes);
    for (&label, &prediction) in labels.iter().zip(predictions) {
      matrix.add(label, prediction)?;
    }
    Ok(matrix)
  }

  pub fn num_classes(&self) -> usize {
    self.counts.nrows()
  }

  pub fn counts(&self) -> ArrayView2<'_, u64> {
    self.counts.view()
  }

  pub fn total(&self) -> u64 {
    self.counts.sum()
  }

  pub fn add(&mut self, label: usize, prediction: usize) -> Result<(), MetricsError> {
    let num_classes = self.num_classes();
    if label >= num_classes {
      return Err(MetricsError::LabelOutOfRange { label, num_classes });
    }
    if prediction >= num_classes {
      return Err(MetricsError::PredictionOutOfRange {
        prediction,
        num_classes,
      });
    }
    self.counts[[label, prediction]] += 1;
    Ok(())
  }

  /// 每个类别被正确预测的次数
  pub fn class_hits(&self) -> Vec<u64> {
    self.counts.diag().to_vec()
  }

  /// 每个类别的真实样本数
  pub fn class_counts(&self) -> Vec<u64> {
    self.counts.sum_axis(Axis(1)).to_vec()
  }

  /// 对角线除以行和；没有样本的类别为 `None`
  pub fn per_class_accuracy(&self) -> Vec<Option<f64>> {
    self
      .class_hits()
      .into_iter()
      .zip(self.class_counts())
      .map(|(hit, count)| (count > 0).then(|| hit as f64 / count as f64))
      .collect()
  }

  pub fn metrics(&self) -> EvalMetrics {
    let per_class = self.per_class_accuracy();
    let defined: Vec<f64> = per_class.iter().flatten().copied().collect();
    let mean_class_accuracy = if defined.is_empty() {
      0.0
    } else {
      defined.iter().sum::<f64>() / defined.len() as f64
    };
    let total = self.total();
    let top1 = if total == 0 {
      0.0
    } else {
      self.class_hits().iter().sum::<u64>() as f64 / total as f64
    };
    EvalMetrics {
      num_videos: total,
      class_hits: self.class_hits(),
      class_counts: self.class_counts(),
      per_class,
      mean_class_accuracy,
      top1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalMetrics {
  pub num_videos: u64,
  pub class_hits: Vec<u64>,
  pub class_counts: Vec<u64>,
  pub per_class: Vec<Option<f64>>,
  /// 仅对有样本的类别求平均
  pub mean_class_accuracy: f64,
  pub top1: f64,
}

impl EvalMetrics {
  pub fn undefined_classes(&self) -> Vec<usize> {
    self
      .per_class
      .iter()
      .enumerate()
      .filter_map(|(i, acc)| acc.is_none().then_some(i))
      .collect()
  }
}

impl fmt::Display for EvalMetrics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{:>6} {:>8} {:>8} {:>10}", "class", "hit", "count", "accuracy")?;
    for (i, acc) in self.per_class.iter().enumerate() {
      match acc {
        Some(acc) => writeln!(
          f,
          "{:>6} {:>8} {:>8} {:>9.02}%",
          i,
          self.class_hits[i],
          self.class_counts[i],
          acc * 100.0
        )?,
        None => writeln!(
          f,
          "{:>6} {:>8} {:>8} {:>10}",
          i, self.class_hits[i], self.class_counts[i], "undefined"
        )?,
      }
    }
    writeln!(f, "Top-1 {:.02}%", self.top1 * 100.0)?;
    write!(f, "Accuracy {:.02}%", self.mean_class_accuracy * 100.0)
  }
}
