// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/bin/fuse_scores.rs - 多模态分数融合
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use ndarray::{Array2, Axis};
use tracing::{info, warn};

use tsneval::{
  metrics::{ConfusionMatrix, argmax},
  output::{ScoreArchive, StoredScores},
};

/// 对多个分数文件（如 RGB 与 Flow）加权融合后统计精度
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// tsn-eval --save-scores 输出的分数文件
  #[arg(value_name = "SCORES", required = true, num_args = 1..)]
  pub scores: Vec<PathBuf>,

  /// 每个分数文件的权重，默认全为 1
  #[arg(long, num_args = 1.., value_name = "W")]
  pub weights: Option<Vec<f32>>,

  /// 融合前先对每个时间段的分数做 softmax
  #[arg(long)]
  pub softmax: bool,
}

/// `(videos, segments, 1, classes)` → 时间段平均后的 `(videos, classes)`
fn video_scores(stored: &StoredScores, softmax: bool) -> Result<Array2<f32>> {
  let mut scores = stored.scores.clone();
  if softmax {
    for mut lane in scores.lanes_mut(Axis(3)) {
      let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
      lane.mapv_inplace(|v| (v - max).exp());
      let sum = lane.sum();
      lane.mapv_inplace(|v| v / sum);
    }
  }
  let mean = scores
    .mean_axis(Axis(1))
    .context("分数文件中没有时间段")?;
  Ok(mean.index_axis_move(Axis(1), 0))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let weights = match args.weights {
    Some(weights) => {
      ensure!(
        weights.len() == args.scores.len(),
        "权重数量 {} 与分数文件数量 {} 不一致",
        weights.len(),
        args.scores.len()
      );
      weights
    }
    None => vec![1.0; args.scores.len()],
  };

  let mut fused: Option<Array2<f32>> = None;
  let mut labels = None;
  for (path, weight) in args.scores.iter().zip(&weights) {
    let stored =
      ScoreArchive::read(path).with_context(|| format!("无法读取 {}", path.display()))?;
    info!(
      "{}: {} 个视频, {} 类, 权重 {}",
      path.display(),
      stored.num_videos(),
      stored.num_classes(),
      weight
    );

    match &labels {
      None => labels = Some(stored.labels.clone()),
      Some(expected) if *expected != stored.labels => {
        bail!("{} 的标签与第一个分数文件不一致", path.display());
      }
      Some(_) => {}
    }

    let scores = video_scores(&stored, args.softmax)? * *weight;
    fused = Some(match fused {
      None => scores,
      Some(acc) => {
        ensure!(
          acc.dim() == scores.dim(),
          "{} 的分数形状 {:?} 与之前的 {:?} 不一致",
          path.display(),
          scores.dim(),
          acc.dim()
        );
        acc + scores
      }
    });
  }

  let (Some(fused), Some(labels)) = (fused, labels) else {
    bail!("没有分数文件");
  };

  let mut matrix = ConfusionMatrix::new(fused.ncols());
  for (row, &label) in fused.rows().into_iter().zip(labels.iter()) {
    let prediction = argmax(row).context("分数为空")?;
    let label = usize::try_from(label).with_context(|| format!("无效标签 {}", label))?;
    matrix.add(label, prediction)?;
  }

  let metrics = matrix.metrics();
  println!("{}", metrics);
  let undefined = metrics.undefined_classes();
  if !undefined.is_empty() {
    warn!("以下类别没有测试样本，未计入平均精度: {:?}", undefined);
  }
  Ok(())
}
