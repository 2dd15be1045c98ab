// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tsneval::{
  args::Args,
  checkpoint::Checkpoint,
  config::EvalConfig,
  input::{PrefetchLoader, TsnDataset},
  model::TsnBuilder,
  output::{JsonReport, Sink},
  task::{EvalStep, EvaluateTask, Evaluation, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = EvalConfig::try_from(args)?;

  info!("数据集: {} ({} 类)", config.dataset, config.num_classes);
  info!("模态: {}, 骨干网络: {:?}", config.modality, config.arch);
  info!("测试列表: {}", config.test_list.display());
  info!(
    "时间段: {}, 裁剪: {}, 输入尺寸: {} (缩放 {})",
    config.test_segments,
    config.crops.count(),
    config.input_size,
    config.scale_size
  );

  let device = config.device.select().context("无法初始化计算设备")?;
  info!("计算设备: {:?}", device);

  let checkpoint = Checkpoint::load(&config.weights, config.checkpoint_key.as_deref())?;
  let state = config
    .remap
    .apply(&checkpoint)
    .context("参数名映射失败")?;
  info!("权重 {} 项, 映射后 {} 项", checkpoint.len(), state.len());
  drop(checkpoint);

  let model = TsnBuilder::new(config.model_config())
    .device(device.clone())
    .build(state)
    .with_context(|| format!("无法从 {} 加载模型", config.weights.display()))?;

  let dataset = Arc::new(TsnDataset::from_config(&config)?);
  let loader = PrefetchLoader::new(dataset, config.workers);

  let evaluation = EvaluateTask::new(EvalStep::from_config(&config, device), config.num_classes)
    .with_interrupt()?
    .run_task(loader, &model)?;

  println!("{}", evaluation.metrics);
  let undefined = evaluation.metrics.undefined_classes();
  if !undefined.is_empty() {
    warn!("以下类别没有测试样本，未计入平均精度: {:?}", undefined);
  }
  if evaluation.interrupted {
    warn!("评测被中断，以上结果只包含已完成的视频");
  }

  save_scores(&config, &evaluation)?;

  if let Some(path) = &config.save_report {
    JsonReport::new(path).write_result(&config, &evaluation)?;
  }

  Ok(())
}

#[cfg(feature = "save_scores")]
fn save_scores(config: &EvalConfig, evaluation: &Evaluation) -> Result<()> {
  use tsneval::{input::read_video_names, output::ScoreArchive};

  let Some(path) = &config.save_scores else {
    return Ok(());
  };
  let names = read_video_names(&config.test_list)?;
  ScoreArchive::new(path)
    .with_features(config.save_features)
    .write_result(&names[..], evaluation)
    .with_context(|| format!("无法保存分数到 {}", path.display()))
}

#[cfg(not(feature = "save_scores"))]
fn save_scores(config: &EvalConfig, _evaluation: &Evaluation) -> Result<()> {
  if config.save_scores.is_some() {
    warn!("未启用 save_scores 特性，忽略 --save-scores");
  }
  Ok(())
}
