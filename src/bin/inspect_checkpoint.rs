// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/bin/inspect_checkpoint.rs - 检查权重文件与模型是否匹配
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tsneval::{
  checkpoint::Checkpoint,
  config::{Arch, DatasetKind, Modality, remap_strategy},
  model::{TsnBuilder, TsnConfig},
};

/// 列出权重条目，并检查映射后的参数能否载入指定模型
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 权重文件（.pth / .pt / .safetensors）
  #[arg(value_name = "WEIGHTS")]
  pub weights: PathBuf,

  #[arg(long, default_value = "ucf101")]
  pub dataset: DatasetKind,

  #[arg(long, default_value = "RGB")]
  pub modality: Modality,

  #[arg(long, default_value = "resnet101")]
  pub arch: Arch,

  #[arg(long, value_name = "KEY")]
  pub checkpoint_key: Option<String>,

  #[arg(long, value_name = "FILE")]
  pub remap_config: Option<PathBuf>,

  #[arg(long)]
  pub positional_remap: bool,

  /// 只做校验，不打印条目
  #[arg(short, long)]
  pub quiet: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let checkpoint = Checkpoint::load(&args.weights, args.checkpoint_key.as_deref())?;

  if !args.quiet {
    println!("--- {} 中的条目 ---", args.weights.display());
    for (i, (name, tensor)) in checkpoint.iter().enumerate() {
      println!(
        "{:>5} {:<60} {:?} {:?}",
        i + 1,
        name,
        tensor.dims(),
        tensor.dtype()
      );
    }
    println!("共 {} 项", checkpoint.len());
  }

  let remap = remap_strategy(args.positional_remap, args.remap_config.as_deref())?;
  let state = remap.apply(&checkpoint).context("参数名映射失败")?;
  info!("映射后 {} 项", state.len());

  let builder = TsnBuilder::new(TsnConfig {
    num_classes: args.dataset.num_classes(),
    modality: args.modality,
    backbone: args.arch.backbone(),
    dropout: 0.0,
  });
  let declared = builder.declared_parameters()?;
  info!(
    "模型 {:?} / {} / {} 类声明了 {} 个参数",
    args.arch,
    args.modality,
    args.dataset.num_classes(),
    declared.len()
  );

  match state.validate(&declared) {
    Ok(()) => {
      println!("权重与模型匹配");
      Ok(())
    }
    Err(e) => {
      error!("权重与模型不匹配");
      Err(e.into())
    }
  }
}
