// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use clap::{builder::TypedValueParser, Parser};

use crate::config::{Arch, DatasetKind, FusionKind, Modality};

/// TsnEval 视频级评测参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Standard video-level testing", long_about = None)]
pub struct Args {
  /// 数据集: ucf101 | hmdb51 | kinetics
  #[arg(value_name = "DATASET")]
  pub dataset: DatasetKind,

  /// 输入模态: RGB | Flow | RGBDiff
  #[arg(value_name = "MODALITY")]
  pub modality: Modality,

  /// 测试列表文件，每行: <视频目录> <帧数> <标签>
  #[arg(value_name = "TEST_LIST")]
  pub test_list: PathBuf,

  /// 模型权重文件（.pth / .pt / .safetensors）
  #[arg(value_name = "WEIGHTS")]
  pub weights: PathBuf,

  /// 骨干网络: resnet18 | resnet34 | resnet50 | resnet101 | resnet152
  #[arg(long, default_value = "resnet101", value_name = "ARCH")]
  pub arch: Arch,

  /// 保存按视频名排序后的分数（.npz）
  #[arg(long, alias = "save_scores", value_name = "FILE")]
  pub save_scores: Option<PathBuf>,

  /// 在分数文件中同时保存倒数第二层特征
  #[arg(long, alias = "save_features")]
  pub save_features: bool,

  /// 保存 JSON 格式的指标报告
  #[arg(long, alias = "save_report", value_name = "FILE")]
  pub save_report: Option<PathBuf>,

  /// 每个视频采样的时间段数
  #[arg(long, alias = "test_segments", default_value = "1", value_name = "N")]
  pub test_segments: usize,

  /// 最多评测的视频数（小于等于 0 表示全部）
  #[arg(
    long,
    alias = "max_num",
    default_value = "-1",
    allow_negative_numbers = true,
    value_name = "N"
  )]
  pub max_num: i64,

  /// 测试裁剪数（仅支持 1 或 10）
  #[arg(long, alias = "test_crops", default_value = "1", value_name = "N")]
  pub test_crops: usize,

  /// 网络输入尺寸
  #[arg(long, alias = "input_size", default_value = "224", value_name = "PIXELS")]
  pub input_size: u32,

  /// 裁剪融合方式: avg | max | topk
  ///
  /// 决定同一时间段内各裁剪分数如何合并；时间段之间总是取平均
  #[arg(long, alias = "crop_fusion_type", default_value = "avg", value_name = "TYPE")]
  pub crop_fusion_type: FusionKind,

  /// topk 融合的 k
  #[arg(long, default_value = "3")]
  pub k: usize,

  /// 新分类层之前的 dropout 比例
  #[arg(long, default_value = "0.7")]
  pub dropout: f32,

  /// 数据加载线程数
  #[arg(short = 'j', long, default_value = "4", value_name = "N")]
  pub workers: usize,

  /// 使用的 GPU 编号（仅第一个生效）
  #[arg(long, num_args = 1.., value_name = "ID")]
  pub gpus: Option<Vec<usize>>,

  /// 强制使用 CPU
  #[arg(long, conflicts_with = "gpus")]
  pub cpu: bool,

  /// 光流帧文件名前缀
  #[arg(long, alias = "flow_prefix", default_value = "", value_name = "PREFIX")]
  pub flow_prefix: String,

  /// 视频目录的根路径
  #[arg(
    long,
    alias = "root_path",
    default_value = "",
    value_name = "DIR",
    value_parser = clap::builder::OsStringValueParser::new().map(PathBuf::from)
  )]
  pub root_path: PathBuf,

  /// 单次前向的最大帧组数
  #[arg(long, alias = "chunk_size", default_value = "25", value_name = "N")]
  pub chunk_size: usize,

  /// 权重文件中 state dict 所在的键，例如 state_dict
  #[arg(long, value_name = "KEY")]
  pub checkpoint_key: Option<String>,

  /// JSON 格式的参数名映射规则；与 --positional-remap 同用时为
  /// `verbatim_until` / `strip_until` / `prefix_len` 三个边界
  #[arg(long, value_name = "FILE")]
  pub remap_config: Option<PathBuf>,

  /// 使用按位置的旧式参数名映射
  #[arg(long)]
  pub positional_remap: bool,
}
