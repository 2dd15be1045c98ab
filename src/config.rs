// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/config.rs - 评测配置
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

use std::{
  fmt,
  path::{Path, PathBuf},
  str::FromStr,
};

use candle_core::Device;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  args::Args,
  checkpoint::{CheckpointError, NamedRemap, PositionalRemap, RemapStrategy},
  model::{Consensus, ResNetConfig, TsnConfig},
};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知数据集: {0}（可选 ucf101 / hmdb51 / kinetics）")]
  UnknownDataset(String),
  #[error("未知模态: {0}（可选 RGB / Flow / RGBDiff）")]
  UnknownModality(String),
  #[error("未知融合方式: {0}（可选 avg / max / topk）")]
  UnknownFusion(String),
  #[error("不支持的网络结构: {0}")]
  UnsupportedArch(String),
  #[error("仅支持 1 或 10 个裁剪，实际为 {0}")]
  UnsupportedCropCount(usize),
  #[error("参数 {name} 无效: {reason}")]
  InvalidValue { name: &'static str, reason: String },
  #[error("参数名映射规则错误: {0}")]
  Remap(#[from] CheckpointError),
}

/// 数据集，决定类别数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
  Ucf101,
  Hmdb51,
  Kinetics,
}

impl DatasetKind {
  pub fn num_classes(self) -> usize {
    match self {
      DatasetKind::Ucf101 => 101,
      DatasetKind::Hmdb51 => 51,
      DatasetKind::Kinetics => 400,
    }
  }
}

impl FromStr for DatasetKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ucf101" => Ok(DatasetKind::Ucf101),
      "hmdb51" => Ok(DatasetKind::Hmdb51),
      "kinetics" => Ok(DatasetKind::Kinetics),
      other => Err(ConfigError::UnknownDataset(other.to_string())),
    }
  }
}

impl fmt::Display for DatasetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DatasetKind::Ucf101 => "ucf101",
      DatasetKind::Hmdb51 => "hmdb51",
      DatasetKind::Kinetics => "kinetics",
    };
    f.write_str(name)
  }
}

/// 输入模态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Modality {
  #[serde(rename = "RGB")]
  Rgb,
  #[serde(rename = "Flow")]
  Flow,
  #[serde(rename = "RGBDiff")]
  RgbDiff,
}

impl Modality {
  /// 单帧图像的通道数
  pub fn channels_per_frame(self) -> usize {
    match self {
      Modality::Rgb | Modality::RgbDiff => 3,
      Modality::Flow => 2,
    }
  }

  /// 每个时间段读取的连续帧数
  pub fn frames_per_segment(self) -> usize {
    match self {
      Modality::Rgb => 1,
      Modality::Flow => 5,
      // 差分需要多读一帧
      Modality::RgbDiff => 6,
    }
  }

  /// 一个帧组的通道数: RGB 3, Flow 10, RGBDiff 18
  pub fn group_length(self) -> usize {
    self.channels_per_frame() * self.frames_per_segment()
  }

  /// 骨干网络第一层卷积的输入通道数
  pub fn backbone_channels(self) -> usize {
    match self {
      Modality::RgbDiff => self.channels_per_frame() * (self.frames_per_segment() - 1),
      _ => self.group_length(),
    }
  }

  /// 归一化用的均值和标准差，按通道循环使用
  pub fn normalization(self) -> (Vec<f32>, Vec<f32>) {
    let std_mean = IMAGENET_STD.iter().sum::<f32>() / IMAGENET_STD.len() as f32;
    match self {
      Modality::Rgb => (IMAGENET_MEAN.to_vec(), IMAGENET_STD.to_vec()),
      Modality::Flow => (vec![0.5], vec![std_mean]),
      Modality::RgbDiff => {
        let diff_channels = self.channels_per_frame() * (self.frames_per_segment() - 1);
        let mut mean = IMAGENET_MEAN.to_vec();
        mean.extend(std::iter::repeat_n(0.0, diff_channels));
        let mut std = IMAGENET_STD.to_vec();
        std.extend(std::iter::repeat_n(std_mean * 2.0, diff_channels));
        (mean, std)
      }
    }
  }
}

impl FromStr for Modality {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "RGB" => Ok(Modality::Rgb),
      "Flow" => Ok(Modality::Flow),
      "RGBDiff" => Ok(Modality::RgbDiff),
      other => Err(ConfigError::UnknownModality(other.to_string())),
    }
  }
}

impl fmt::Display for Modality {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Modality::Rgb => "RGB",
      Modality::Flow => "Flow",
      Modality::RgbDiff => "RGBDiff",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionKind {
  Avg,
  Max,
  TopK,
}

impl FromStr for FusionKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "avg" => Ok(FusionKind::Avg),
      "max" => Ok(FusionKind::Max),
      "topk" => Ok(FusionKind::TopK),
      other => Err(ConfigError::UnknownFusion(other.to_string())),
    }
  }
}

/// 骨干网络结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
  ResNet18,
  ResNet34,
  ResNet50,
  ResNet101,
  ResNet152,
}

impl Arch {
  pub fn backbone(self) -> ResNetConfig {
    match self {
      Arch::ResNet18 => ResNetConfig::resnet18(),
      Arch::ResNet34 => ResNetConfig::resnet34(),
      Arch::ResNet50 => ResNetConfig::resnet50(),
      Arch::ResNet101 => ResNetConfig::resnet101(),
      Arch::ResNet152 => ResNetConfig::resnet152(),
    }
  }
}

impl FromStr for Arch {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "resnet18" => Ok(Arch::ResNet18),
      "resnet34" => Ok(Arch::ResNet34),
      "resnet50" => Ok(Arch::ResNet50),
      "resnet101" => Ok(Arch::ResNet101),
      "resnet152" => Ok(Arch::ResNet152),
      other => Err(ConfigError::UnsupportedArch(other.to_string())),
    }
  }
}

/// 测试时裁剪方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropCount {
  /// 缩放后中心裁剪
  Single,
  /// 四角加中心及其水平翻转
  Ten,
}

impl CropCount {
  pub fn count(self) -> usize {
    match self {
      CropCount::Single => 1,
      CropCount::Ten => 10,
    }
  }
}

impl TryFrom<usize> for CropCount {
  type Error = ConfigError;

  fn try_from(value: usize) -> Result<Self, Self::Error> {
    match value {
      1 => Ok(CropCount::Single),
      10 => Ok(CropCount::Ten),
      other => {
        error!("仅支持 1 或 10 个裁剪，实际为 {}", other);
        Err(ConfigError::UnsupportedCropCount(other))
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChoice {
  Cpu,
  /// 未指定时优先使用 0 号 GPU
  Auto,
  Gpus(Vec<usize>),
}

impl DeviceChoice {
  pub fn select(&self) -> candle_core::Result<Device> {
    match self {
      DeviceChoice::Cpu => Ok(Device::Cpu),
      DeviceChoice::Auto => Device::cuda_if_available(0),
      DeviceChoice::Gpus(ids) => {
        let Some(first) = ids.first() else {
          return Ok(Device::Cpu);
        };
        if ids.len() > 1 {
          warn!("不支持多卡数据并行，仅使用 GPU {}，忽略 {:?}", first, &ids[1..]);
        }
        Device::new_cuda(*first)
      }
    }
  }
}

/// 默认按名字映射；`positional` 选择旧式按位置映射
pub fn remap_strategy(
  positional: bool,
  rules: Option<&Path>,
) -> Result<RemapStrategy, ConfigError> {
  if positional {
    let rule = match rules {
      Some(path) => {
        info!("读取按位置映射的边界: {}", path.display());
        PositionalRemap::from_json_file(path)?
      }
      None => PositionalRemap::default(),
    };
    return Ok(RemapStrategy::Positional(rule));
  }
  match rules {
    Some(path) => {
      info!("读取参数名映射规则: {}", path.display());
      Ok(RemapStrategy::Named(NamedRemap::from_json_file(path)?))
    }
    None => Ok(RemapStrategy::Named(NamedRemap::default())),
  }
}

/// 由命令行参数校验得到的完整评测配置
#[derive(Debug, Clone)]
pub struct EvalConfig {
  pub dataset: DatasetKind,
  pub num_classes: usize,
  pub modality: Modality,
  pub test_list: PathBuf,
  pub weights: PathBuf,
  pub arch: Arch,
  pub save_scores: Option<PathBuf>,
  pub save_features: bool,
  pub save_report: Option<PathBuf>,
  pub test_segments: usize,
  pub max_num: Option<usize>,
  pub crops: CropCount,
  pub input_size: u32,
  pub scale_size: u32,
  pub fusion: Consensus,
  pub dropout: f32,
  pub workers: usize,
  pub device: DeviceChoice,
  pub flow_prefix: String,
  pub root_path: PathBuf,
  pub chunk_size: usize,
  pub checkpoint_key: Option<String>,
  pub remap: RemapStrategy,
}

impl TryFrom<Args> for EvalConfig {
  type Error = ConfigError;

  fn try_from(args: Args) -> Result<Self, Self::Error> {
    // 裁剪数必须在读取任何数据之前校验
    let crops = CropCount::try_from(args.test_crops)?;

    if args.test_segments == 0 {
      return Err(ConfigError::InvalidValue {
        name: "test_segments",
        reason: "至少需要 1 个时间段".to_string(),
      });
    }
    if args.chunk_size == 0 {
      return Err(ConfigError::InvalidValue {
        name: "chunk_size",
        reason: "至少为 1".to_string(),
      });
    }
    if args.input_size == 0 {
      return Err(ConfigError::InvalidValue {
        name: "input_size",
        reason: "必须为正数".to_string(),
      });
    }
    if !(0.0..1.0).contains(&args.dropout) {
      return Err(ConfigError::InvalidValue {
        name: "dropout",
        reason: format!("应在 [0, 1) 内，实际为 {}", args.dropout),
      });
    }

    let fusion = match args.crop_fusion_type {
      FusionKind::Avg => Consensus::Avg,
      FusionKind::Max => Consensus::Max,
      FusionKind::TopK if args.k == 0 => {
        return Err(ConfigError::InvalidValue {
          name: "k",
          reason: "topk 融合需要 k >= 1".to_string(),
        });
      }
      FusionKind::TopK => Consensus::TopK(args.k),
    };

    let remap = remap_strategy(args.positional_remap, args.remap_config.as_deref())?;

    let device = if args.cpu {
      DeviceChoice::Cpu
    } else {
      match args.gpus {
        Some(ids) if !ids.is_empty() => DeviceChoice::Gpus(ids),
        _ => DeviceChoice::Auto,
      }
    };

    Ok(EvalConfig {
      dataset: args.dataset,
      num_classes: args.dataset.num_classes(),
      modality: args.modality,
      test_list: args.test_list,
      weights: args.weights,
      arch: args.arch,
      save_scores: args.save_scores,
      save_features: args.save_features,
      save_report: args.save_report,
      test_segments: args.test_segments,
      max_num: usize::try_from(args.max_num).ok().filter(|&n| n > 0),
      crops,
      input_size: args.input_size,
      scale_size: args.input_size * 256 / 224,
      fusion,
      dropout: args.dropout,
      workers: args.workers,
      device,
      flow_prefix: args.flow_prefix,
      root_path: args.root_path,
      chunk_size: args.chunk_size,
      checkpoint_key: args.checkpoint_key,
      remap,
    })
  }
}

impl EvalConfig {
  pub fn model_config(&self) -> TsnConfig {
    TsnConfig {
      num_classes: self.num_classes,
      modality: self.modality,
      backbone: self.arch.backbone(),
      dropout: self.dropout,
    }
  }
}

#[cfg(test)]
mod tests {
  use clap::Parser;

  use super::*;

  fn parse(extra: &[&str]) -> Args {
    let mut argv = vec!["tsn-eval", "ucf101", "RGB", "test.txt", "weights.pth"];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv).unwrap()
  }

  #[test]
  fn unsupported_crop_count_is_rejected() {
    let err = EvalConfig::try_from(parse(&["--test-crops", "5"])).unwrap_err();
    assert!(matches!(err, ConfigError::UnsupportedCropCount(5)));
    assert!(err.to_string().contains('5'));
  }

  #[test]
  fn crop_counts_one_and_ten_are_accepted() {
    let one = EvalConfig::try_from(parse(&[])).unwrap();
    assert_eq!(one.crops, CropCount::Single);
    let ten = EvalConfig::try_from(parse(&["--test_crops", "10"])).unwrap();
    assert_eq!(ten.crops.count(), 10);
  }

  #[test]
  fn unknown_dataset_fails_to_parse() {
    let res = Args::try_parse_from(["tsn-eval", "imagenet", "RGB", "a", "b"]);
    assert!(res.is_err());
  }

  #[test]
  fn unknown_modality_fails_to_parse() {
    assert!(matches!(
      "Depth".parse::<Modality>(),
      Err(ConfigError::UnknownModality(_))
    ));
    assert!(Args::try_parse_from(["tsn-eval", "ucf101", "rgb", "a", "b"]).is_err());
  }

  #[test]
  fn dataset_sets_class_count() {
    assert_eq!(DatasetKind::Ucf101.num_classes(), 101);
    assert_eq!(DatasetKind::Hmdb51.num_classes(), 51);
    assert_eq!(DatasetKind::Kinetics.num_classes(), 400);
  }

  #[test]
  fn modality_group_lengths() {
    assert_eq!(Modality::Rgb.group_length(), 3);
    assert_eq!(Modality::Flow.group_length(), 10);
    assert_eq!(Modality::RgbDiff.group_length(), 18);
    assert_eq!(Modality::RgbDiff.backbone_channels(), 15);
  }

  #[test]
  fn rgbdiff_normalization_covers_all_channels() {
    let (mean, std) = Modality::RgbDiff.normalization();
    assert_eq!(mean.len(), 18);
    assert_eq!(std.len(), 18);
    assert_eq!(mean[3], 0.0);
  }

  #[test]
  fn negative_max_num_means_all() {
    let config = EvalConfig::try_from(parse(&["--max-num", "-1"])).unwrap();
    assert_eq!(config.max_num, None);
    let config = EvalConfig::try_from(parse(&["--max_num", "7"])).unwrap();
    assert_eq!(config.max_num, Some(7));
  }

  #[test]
  fn topk_fusion_takes_k() {
    let config =
      EvalConfig::try_from(parse(&["--crop-fusion-type", "topk", "--k", "2"])).unwrap();
    assert_eq!(config.fusion, Consensus::TopK(2));
    assert_eq!(config.scale_size, 256);
  }

  #[test]
  fn positional_remap_flag_selects_legacy_rule() {
    let config = EvalConfig::try_from(parse(&["--positional-remap"])).unwrap();
    assert!(matches!(config.remap, RemapStrategy::Positional(_)));
  }

  #[test]
  fn positional_remap_reads_bounds_from_rule_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bounds.json");
    std::fs::write(&path, r#"{ "strip_until": 300, "prefix_len": 6 }"#).unwrap();
    let rule = remap_strategy(true, Some(&path)).unwrap();
    match rule {
      RemapStrategy::Positional(rule) => {
        assert_eq!(rule.verbatim_until, 18);
        assert_eq!(rule.strip_until, 300);
        assert_eq!(rule.prefix_len, 6);
      }
      other => panic!("unexpected rule: {other:?}"),
    }
  }
}
