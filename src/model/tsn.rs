// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/model/tsn.rs - 时段网络定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap, linear};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  checkpoint::{CheckpointError, StateDict},
  config::Modality,
  model::{Model, ResNet, ResNetConfig, TsnOutput},
};

#[derive(Error, Debug)]
pub enum TsnError {
  #[error("张量错误: {0}")]
  Candle(#[from] candle_core::Error),
  #[error("权重与模型不匹配: {0}")]
  Checkpoint(#[from] CheckpointError),
  #[error("参数表锁已损坏")]
  Poisoned,
}

#[derive(Debug, Clone)]
pub struct TsnConfig {
  pub num_classes: usize,
  pub modality: Modality,
  pub backbone: ResNetConfig,
  pub dropout: f32,
}

/// 时段网络：骨干网络 + dropout + 新分类层
///
/// 输入为 `(N, group_length, H, W)` 的帧组，每个帧组独立前向；
/// 裁剪和时间段的融合在评测步骤中完成。
#[derive(Debug, Clone)]
pub struct Tsn {
  modality: Modality,
  base_model: ResNet,
  dropout: Dropout,
  new_fc: Linear,
}

impl Tsn {
  pub fn new(config: &TsnConfig, vb: VarBuilder) -> candle_core::Result<Self> {
    let base_model = ResNet::new(
      &config.backbone,
      config.modality.backbone_channels(),
      vb.pp("base_model"),
    )?;
    let new_fc = linear(
      config.backbone.feature_dim(),
      config.num_classes,
      vb.pp("new_fc"),
    )?;
    Ok(Self {
      modality: config.modality,
      base_model,
      dropout: Dropout::new(config.dropout),
      new_fc,
    })
  }

  /// 把每段连续的 RGB 帧变为相邻帧之差
  fn frame_diff(&self, input: &Tensor) -> candle_core::Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let per_frame = self.modality.channels_per_frame();
    let frames = c / per_frame;
    let xs = input.reshape((n, frames, per_frame, h, w))?;
    let next = xs.narrow(1, 1, frames - 1)?;
    let prev = xs.narrow(1, 0, frames - 1)?;
    (next - prev)?.reshape((n, (frames - 1) * per_frame, h, w))
  }
}

impl Model for Tsn {
  type Input = Tensor;
  type Output = TsnOutput;
  type Error = candle_core::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let xs = match self.modality {
      Modality::RgbDiff => self.frame_diff(input)?,
      Modality::Rgb | Modality::Flow => input.clone(),
    };
    let features = self
      .base_model
      .forward_features(&xs)?
      .apply_t(&self.dropout, false)?;
    let scores = features.apply(&self.new_fc)?;
    debug!("前向输出: 分数 {:?}, 特征 {:?}", scores.dims(), features.dims());
    Ok(TsnOutput { scores, features })
  }
}

pub struct TsnBuilder {
  config: TsnConfig,
  device: Device,
}

impl TsnBuilder {
  pub fn new(config: TsnConfig) -> Self {
    TsnBuilder {
      config,
      device: Device::Cpu,
    }
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  fn construct(&self) -> Result<(Tsn, VarMap), TsnError> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
    let model = Tsn::new(&self.config, vb)?;
    Ok((model, varmap))
  }

  /// 模型声明的全部参数及其形状
  pub fn declared_parameters(&self) -> Result<BTreeMap<String, Vec<usize>>, TsnError> {
    let (_, varmap) = self.construct()?;
    parameter_shapes(&varmap)
  }

  /// 构建模型并载入参数，名字或形状不一致时报错
  pub fn build(self, state: StateDict) -> Result<Tsn, TsnError> {
    info!(
      "构建 TSN 模型: 模态 {}, 类别数 {}, 设备 {:?}",
      self.config.modality, self.config.num_classes, self.device
    );
    let (model, mut varmap) = self.construct()?;
    let declared = parameter_shapes(&varmap)?;
    debug!("模型参数数量: {}", declared.len());

    if let Err(e) = state.validate(&declared) {
      error!("权重校验失败: {}", e);
      return Err(e.into());
    }

    for (name, tensor) in state {
      let tensor = tensor.to_dtype(DType::F32)?.to_device(&self.device)?;
      varmap.set_one(&name, &tensor)?;
    }
    info!("模型加载完成");
    Ok(model)
  }
}

fn parameter_shapes(varmap: &VarMap) -> Result<BTreeMap<String, Vec<usize>>, TsnError> {
  let data = varmap.data().lock().map_err(|_| TsnError::Poisoned)?;
  Ok(
    data
      .iter()
      .map(|(name, var)| (name.clone(), var.dims().to_vec()))
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use crate::{checkpoint::Checkpoint, model::BlockKind};

  use super::*;

  fn tiny_config(modality: Modality) -> TsnConfig {
    TsnConfig {
      num_classes: 5,
      modality,
      backbone: ResNetConfig {
        block: BlockKind::Basic,
        layers: [1, 1, 1, 1],
        base_width: 4,
      },
      dropout: 0.5,
    }
  }

  /// 按模型声明生成一份全为常数的权重
  fn constant_state(config: &TsnConfig, value: f64) -> StateDict {
    let declared = TsnBuilder::new(config.clone())
      .declared_parameters()
      .unwrap();
    let entries = declared
      .into_iter()
      .map(|(name, shape)| {
        let tensor = (Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap() * value).unwrap();
        (name, tensor)
      })
      .collect();
    crate::checkpoint::NamedRemap::default()
      .apply(&Checkpoint::from_entries(entries))
      .unwrap()
  }

  #[test]
  fn declares_new_fc_and_prefixed_backbone() {
    let declared = TsnBuilder::new(tiny_config(Modality::Flow))
      .declared_parameters()
      .unwrap();
    assert_eq!(declared["new_fc.weight"], vec![5, 32]);
    assert_eq!(declared["new_fc.bias"], vec![5]);
    assert_eq!(declared["base_model.conv1.weight"], vec![4, 10, 7, 7]);
    assert!(!declared.keys().any(|name| name.starts_with("base_model.fc")));
  }

  #[test]
  fn infer_returns_scores_and_features() {
    let config = tiny_config(Modality::Rgb);
    let model = TsnBuilder::new(config.clone())
      .build(constant_state(&config, 0.01))
      .unwrap();
    let input = Tensor::rand(0f32, 1f32, (4, 3, 32, 32), &Device::Cpu).unwrap();
    let output = model.infer(&input).unwrap();
    assert_eq!(output.scores.dims(), &[4, 5]);
    assert_eq!(output.features.dims(), &[4, 32]);
  }

  #[test]
  fn rgbdiff_consumes_eighteen_channels() {
    let config = tiny_config(Modality::RgbDiff);
    let model = TsnBuilder::new(config.clone())
      .build(constant_state(&config, 0.01))
      .unwrap();
    let input = Tensor::rand(0f32, 1f32, (2, 18, 32, 32), &Device::Cpu).unwrap();
    let output = model.infer(&input).unwrap();
    assert_eq!(output.scores.dims(), &[2, 5]);
  }

  #[test]
  fn frame_diff_subtracts_previous_frame() {
    let config = tiny_config(Modality::RgbDiff);
    let model = TsnBuilder::new(config.clone())
      .build(constant_state(&config, 0.0))
      .unwrap();
    // 6 帧，每帧 3 通道，第 i 帧的值为 i*i
    let values: Vec<f32> = (0..6)
      .flat_map(|frame| std::iter::repeat_n((frame * frame) as f32, 3))
      .collect();
    let input = Tensor::from_vec(values, (1, 18, 1, 1), &Device::Cpu).unwrap();
    let diff = model.frame_diff(&input).unwrap();
    assert_eq!(diff.dims(), &[1, 15, 1, 1]);
    let diff: Vec<f32> = diff.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(&diff[..3], &[1.0, 1.0, 1.0]);
    assert_eq!(&diff[12..], &[9.0, 9.0, 9.0]);
  }

  #[test]
  fn loaded_weights_replace_initialisation() {
    let config = tiny_config(Modality::Rgb);
    let mut state = constant_state(&config, 0.0);
    let bias = Tensor::new(&[0.0f32, 0.0, 3.0, 0.0, 0.0], &Device::Cpu).unwrap();
    let entries: Vec<(String, Tensor)> = std::mem::take(&mut state)
      .into_iter()
      .map(|(name, tensor)| {
        if name == "new_fc.bias" {
          (name, bias.clone())
        } else {
          (name, tensor)
        }
      })
      .collect();
    let state = crate::checkpoint::NamedRemap::default()
      .apply(&Checkpoint::from_entries(entries))
      .unwrap();
    let model = TsnBuilder::new(config).build(state).unwrap();
    let input = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
    let scores: Vec<Vec<f32>> = model.infer(&input).unwrap().scores.to_vec2().unwrap();
    // 全零权重下分数只剩偏置
    assert_eq!(scores[0], vec![0.0, 0.0, 3.0, 0.0, 0.0]);
  }

  #[test]
  fn build_rejects_shape_mismatch() {
    let config = tiny_config(Modality::Rgb);
    let other = TsnConfig {
      num_classes: 7,
      ..config.clone()
    };
    let err = TsnBuilder::new(config)
      .build(constant_state(&other, 0.0))
      .unwrap_err();
    assert!(matches!(
      err,
      TsnError::Checkpoint(CheckpointError::ShapeMismatch { .. })
    ));
  }
}
