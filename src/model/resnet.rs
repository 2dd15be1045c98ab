// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/model/resnet.rs - ResNet 骨干网络
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use candle_core::{D, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, batch_norm, conv2d_no_bias};

const BN_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
  /// 两个 3x3 卷积
  Basic,
  /// 1x1 → 3x3 → 1x1，输出通道扩张 4 倍
  Bottleneck,
}

impl BlockKind {
  pub fn expansion(self) -> usize {
    match self {
      BlockKind::Basic => 1,
      BlockKind::Bottleneck => 4,
    }
  }
}

/// ResNet 结构参数，参数命名与 torchvision 一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResNetConfig {
  pub block: BlockKind,
  pub layers: [usize; 4],
  /// 第一层卷积的输出通道数
  pub base_width: usize,
}

impl ResNetConfig {
  pub fn resnet18() -> Self {
    Self {
      block: BlockKind::Basic,
      layers: [2, 2, 2, 2],
      base_width: 64,
    }
  }

  pub fn resnet34() -> Self {
    Self {
      block: BlockKind::Basic,
      layers: [3, 4, 6, 3],
      base_width: 64,
    }
  }

  pub fn resnet50() -> Self {
    Self {
      block: BlockKind::Bottleneck,
      layers: [3, 4, 6, 3],
      base_width: 64,
    }
  }

  pub fn resnet101() -> Self {
    Self {
      block: BlockKind::Bottleneck,
      layers: [3, 4, 23, 3],
      base_width: 64,
    }
  }

  pub fn resnet152() -> Self {
    Self {
      block: BlockKind::Bottleneck,
      layers: [3, 8, 36, 3],
      base_width: 64,
    }
  }

  /// 全局池化后的特征维度
  pub fn feature_dim(&self) -> usize {
    self.base_width * 8 * self.block.expansion()
  }
}

#[derive(Debug, Clone)]
struct ConvBn {
  conv: Conv2d,
  bn: BatchNorm,
}

impl ConvBn {
  #[allow(clippy::too_many_arguments)]
  fn new(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    conv_vb: VarBuilder,
    bn_vb: VarBuilder,
  ) -> Result<Self> {
    let config = Conv2dConfig {
      padding,
      stride,
      ..Default::default()
    };
    let conv = conv2d_no_bias(in_channels, out_channels, kernel, config, conv_vb)?;
    let bn = batch_norm(out_channels, BN_EPS, bn_vb)?;
    Ok(Self { conv, bn })
  }

  fn forward(&self, xs: &Tensor) -> Result<Tensor> {
    xs.apply(&self.conv)?.apply_t(&self.bn, false)
  }
}

#[derive(Debug, Clone)]
struct Block {
  stages: Vec<ConvBn>,
  downsample: Option<ConvBn>,
}

impl Block {
  fn new(
    kind: BlockKind,
    in_channels: usize,
    planes: usize,
    stride: usize,
    vb: VarBuilder,
  ) -> Result<Self> {
    let stages = match kind {
      BlockKind::Basic => vec![
        ConvBn::new(in_channels, planes, 3, stride, 1, vb.pp("conv1"), vb.pp("bn1"))?,
        ConvBn::new(planes, planes, 3, 1, 1, vb.pp("conv2"), vb.pp("bn2"))?,
      ],
      BlockKind::Bottleneck => vec![
        ConvBn::new(in_channels, planes, 1, 1, 0, vb.pp("conv1"), vb.pp("bn1"))?,
        ConvBn::new(planes, planes, 3, stride, 1, vb.pp("conv2"), vb.pp("bn2"))?,
        ConvBn::new(
          planes,
          planes * kind.expansion(),
          1,
          1,
          0,
          vb.pp("conv3"),
          vb.pp("bn3"),
        )?,
      ],
    };

    let out_channels = planes * kind.expansion();
    let downsample = if stride != 1 || in_channels != out_channels {
      let ds = vb.pp("downsample");
      Some(ConvBn::new(
        in_channels,
        out_channels,
        1,
        stride,
        0,
        ds.pp("0"),
        ds.pp("1"),
      )?)
    } else {
      None
    };

    Ok(Self { stages, downsample })
  }

  fn forward(&self, xs: &Tensor) -> Result<Tensor> {
    let last = self.stages.len() - 1;
    let mut ys = xs.clone();
    for (i, stage) in self.stages.iter().enumerate() {
      ys = stage.forward(&ys)?;
      if i != last {
        ys = ys.relu()?;
      }
    }
    let identity = match &self.downsample {
      Some(ds) => ds.forward(xs)?,
      None => xs.clone(),
    };
    (ys + identity)?.relu()
  }
}

/// 去掉最后全连接层的 ResNet，输出全局平均池化后的特征
#[derive(Debug, Clone)]
pub struct ResNet {
  stem: ConvBn,
  layers: Vec<Vec<Block>>,
}

impl ResNet {
  pub fn new(config: &ResNetConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
    let base = config.base_width;
    let stem = ConvBn::new(in_channels, base, 7, 2, 3, vb.pp("conv1"), vb.pp("bn1"))?;

    let mut layers = Vec::with_capacity(config.layers.len());
    let mut channels = base;
    for (i, &depth) in config.layers.iter().enumerate() {
      let planes = base << i;
      let stride = if i == 0 { 1 } else { 2 };
      let layer_vb = vb.pp(format!("layer{}", i + 1));
      let mut blocks = Vec::with_capacity(depth);
      for j in 0..depth {
        let block_stride = if j == 0 { stride } else { 1 };
        blocks.push(Block::new(
          config.block,
          channels,
          planes,
          block_stride,
          layer_vb.pp(j),
        )?);
        channels = planes * config.block.expansion();
      }
      layers.push(blocks);
    }

    Ok(Self { stem, layers })
  }

  /// `(N, C, H, W)` → `(N, feature_dim)`
  pub fn forward_features(&self, xs: &Tensor) -> Result<Tensor> {
    let mut xs = self
      .stem
      .forward(xs)?
      .relu()?
      .pad_with_same(D::Minus1, 1, 1)?
      .pad_with_same(D::Minus2, 1, 1)?
      .max_pool2d_with_stride(3, 2)?;
    for block in self.layers.iter().flatten() {
      xs = block.forward(&xs)?;
    }
    xs.mean_keepdim(D::Minus1)?
      .mean_keepdim(D::Minus2)?
      .flatten_from(1)
  }
}
