// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/frame.rs - 堆叠帧定义
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

use candle_core::{Device, Tensor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 一个视频的全部帧按通道堆叠后的结果，CHW 排列
///
/// 通道顺序为：裁剪 → 时间段 → 段内帧 → 帧内通道。
#[derive(Debug, Clone, PartialEq)]
pub struct StackedFrames {
  data: Box<[f32]>,
  channels: usize,
  height: usize,
  width: usize,
}

impl StackedFrames {
  pub fn with_shape(channels: usize, height: usize, width: usize) -> Self {
    let data = vec![0f32; channels * height * width].into_boxed_slice();
    Self {
      data,
      channels,
      height,
      width,
    }
  }

  pub fn from_vec(
    data: Vec<f32>,
    channels: usize,
    height: usize,
    width: usize,
  ) -> Result<Self, FrameError> {
    let expected = channels * height * width;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      channels,
      height,
      width,
    })
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  /// 第 `channel` 个通道的像素
  pub fn plane(&self, channel: usize) -> &[f32] {
    let size = self.height * self.width;
    &self.data[channel * size..(channel + 1) * size]
  }

  pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
    let size = self.height * self.width;
    &mut self.data[channel * size..(channel + 1) * size]
  }

  /// 转为 `(C, H, W)` 张量
  pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
    Tensor::from_slice(&self.data[..], (self.channels, self.height, self.width), device)
  }
}

impl AsRef<[f32]> for StackedFrames {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

/// 数据集中的一个视频样本
#[derive(Debug, Clone)]
pub struct VideoSample {
  /// 在测试列表中的序号
  pub index: usize,
  pub frames: StackedFrames,
  pub label: usize,
}
