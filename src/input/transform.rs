// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/input/transform.rs - 帧组预处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::borrow::Cow;

use image::{DynamicImage, imageops::FilterType};
use thiserror::Error;
use tracing::trace;

use crate::{
  config::CropCount,
  frame::StackedFrames,
};

#[derive(Error, Debug)]
pub enum TransformError {
  #[error("帧组为空")]
  EmptyGroup,
  #[error("裁剪 {crop_width}x{crop_height} 超出图像 {width}x{height}")]
  CropOutOfBounds {
    width: u32,
    height: u32,
    crop_width: u32,
    crop_height: u32,
  },
  #[error("帧组内图像尺寸不一致: {expected:?} 与 {actual:?}")]
  SizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

/// 把短边缩放到 `size`，长边按比例截断取整
pub fn group_scale(group: &[DynamicImage], size: u32) -> Vec<DynamicImage> {
  group
    .iter()
    .map(|image| {
      let (w, h) = (image.width(), image.height());
      if (w <= h && w == size) || (h <= w && h == size) {
        return image.clone();
      }
      let (nw, nh) = if w < h {
        (size, (size as u64 * h as u64 / w as u64) as u32)
      } else {
        ((size as u64 * w as u64 / h as u64) as u32, size)
      };
      image.resize_exact(nw, nh, FilterType::Triangle)
    })
    .collect()
}

/// 奇数余量时取偶数一侧，和银行家舍入一致
fn centered_offset(dim: u32, crop: u32) -> u32 {
  let margin = dim - crop;
  let half = margin / 2;
  if margin % 2 == 0 || half % 2 == 0 {
    half
  } else {
    half + 1
  }
}

fn check_bounds(image: &DynamicImage, crop_w: u32, crop_h: u32) -> Result<(), TransformError> {
  if crop_w > image.width() || crop_h > image.height() {
    return Err(TransformError::CropOutOfBounds {
      width: image.width(),
      height: image.height(),
      crop_width: crop_w,
      crop_height: crop_h,
    });
  }
  Ok(())
}

pub fn group_center_crop(
  group: &[DynamicImage],
  size: u32,
) -> Result<Vec<DynamicImage>, TransformError> {
  group
    .iter()
    .map(|image| {
      check_bounds(image, size, size)?;
      let x = centered_offset(image.width(), size);
      let y = centered_offset(image.height(), size);
      Ok(image.crop_imm(x, y, size, size))
    })
    .collect()
}

/// 四角加中心的裁剪起点
pub fn fixed_offsets(width: u32, height: u32, crop_w: u32, crop_h: u32) -> [(u32, u32); 5] {
  let w_step = width.saturating_sub(crop_w) / 4;
  let h_step = height.saturating_sub(crop_h) / 4;
  [
    (0, 0),
    (4 * w_step, 0),
    (0, 4 * h_step),
    (4 * w_step, 4 * h_step),
    (2 * w_step, 2 * h_step),
  ]
}

/// 十裁剪: 对每个起点先输出整组裁剪，再输出整组水平翻转。
///
/// 光流的 x 分量（组内偶数位置的灰度图）翻转后取反，
/// 保证水平运动方向与翻转后的画面一致。
pub fn group_over_sample(
  group: &[DynamicImage],
  crop: u32,
) -> Result<Vec<DynamicImage>, TransformError> {
  let first = group.first().ok_or(TransformError::EmptyGroup)?;
  let (width, height) = (first.width(), first.height());
  for image in group {
    if (image.width(), image.height()) != (width, height) {
      return Err(TransformError::SizeMismatch {
        expected: (width, height),
        actual: (image.width(), image.height()),
      });
    }
  }
  check_bounds(first, crop, crop)?;

  let mut output = Vec::with_capacity(group.len() * 10);
  for (x, y) in fixed_offsets(width, height, crop, crop) {
    let normal: Vec<DynamicImage> = group
      .iter()
      .map(|image| image.crop_imm(x, y, crop, crop))
      .collect();
    let flipped: Vec<DynamicImage> = normal
      .iter()
      .enumerate()
      .map(|(i, image)| {
        let mut image = image.fliph();
        if image.color().channel_count() == 1 && i % 2 == 0 {
          image.invert();
        }
        image
      })
      .collect();
    output.extend(normal);
    output.extend(flipped);
  }
  Ok(output)
}

/// 按顺序拼接所有图像的通道并除以 255
pub fn stack(group: &[DynamicImage]) -> Result<StackedFrames, TransformError> {
  let first = group.first().ok_or(TransformError::EmptyGroup)?;
  let (width, height) = (first.width() as usize, first.height() as usize);

  let layers: Vec<(usize, Cow<'_, [u8]>)> = group
    .iter()
    .map(|image| {
      if (image.width() as usize, image.height() as usize) != (width, height) {
        return Err(TransformError::SizeMismatch {
          expected: (width as u32, height as u32),
          actual: (image.width(), image.height()),
        });
      }
      Ok(match image {
        DynamicImage::ImageLuma8(img) => (1, Cow::Borrowed(img.as_raw().as_slice())),
        DynamicImage::ImageRgb8(img) => (3, Cow::Borrowed(img.as_raw().as_slice())),
        other => (3, Cow::Owned(other.to_rgb8().into_raw())),
      })
    })
    .collect::<Result<_, _>>()?;

  let channels = layers.iter().map(|(c, _)| c).sum();
  let mut frames = StackedFrames::with_shape(channels, height, width);
  let mut base = 0;
  for (c, bytes) in &layers {
    for k in 0..*c {
      let plane = frames.plane_mut(base + k);
      for (p, v) in plane.iter_mut().enumerate() {
        *v = bytes[p * c + k] as f32 / 255.0;
      }
    }
    base += c;
  }
  Ok(frames)
}

/// 按通道循环使用均值和标准差做归一化
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
  mean: Vec<f32>,
  std: Vec<f32>,
}

impl Normalize {
  pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
    Self { mean, std }
  }

  pub fn apply(&self, frames: &mut StackedFrames) {
    if self.mean.is_empty() || self.std.is_empty() {
      return;
    }
    for channel in 0..frames.channels() {
      let m = self.mean[channel % self.mean.len()];
      let s = self.std[channel % self.std.len()];
      for v in frames.plane_mut(channel) {
        *v = (*v - m) / s;
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cropping {
  /// 缩放到 `scale` 后中心裁剪 `crop`
  Center { scale: u32, crop: u32 },
  /// 缩放到 `scale` 后十裁剪
  OverSample { scale: u32, crop: u32 },
}

impl Cropping {
  pub fn new(crops: CropCount, scale: u32, crop: u32) -> Self {
    match crops {
      CropCount::Single => Cropping::Center { scale, crop },
      CropCount::Ten => Cropping::OverSample { scale, crop },
    }
  }

  pub fn apply(&self, group: &[DynamicImage]) -> Result<Vec<DynamicImage>, TransformError> {
    match *self {
      Cropping::Center { scale, crop } => group_center_crop(&group_scale(group, scale), crop),
      Cropping::OverSample { scale, crop } => group_over_sample(&group_scale(group, scale), crop),
    }
  }
}

/// 裁剪 → 堆叠 → 归一化
#[derive(Debug, Clone)]
pub struct FramePipeline {
  cropping: Cropping,
  normalize: Normalize,
}

impl FramePipeline {
  pub fn new(cropping: Cropping, normalize: Normalize) -> Self {
    Self {
      cropping,
      normalize,
    }
  }

  pub fn apply(&self, group: &[DynamicImage]) -> Result<StackedFrames, TransformError> {
    let cropped = self.cropping.apply(group)?;
    let mut frames = stack(&cropped)?;
    self.normalize.apply(&mut frames);
    trace!(
      "预处理输出: {}x{}x{}",
      frames.channels(),
      frames.height(),
      frames.width()
    );
    Ok(frames)
  }
}
