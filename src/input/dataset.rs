// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/input/dataset.rs - 视频帧数据集
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader};
use tracing::{debug, error, info};

use super::{
  InputError,
  record::{VideoRecord, parse_test_list},
  transform::{Cropping, FramePipeline, Normalize},
};
use crate::{
  config::{EvalConfig, Modality},
  frame::VideoSample,
};

/// 帧文件命名规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameNaming {
  /// `{:06}.jpg`
  Rgb,
  /// `{prefix}x_{:05}.jpg` 与 `{prefix}y_{:05}.jpg`
  Flow { prefix: String },
}

impl FrameNaming {
  pub fn for_modality(modality: Modality, flow_prefix: &str) -> Self {
    match modality {
      Modality::Rgb | Modality::RgbDiff => FrameNaming::Rgb,
      Modality::Flow => FrameNaming::Flow {
        prefix: flow_prefix.to_string(),
      },
    }
  }

  /// 第 `index` 帧（从 1 开始）对应的文件名
  pub fn frame_files(&self, index: usize) -> Vec<String> {
    match self {
      FrameNaming::Rgb => vec![format!("{:06}.jpg", index)],
      FrameNaming::Flow { prefix } => vec![
        format!("{}x_{:05}.jpg", prefix, index),
        format!("{}y_{:05}.jpg", prefix, index),
      ],
    }
  }

  fn decode(&self, image: DynamicImage) -> DynamicImage {
    match self {
      FrameNaming::Rgb => DynamicImage::ImageRgb8(image.to_rgb8()),
      FrameNaming::Flow { .. } => DynamicImage::ImageLuma8(image.to_luma8()),
    }
  }
}

/// 测试时各时间段的起始帧（从 1 开始），取每段的中点
pub fn test_indices(num_frames: usize, new_length: usize, segments: usize) -> Vec<usize> {
  let available = (num_frames as f64 - new_length as f64 + 1.0).max(0.0);
  let tick = available / segments as f64;
  (0..segments)
    .map(|x| (tick / 2.0 + tick * x as f64) as usize + 1)
    .collect()
}

pub struct TsnDataset {
  root: PathBuf,
  records: Vec<VideoRecord>,
  num_segments: usize,
  new_length: usize,
  naming: FrameNaming,
  pipeline: FramePipeline,
}

impl TsnDataset {
  pub fn new(
    root: PathBuf,
    records: Vec<VideoRecord>,
    num_segments: usize,
    modality: Modality,
    naming: FrameNaming,
    pipeline: FramePipeline,
  ) -> Self {
    Self {
      root,
      records,
      num_segments,
      new_length: modality.frames_per_segment(),
      naming,
      pipeline,
    }
  }

  pub fn from_config(config: &EvalConfig) -> Result<Self, InputError> {
    let mut records = parse_test_list(&config.test_list)?;
    if let Some(max) = config.max_num {
      records.truncate(max);
    }
    let (mean, std) = config.modality.normalization();
    let pipeline = FramePipeline::new(
      Cropping::new(config.crops, config.scale_size, config.input_size),
      Normalize::new(mean, std),
    );
    info!(
      "数据集: {} 个视频, 每个视频 {} 个时间段, {} 个裁剪",
      records.len(),
      config.test_segments,
      config.crops.count()
    );
    Ok(Self::new(
      config.root_path.clone(),
      records,
      config.test_segments,
      config.modality,
      FrameNaming::for_modality(config.modality, &config.flow_prefix),
      pipeline,
    ))
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  fn load_image(&self, dir: &Path, index: usize) -> Result<Vec<DynamicImage>, InputError> {
    self
      .naming
      .frame_files(index)
      .into_iter()
      .map(|file| {
        let path = dir.join(file);
        let image = ImageReader::open(&path)
          .map_err(|source| InputError::Io {
            path: path.clone(),
            source,
          })?
          .decode()
          .map_err(|source| {
            error!("无法解码帧 {}: {}", path.display(), source);
            InputError::Image {
              path: path.clone(),
              source,
            }
          })?;
        Ok(self.naming.decode(image))
      })
      .collect()
  }

  /// 读取、裁剪并归一化第 `index` 个视频的全部帧
  pub fn get(&self, index: usize) -> Result<VideoSample, InputError> {
    let record = self.records.get(index).ok_or(InputError::IndexOutOfRange {
      index,
      len: self.records.len(),
    })?;
    let dir = self.root.join(&record.path);

    let mut images = Vec::new();
    for offset in test_indices(record.num_frames, self.new_length, self.num_segments) {
      let mut p = offset;
      for _ in 0..self.new_length {
        images.extend(self.load_image(&dir, p)?);
        if p < record.num_frames {
          p += 1;
        }
      }
    }

    let frames = self
      .pipeline
      .apply(&images)
      .map_err(|source| InputError::Transform { index, source })?;
    debug!(
      "视频 {} ({}): {} 张图像 → {} 通道",
      index,
      record.path,
      images.len(),
      frames.channels()
    );
    Ok(VideoSample {
      index,
      frames,
      label: record.label,
    })
  }
}

#[cfg(test)]
mod tests {
  use image::{GrayImage, Luma, Rgb, RgbImage};

  use super::*;
  use crate::config::CropCount;

  #[test]
  fn indices_take_segment_midpoints() {
    assert_eq!(test_indices(10, 1, 2), vec![3, 8]);
    assert_eq!(test_indices(100, 5, 3), vec![17, 49, 81]);
    // 帧数少于段数时重复首帧
    assert_eq!(test_indices(1, 1, 3), vec![1, 1, 1]);
    assert_eq!(test_indices(2, 5, 2), vec![1, 1]);
  }

  #[test]
  fn frame_names_follow_modality() {
    assert_eq!(FrameNaming::Rgb.frame_files(7), vec!["000007.jpg"]);
    let flow = FrameNaming::for_modality(Modality::Flow, "flow_");
    assert_eq!(
      flow.frame_files(12),
      vec!["flow_x_00012.jpg", "flow_y_00012.jpg"]
    );
    assert_eq!(
      FrameNaming::for_modality(Modality::RgbDiff, "ignored"),
      FrameNaming::Rgb
    );
  }

  fn dataset(root: &Path, modality: Modality, segments: usize, crops: CropCount) -> TsnDataset {
    let (mean, std) = modality.normalization();
    TsnDataset::new(
      root.to_path_buf(),
      vec![VideoRecord {
        path: "clip".to_string(),
        num_frames: 4,
        label: 2,
      }],
      segments,
      modality,
      FrameNaming::for_modality(modality, ""),
      FramePipeline::new(Cropping::new(crops, 20, 16), Normalize::new(mean, std)),
    )
  }

  #[test]
  fn rgb_video_stacks_one_frame_per_segment() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("clip");
    std::fs::create_dir(&dir).unwrap();
    for i in 1..=4 {
      RgbImage::from_pixel(24, 20, Rgb([i * 40, 0, 0]))
        .save(dir.join(format!("{:06}.jpg", i)))
        .unwrap();
    }

    let ds = dataset(root.path(), Modality::Rgb, 3, CropCount::Single);
    let sample = ds.get(0).unwrap();
    assert_eq!(sample.label, 2);
    assert_eq!(sample.frames.channels(), 3 * 3);
    assert_eq!((sample.frames.height(), sample.frames.width()), (16, 16));

    let ten = dataset(root.path(), Modality::Rgb, 3, CropCount::Ten);
    assert_eq!(ten.get(0).unwrap().frames.channels(), 10 * 3 * 3);
  }

  #[test]
  fn flow_video_repeats_last_frame() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("clip");
    std::fs::create_dir(&dir).unwrap();
    for i in 1..=4 {
      for axis in ["x", "y"] {
        GrayImage::from_pixel(20, 20, Luma([128]))
          .save(dir.join(format!("{}_{:05}.jpg", axis, i)))
          .unwrap();
      }
    }

    // 4 帧不足 5 帧的窗口，末帧重复使用
    let ds = dataset(root.path(), Modality::Flow, 2, CropCount::Single);
    let sample = ds.get(0).unwrap();
    assert_eq!(sample.frames.channels(), 2 * 10);
  }

  #[test]
  fn missing_frame_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let ds = dataset(root.path(), Modality::Rgb, 1, CropCount::Single);
    assert!(matches!(ds.get(0), Err(InputError::Io { .. })));
    assert!(matches!(
      ds.get(3),
      Err(InputError::IndexOutOfRange { index: 3, len: 1 })
    ));
  }
}
