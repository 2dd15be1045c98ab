// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/input.rs - 视频帧输入
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

use std::path::PathBuf;

use thiserror::Error;

mod dataset;
mod loader;
mod record;
mod transform;

pub use self::dataset::{FrameNaming, TsnDataset, test_indices};
pub use self::loader::PrefetchLoader;
pub use self::record::{VideoRecord, parse_test_list, read_video_names};
pub use self::transform::{
  Cropping, FramePipeline, Normalize, TransformError, fixed_offsets, group_center_crop,
  group_over_sample, group_scale, stack,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("无法读取 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法解码图像 {path}: {source}")]
  Image {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("测试列表第 {line} 行格式错误: {content:?}")]
  MalformedRecord { line: usize, content: String },
  #[error("视频 {index} 预处理失败: {source}")]
  Transform {
    index: usize,
    source: TransformError,
  },
  #[error("视频序号 {index} 超出数据集大小 {len}")]
  IndexOutOfRange { index: usize, len: usize },
  #[error("加载线程在读取视频 {0} 之前退出")]
  WorkerDisconnected(usize),
}
