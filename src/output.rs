// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{collections::HashMap, path::PathBuf};

use thiserror::Error;
use tracing::error;

pub trait Sink<Context: ?Sized, Output: ?Sized>: Sized {
  type Error;
  fn write_result(&self, context: &Context, result: &Output) -> Result<(), Self::Error>;
}

mod report;
pub use self::report::{JsonReport, MetricsReport};

#[cfg(feature = "save_scores")]
mod scores;
#[cfg(feature = "save_scores")]
pub use self::scores::{ScoreArchive, StoredScores};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("视频名重复: {0}")]
  DuplicateName(String),
  #[error("视频名数量 {names} 少于评测结果数量 {results}")]
  TooFewNames { names: usize, results: usize },
  #[error("无法写入 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("JSON 序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("数组形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[cfg(feature = "save_scores")]
  #[error("写入 npz 错误: {0}")]
  WriteNpz(#[from] ndarray_npy::WriteNpzError),
  #[cfg(feature = "save_scores")]
  #[error("读取 npz 错误: {0}")]
  ReadNpz(#[from] ndarray_npy::ReadNpzError),
  #[error("分数文件缺少数组 {0}")]
  MissingArray(&'static str),
  #[error("没有可保存的结果")]
  Empty,
}

/// 每个名字在排序后名字表中的位置；名字多于结果时截断
pub fn sorted_order(names: &[String], count: usize) -> Result<Vec<usize>, OutputError> {
  if names.len() < count {
    return Err(OutputError::TooFewNames {
      names: names.len(),
      results: count,
    });
  }
  let names = &names[..count];
  let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
  sorted.sort_unstable();

  let mut rank = HashMap::with_capacity(count);
  for (i, name) in sorted.iter().enumerate() {
    if rank.insert(*name, i).is_some() {
      error!("视频名重复: {}", name);
      return Err(OutputError::DuplicateName(name.to_string()));
    }
  }
  Ok(names.iter().map(|name| rank[name.as_str()]).collect())
}

/// 按视频名排序重排: `reordered[order[i]] = items[i]`
pub fn reorder_by_name<T>(names: &[String], items: Vec<T>) -> Result<Vec<T>, OutputError> {
  let order = sorted_order(names, items.len())?;
  let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(items.len()).collect();
  for (item, position) in items.into_iter().zip(order) {
    slots[position] = Some(item);
  }
  Ok(slots.into_iter().flatten().collect())
}
