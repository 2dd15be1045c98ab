// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/input/record.rs - 测试列表解析
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::{BufRead, BufReader},
  path::Path,
};

use tracing::debug;

use super::InputError;

/// 测试列表中的一行: `<视频目录> <帧数> <标签>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
  pub path: String,
  pub num_frames: usize,
  pub label: usize,
}

fn parse_line(line_no: usize, line: &str) -> Result<VideoRecord, InputError> {
  let malformed = || InputError::MalformedRecord {
    line: line_no,
    content: line.to_string(),
  };
  let mut tokens = line.split_whitespace();
  let path = tokens.next().ok_or_else(malformed)?;
  let num_frames = tokens
    .next()
    .and_then(|t| t.parse().ok())
    .ok_or_else(malformed)?;
  let label = tokens
    .next()
    .and_then(|t| t.parse().ok())
    .ok_or_else(malformed)?;
  Ok(VideoRecord {
    path: path.to_string(),
    num_frames,
    label,
  })
}

/// 逐行读取非空行，返回 (行号, 内容)
fn non_blank_lines(path: &Path) -> Result<Vec<(usize, String)>, InputError> {
  let io_error = |source| InputError::Io {
    path: path.to_path_buf(),
    source,
  };
  let reader = BufReader::new(File::open(path).map_err(io_error)?);
  let mut lines = Vec::new();
  for (i, line) in reader.lines().enumerate() {
    let line = line.map_err(io_error)?;
    if !line.trim().is_empty() {
      lines.push((i + 1, line));
    }
  }
  Ok(lines)
}

pub fn parse_test_list(path: &Path) -> Result<Vec<VideoRecord>, InputError> {
  let records = non_blank_lines(path)?
    .into_iter()
    .map(|(line_no, line)| parse_line(line_no, &line))
    .collect::<Result<Vec<_>, _>>()?;
  debug!("测试列表 {} 共 {} 个视频", path.display(), records.len());
  Ok(records)
}

/// 每行第一个字段作为视频名，顺序与测试列表一致
pub fn read_video_names(path: &Path) -> Result<Vec<String>, InputError> {
  Ok(
    non_blank_lines(path)?
      .into_iter()
      .filter_map(|(_, line)| line.split_whitespace().next().map(str::to_string))
      .collect(),
  )
}
