// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/checkpoint.rs - 模型权重读取
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
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use candle_core::{Device, Tensor, pickle};
use thiserror::Error;
use tracing::{debug, info, warn};

mod remap;
pub use self::remap::{NamedRemap, PositionalRemap, RemapStrategy};

#[derive(Error, Debug)]
pub enum CheckpointError {
  #[error("无法读取权重文件 {path}: {source}")]
  Load {
    path: PathBuf,
    source: candle_core::Error,
  },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("映射规则解析失败: {0}")]
  RemapConfig(#[from] serde_json::Error),
  #[error("权重中缺少必需的键: {0}")]
  MissingKey(String),
  #[error("参数 {first} 与 {second} 映射到同一个名字 {target}")]
  DuplicateTarget {
    target: String,
    first: String,
    second: String,
  },
  #[error("模型缺少以下参数: {0:?}")]
  MissingParameters(Vec<String>),
  #[error("权重中存在模型未声明的参数: {0:?}")]
  UnexpectedKeys(Vec<String>),
  #[error("参数 {name} 形状不匹配: 模型为 {expected:?}, 权重为 {actual:?}")]
  ShapeMismatch {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("张量错误: {0}")]
  Candle(#[from] candle_core::Error),
}

const DEFAULT_STATE_KEY: &str = "state_dict";

/// 按保存顺序排列的权重条目
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
  entries: Vec<(String, Tensor)>,
}

impl Checkpoint {
  /// 读取权重文件
  ///
  /// `.safetensors` 不保存写入顺序，条目按名字排序；其余格式视为 PyTorch pickle，
  /// 保持 state dict 的保存顺序。`key` 用于读取嵌套在某个键（如 `state_dict`）下的参数。
  pub fn load(path: &Path, key: Option<&str>) -> Result<Self, CheckpointError> {
    info!("加载权重文件: {}", path.display());
    let is_safetensors = path
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    let entries = if is_safetensors {
      let tensors =
        candle_core::safetensors::load(path, &Device::Cpu).map_err(|source| {
          CheckpointError::Load {
            path: path.to_path_buf(),
            source,
          }
        })?;
      let mut entries: Vec<_> = tensors.into_iter().collect();
      entries.sort_by(|a, b| a.0.cmp(&b.0));
      entries
    } else {
      read_pickle(path, key)?
    };

    debug!("权重条目数: {}", entries.len());
    Ok(Checkpoint { entries })
  }

  pub fn from_entries(entries: Vec<(String, Tensor)>) -> Self {
    Checkpoint { entries }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
    self.entries.iter().map(|(name, tensor)| (name.as_str(), tensor))
  }

  pub fn get(&self, name: &str) -> Option<&Tensor> {
    self
      .entries
      .iter()
      .find(|(key, _)| key == name)
      .map(|(_, tensor)| tensor)
  }
}

/// 按 pickle 中字典的顺序读取张量
///
/// `read_all_with_key` 经过哈希表，会打乱顺序，所以先取有序的张量信息再逐个读取。
fn read_pickle(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>, CheckpointError> {
  let load_error = |source: candle_core::Error| CheckpointError::Load {
    path: path.to_path_buf(),
    source,
  };

  let mut key = key;
  let mut infos = pickle::read_pth_tensor_info(path, false, key).map_err(load_error)?;
  // 训练保存的 checkpoint 把参数放在 state_dict 下
  if infos.is_empty() && key.is_none() {
    debug!("顶层没有张量，尝试读取 {}", DEFAULT_STATE_KEY);
    key = Some(DEFAULT_STATE_KEY);
    infos = pickle::read_pth_tensor_info(path, false, key).map_err(load_error)?;
  }

  let tensors = pickle::PthTensors::new(path, key).map_err(load_error)?;
  let mut entries = Vec::with_capacity(infos.len());
  for info in infos {
    match tensors.get(&info.name).map_err(load_error)? {
      Some(tensor) => entries.push((info.name, tensor)),
      None => warn!("跳过无法读取的条目 {}", info.name),
    }
  }
  Ok(entries)
}

/// 可以直接加载进模型的参数表
#[derive(Debug, Clone, Default)]
pub struct StateDict {
  tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.tensors.contains_key(name)
  }

  pub fn get(&self, name: &str) -> Option<&Tensor> {
    self.tensors.get(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.tensors.keys().map(String::as_str)
  }

  /// 仅在名字尚未出现时插入，返回是否插入
  pub(crate) fn insert_if_absent(&mut self, name: String, tensor: Tensor) -> bool {
    match self.tensors.entry(name) {
      std::collections::btree_map::Entry::Vacant(slot) => {
        slot.insert(tensor);
        true
      }
      std::collections::btree_map::Entry::Occupied(_) => false,
    }
  }

  /// 与模型声明的参数逐一比对名字和形状
  pub fn validate(&self, declared: &BTreeMap<String, Vec<usize>>) -> Result<(), CheckpointError> {
    let missing: Vec<String> = declared
      .keys()
      .filter(|name| !self.tensors.contains_key(*name))
      .cloned()
      .collect();
    if !missing.is_empty() {
      return Err(CheckpointError::MissingParameters(missing));
    }

    let unexpected: Vec<String> = self
      .tensors
      .keys()
      .filter(|name| !declared.contains_key(*name))
      .cloned()
      .collect();
    if !unexpected.is_empty() {
      return Err(CheckpointError::UnexpectedKeys(unexpected));
    }

    for (name, expected) in declared {
      let actual = self.tensors[name].dims();
      if actual != expected.as_slice() {
        return Err(CheckpointError::ShapeMismatch {
          name: name.clone(),
          expected: expected.clone(),
          actual: actual.to_vec(),
        });
      }
    }
    Ok(())
  }
}

impl IntoIterator for StateDict {
  type Item = (String, Tensor);
  type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

  fn into_iter(self) -> Self::IntoIter {
    self.tensors.into_iter()
  }
}
