// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/checkpoint/remap.rs - 参数名映射
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

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{Checkpoint, CheckpointError, StateDict};

const HEAD_WEIGHT: &str = "base_model.fc_action.1.weight";
const HEAD_BIAS: &str = "base_model.fc_action.1.bias";
const NEW_FC_WEIGHT: &str = "new_fc.weight";
const NEW_FC_BIAS: &str = "new_fc.bias";

/// 把权重文件中的名字映射为模型参数名
#[derive(Debug, Clone)]
pub enum RemapStrategy {
  Positional(PositionalRemap),
  Named(NamedRemap),
}

impl RemapStrategy {
  pub fn apply(&self, checkpoint: &Checkpoint) -> Result<StateDict, CheckpointError> {
    match self {
      RemapStrategy::Positional(rule) => rule.apply(checkpoint),
      RemapStrategy::Named(rule) => rule.apply(checkpoint),
    }
  }
}

/// 按条目序号的旧式映射
///
/// 序号从 1 开始：`<= verbatim_until` 的条目原样保留，
/// `(verbatim_until, strip_until]` 的条目去掉名字前 `prefix_len` 个字符，
/// 之后的条目丢弃。最后从动作分类头注入 `new_fc` 的权重和偏置。
/// 该规则依赖权重的保存顺序，顺序变化时会静默失效，只用于兼容旧权重。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionalRemap {
  pub verbatim_until: usize,
  pub strip_until: usize,
  pub prefix_len: usize,
}

impl Default for PositionalRemap {
  fn default() -> Self {
    PositionalRemap {
      verbatim_until: 18,
      strip_until: 414,
      prefix_len: 7,
    }
  }
}

impl PositionalRemap {
  pub fn from_json_file(path: &Path) -> Result<Self, CheckpointError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
  }

  pub fn apply(&self, checkpoint: &Checkpoint) -> Result<StateDict, CheckpointError> {
    let mut dict = StateDict::default();
    let mut dropped = 0usize;

    for (position, (name, tensor)) in (1..).zip(checkpoint.iter()) {
      let target = if position <= self.verbatim_until {
        name.to_string()
      } else if position <= self.strip_until {
        name.chars().skip(self.prefix_len).collect()
      } else {
        dropped += 1;
        continue;
      };
      if !dict.insert_if_absent(target.clone(), tensor.clone()) {
        debug!("第 {} 个条目 {} 与已有名字 {} 冲突，保留先出现的", position, name, target);
      }
    }

    if dropped > 0 {
      warn!("按位置映射丢弃了 {} 个序号大于 {} 的条目", dropped, self.strip_until);
    }

    for (source, target) in [(HEAD_WEIGHT, NEW_FC_WEIGHT), (HEAD_BIAS, NEW_FC_BIAS)] {
      let tensor = checkpoint.get(source).ok_or_else(|| {
        error!("权重中缺少动作分类头参数: {}", source);
        CheckpointError::MissingKey(source.to_string())
      })?;
      dict.insert_if_absent(target.to_string(), tensor.clone());
    }

    Ok(dict)
  }
}

/// 显式的名字映射规则
///
/// 依次执行：去掉第一个匹配的前缀、按重命名表改名、按忽略规则丢弃。
/// 没有被忽略的条目全部进入结果，是否多余由加载时的校验决定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedRemap {
  pub strip_prefixes: Vec<String>,
  pub renames: BTreeMap<String, String>,
  pub ignore_prefixes: Vec<String>,
  pub ignore_suffixes: Vec<String>,
}

impl Default for NamedRemap {
  fn default() -> Self {
    NamedRemap {
      strip_prefixes: vec!["module.".to_string()],
      renames: BTreeMap::from([
        (HEAD_WEIGHT.to_string(), NEW_FC_WEIGHT.to_string()),
        (HEAD_BIAS.to_string(), NEW_FC_BIAS.to_string()),
      ]),
      ignore_prefixes: vec!["base_model.fc_action.".to_string()],
      ignore_suffixes: vec!["num_batches_tracked".to_string()],
    }
  }
}

impl NamedRemap {
  pub fn from_json_file(path: &Path) -> Result<Self, CheckpointError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
  }

  /// 计算单个名字的目标名，`None` 表示被忽略
  pub fn target_name(&self, name: &str) -> Option<String> {
    let stripped = self
      .strip_prefixes
      .iter()
      .find_map(|prefix| name.strip_prefix(prefix.as_str()))
      .unwrap_or(name);
    let renamed = self
      .renames
      .get(name)
      .or_else(|| self.renames.get(stripped))
      .map(String::as_str)
      .unwrap_or(stripped);

    let ignored = self
      .ignore_prefixes
      .iter()
      .any(|prefix| renamed.starts_with(prefix.as_str()))
      || self
        .ignore_suffixes
        .iter()
        .any(|suffix| renamed.ends_with(suffix.as_str()));
    (!ignored).then(|| renamed.to_string())
  }

  pub fn apply(&self, checkpoint: &Checkpoint) -> Result<StateDict, CheckpointError> {
    let mut dict = StateDict::default();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();

    for (name, tensor) in checkpoint.iter() {
      let Some(target) = self.target_name(name) else {
        debug!("忽略权重条目: {}", name);
        continue;
      };
      if let Some(first) = sources.get(&target) {
        error!("{} 与 {} 映射到同一个参数 {}", first, name, target);
        return Err(CheckpointError::DuplicateTarget {
          target,
          first: first.clone(),
          second: name.to_string(),
        });
      }
      if target != name {
        debug!("{} -> {}", name, target);
      }
      sources.insert(target.clone(), name.to_string());
      dict.insert_if_absent(target, tensor.clone());
    }

    Ok(dict)
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Tensor};

  use super::*;

  fn tensor(len: usize) -> Tensor {
    Tensor::zeros(len, DType::F32, &Device::Cpu).unwrap()
  }

  /// 前 18 个条目无前缀，之后带 `module.` 前缀，末尾是动作分类头
  fn legacy_checkpoint(total: usize) -> Checkpoint {
    let mut entries = Vec::with_capacity(total);
    for i in 1..=total {
      let name = if i <= 18 {
        format!("base_model.stem{i}.weight")
      } else if i == total - 1 {
        HEAD_WEIGHT.to_string()
      } else if i == total {
        HEAD_BIAS.to_string()
      } else {
        format!("module.base_model.block{i}.weight")
      };
      entries.push((name, tensor(i)));
    }
    Checkpoint::from_entries(entries)
  }

  #[test]
  fn positional_keeps_early_keys_verbatim() {
    let checkpoint = legacy_checkpoint(40);
    let dict = PositionalRemap::default().apply(&checkpoint).unwrap();
    for (name, _) in checkpoint.iter().take(18) {
      assert!(dict.contains(name), "{name} should be kept verbatim");
    }
  }

  #[test]
  fn positional_strips_seven_characters_in_range() {
    let checkpoint = legacy_checkpoint(40);
    let dict = PositionalRemap::default().apply(&checkpoint).unwrap();
    for (name, tensor) in checkpoint.iter().skip(18) {
      let stripped: String = name.chars().skip(7).collect();
      let mapped = dict.get(&stripped).expect("stripped key present");
      assert_eq!(mapped.dims(), tensor.dims());
      assert!(!dict.contains(name));
    }
    assert!(dict.contains("base_model.block19.weight"));
  }

  #[test]
  fn positional_output_count_and_injected_head() {
    let checkpoint = legacy_checkpoint(40);
    let dict = PositionalRemap::default().apply(&checkpoint).unwrap();
    // 全部 40 个条目名字互不相同，再加两个注入的分类层参数
    assert_eq!(dict.len(), 40 + 2);
    assert_eq!(dict.get(NEW_FC_WEIGHT).unwrap().dims(), &[39]);
    assert_eq!(dict.get(NEW_FC_BIAS).unwrap().dims(), &[40]);
  }

  #[test]
  fn positional_drops_entries_past_upper_bound() {
    let checkpoint = legacy_checkpoint(420);
    let dict = PositionalRemap::default().apply(&checkpoint).unwrap();
    assert!(dict.contains("base_model.block414.weight"));
    assert!(!dict.contains("base_model.block415.weight"));
    assert!(!dict.contains("module.base_model.block415.weight"));
    // 414 个保留条目 + 2 个注入条目
    assert_eq!(dict.len(), 414 + 2);
  }

  #[test]
  fn positional_requires_action_head() {
    let checkpoint = Checkpoint::from_entries(vec![("conv1.weight".to_string(), tensor(1))]);
    let err = PositionalRemap::default().apply(&checkpoint).unwrap_err();
    assert!(matches!(err, CheckpointError::MissingKey(ref key) if key == HEAD_WEIGHT));
  }

  #[test]
  fn named_strips_prefix_and_renames_head() {
    let checkpoint = Checkpoint::from_entries(vec![
      ("module.base_model.conv1.weight".to_string(), tensor(1)),
      ("base_model.bn1.weight".to_string(), tensor(2)),
      ("module.base_model.bn1.num_batches_tracked".to_string(), tensor(1)),
      ("module.base_model.fc_action.1.weight".to_string(), tensor(3)),
      ("module.base_model.fc_action.1.bias".to_string(), tensor(4)),
      ("module.base_model.fc_action.0.weight".to_string(), tensor(5)),
    ]);
    let dict = NamedRemap::default().apply(&checkpoint).unwrap();
    let names: Vec<&str> = dict.names().collect();
    assert_eq!(
      names,
      vec![
        "base_model.bn1.weight",
        "base_model.conv1.weight",
        "new_fc.bias",
        "new_fc.weight"
      ]
    );
    assert_eq!(dict.get("new_fc.weight").unwrap().dims(), &[3]);
  }

  #[test]
  fn named_rejects_colliding_targets() {
    let checkpoint = Checkpoint::from_entries(vec![
      ("module.conv1.weight".to_string(), tensor(1)),
      ("conv1.weight".to_string(), tensor(1)),
    ]);
    let err = NamedRemap::default().apply(&checkpoint).unwrap_err();
    assert!(matches!(err, CheckpointError::DuplicateTarget { ref target, .. } if target == "conv1.weight"));
  }

  #[test]
  fn named_rules_load_from_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remap.json");
    std::fs::write(
      &path,
      r#"{ "strip_prefixes": ["net."], "renames": { "head.w": "new_fc.weight" } }"#,
    )
    .unwrap();
    let rule = NamedRemap::from_json_file(&path).unwrap();
    assert_eq!(rule.target_name("net.head.w").as_deref(), Some("new_fc.weight"));
    assert_eq!(rule.target_name("net.conv.w").as_deref(), Some("conv.w"));
    // 未写出的字段沿用默认规则
    assert_eq!(rule.ignore_suffixes, NamedRemap::default().ignore_suffixes);
  }

  #[test]
  fn positional_bounds_load_from_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("positional.json");
    std::fs::write(&path, r#"{ "verbatim_until": 2, "strip_until": 4 }"#).unwrap();
    let rule = PositionalRemap::from_json_file(&path).unwrap();
    assert_eq!(
      rule,
      PositionalRemap {
        verbatim_until: 2,
        strip_until: 4,
        prefix_len: 7,
      }
    );
  }
}
