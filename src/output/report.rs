// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/output/report.rs - JSON 精度报告
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::BufWriter,
  path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::info;

use super::{OutputError, Sink};
use crate::{
  config::{DatasetKind, EvalConfig, Modality},
  metrics::EvalMetrics,
  model::Consensus,
  task::Evaluation,
};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport<'a> {
  pub dataset: DatasetKind,
  pub modality: Modality,
  pub weights: &'a Path,
  pub test_segments: usize,
  pub test_crops: usize,
  pub crop_fusion: String,
  pub interrupted: bool,
  pub metrics: &'a EvalMetrics,
}

impl<'a> MetricsReport<'a> {
  pub fn new(config: &'a EvalConfig, evaluation: &'a Evaluation) -> Self {
    let crop_fusion = match config.fusion {
      Consensus::Avg => "avg".to_string(),
      Consensus::Max => "max".to_string(),
      Consensus::TopK(k) => format!("top{}", k),
    };
    Self {
      dataset: config.dataset,
      modality: config.modality,
      weights: &config.weights,
      test_segments: config.test_segments,
      test_crops: config.crops.count(),
      crop_fusion,
      interrupted: evaluation.interrupted,
      metrics: &evaluation.metrics,
    }
  }
}

/// 把评测配置和精度写成一个 JSON 文件
pub struct JsonReport {
  path: PathBuf,
}

impl JsonReport {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

impl Sink<EvalConfig, Evaluation> for JsonReport {
  type Error = OutputError;

  fn write_result(&self, config: &EvalConfig, evaluation: &Evaluation) -> Result<(), Self::Error> {
    let file = File::create(&self.path).map_err(|source| OutputError::Io {
      path: self.path.clone(),
      source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), &MetricsReport::new(config, evaluation))?;
    info!("精度报告已写入 {}", self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use clap::Parser;

  use super::*;
  use crate::{args::Args, metrics::ConfusionMatrix};

  #[test]
  fn report_serializes_undefined_classes_as_null() {
    let args = Args::try_parse_from([
      "tsn-eval",
      "hmdb51",
      "Flow",
      "list.txt",
      "flow.pth",
      "--crop-fusion-type",
      "topk",
      "--k",
      "2",
    ])
    .unwrap();
    let config = EvalConfig::try_from(args).unwrap();
    let evaluation = Evaluation {
      results: Vec::new(),
      metrics: ConfusionMatrix::from_pairs(3, &[0], &[0]).unwrap().metrics(),
      interrupted: false,
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    JsonReport::new(&path).write_result(&config, &evaluation).unwrap();

    let value: serde_json::Value =
      serde_json::from_reader(File::open(&path).unwrap()).unwrap();
    assert_eq!(value["dataset"], "hmdb51");
    assert_eq!(value["modality"], "Flow");
    assert_eq!(value["crop_fusion"], "top2");
    assert_eq!(value["metrics"]["per_class"][0], 1.0);
    assert!(value["metrics"]["per_class"][1].is_null());
  }
}
