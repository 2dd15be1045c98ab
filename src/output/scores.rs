// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/output/scores.rs - 分数存档
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  path::{Path, PathBuf},
};

use ndarray::{Array1, Array3, Array4, Axis, Ix1, Ix3, Ix4, OwnedRepr, stack};
use ndarray_npy::{NpzReader, NpzWriter};
use tracing::{info, warn};

use super::{OutputError, Sink, reorder_by_name};
use crate::task::{Evaluation, VideoResult};

const SCORES: &str = "scores";
const LABELS: &str = "labels";
const FEATURES: &str = "features";

/// 从存档读回的分数，已按视频名排序
#[derive(Debug, Clone, PartialEq)]
pub struct StoredScores {
  /// `(videos, segments, 1, classes)`
  pub scores: Array4<f32>,
  pub labels: Array1<i64>,
  /// `(videos, segments, feature_dim)`
  pub features: Option<Array3<f32>>,
}

impl StoredScores {
  pub fn num_videos(&self) -> usize {
    self.scores.len_of(Axis(0))
  }

  pub fn num_classes(&self) -> usize {
    self.scores.len_of(Axis(3))
  }
}

/// 以压缩 npz 保存按视频名排序的分数
pub struct ScoreArchive {
  path: PathBuf,
  save_features: bool,
}

impl ScoreArchive {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      save_features: false,
    }
  }

  pub fn with_features(mut self, save_features: bool) -> Self {
    self.save_features = save_features;
    self
  }

  pub fn read(path: &Path) -> Result<StoredScores, OutputError> {
    let file = File::open(path).map_err(|source| OutputError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let mut npz = NpzReader::new(file)?;
    let names = npz.names()?;
    let find = |wanted: &str| {
      names
        .iter()
        .position(|name| name == wanted || name.strip_suffix(".npy") == Some(wanted))
    };

    let scores = match find(SCORES) {
      Some(i) => npz.by_index::<OwnedRepr<f32>, Ix4>(i)?,
      None => return Err(OutputError::MissingArray(SCORES)),
    };
    let labels = match find(LABELS) {
      Some(i) => npz.by_index::<OwnedRepr<i64>, Ix1>(i)?,
      None => return Err(OutputError::MissingArray(LABELS)),
    };
    let features = match find(FEATURES) {
      Some(i) => Some(npz.by_index::<OwnedRepr<f32>, Ix3>(i)?),
      None => None,
    };
    Ok(StoredScores {
      scores,
      labels,
      features,
    })
  }

  fn create(&self) -> Result<File, OutputError> {
    File::create(&self.path).map_err(|source| OutputError::Io {
      path: self.path.clone(),
      source,
    })
  }
}

impl Sink<[String], Evaluation> for ScoreArchive {
  type Error = OutputError;

  /// `names` 为测试列表中的视频名，顺序与评测结果一致
  fn write_result(&self, names: &[String], evaluation: &Evaluation) -> Result<(), Self::Error> {
    if evaluation.results.is_empty() {
      warn!("没有评测结果，跳过保存分数");
      return Err(OutputError::Empty);
    }
    let results: Vec<&VideoResult> = reorder_by_name(names, evaluation.results.iter().collect())?;

    let scores = stack(
      Axis(0),
      &results.iter().map(|r| r.scores.view()).collect::<Vec<_>>(),
    )?;
    let labels: Array1<i64> = results.iter().map(|r| r.label as i64).collect();

    let mut npz = NpzWriter::new_compressed(self.create()?);
    npz.add_array(SCORES, &scores)?;
    npz.add_array(LABELS, &labels)?;
    if self.save_features {
      let features = stack(
        Axis(0),
        &results
          .iter()
          .map(|r| r.features.view())
          .collect::<Vec<_>>(),
      )?;
      npz.add_array(FEATURES, &features)?;
    }
    npz.finish()?;

    info!(
      "已保存 {} 个视频的分数 {:?} 到 {}",
      results.len(),
      scores.shape(),
      self.path.display()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use ndarray::{Array2, array};

  use super::*;
  use crate::metrics::ConfusionMatrix;

  fn result(index: usize, label: usize, value: f32) -> VideoResult {
    VideoResult {
      index,
      scores: Array3::from_elem((2, 1, 3), value),
      label,
      features: Array2::from_elem((2, 4), value),
    }
  }

  fn evaluation(results: Vec<VideoResult>) -> Evaluation {
    Evaluation {
      results,
      metrics: ConfusionMatrix::new(3).metrics(),
      interrupted: false,
    }
  }

  #[test]
  fn archive_is_sorted_by_video_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scores.npz");
    let names = vec!["v_b".to_string(), "v_c".to_string(), "v_a".to_string()];
    let evaluation = evaluation(vec![result(0, 1, 1.0), result(1, 2, 2.0), result(2, 0, 3.0)]);

    ScoreArchive::new(&path)
      .with_features(true)
      .write_result(&names[..], &evaluation)
      .unwrap();
    let stored = ScoreArchive::read(&path).unwrap();

    assert_eq!(stored.scores.shape(), &[3, 2, 1, 3]);
    assert_eq!(stored.labels, array![0i64, 1, 2]);
    assert_eq!(stored.scores[[0, 0, 0, 0]], 3.0);
    assert_eq!(stored.scores[[2, 1, 0, 2]], 2.0);
    assert_eq!(stored.features.unwrap().shape(), &[3, 2, 4]);
  }

  #[test]
  fn features_are_optional() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scores.npz");
    let names = vec!["only".to_string(), "unused".to_string()];
    ScoreArchive::new(&path)
      .write_result(&names[..], &evaluation(vec![result(0, 1, 0.5)]))
      .unwrap();
    let stored = ScoreArchive::read(&path).unwrap();
    assert_eq!(stored.num_videos(), 1);
    assert_eq!(stored.num_classes(), 3);
    assert!(stored.features.is_none());
  }

  #[test]
  fn empty_evaluation_is_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scores.npz");
    let err = ScoreArchive::new(&path)
      .write_result(&Vec::<String>::new()[..], &evaluation(Vec::new()))
      .unwrap_err();
    assert!(matches!(err, OutputError::Empty));
    assert!(!path.exists());
  }
}
