// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/task.rs - 评测任务
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
  sync::mpsc::{Receiver, channel},
  time::Instant,
};

use anyhow::{Context, bail};
use candle_core::{DType, Device, Tensor};
use ndarray::{Array2, Array3};
use tracing::{debug, info, warn};

use crate::{
  config::EvalConfig,
  frame::VideoSample,
  input::InputError,
  metrics::{ConfusionMatrix, EvalMetrics, video_prediction},
  model::{Consensus, Model, TsnOutput},
};

pub trait Task<I, M>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M) -> Result<Self::Output, Self::Error>;
}

/// 单个视频的评测结果
#[derive(Debug, Clone)]
pub struct VideoResult {
  pub index: usize,
  /// `(segments, 1, classes)`
  pub scores: Array3<f32>,
  pub label: usize,
  /// 各裁剪平均后的特征，`(segments, feature_dim)`
  pub features: Array2<f32>,
}

/// 一个视频的前向步骤：分块推理后融合各裁剪
#[derive(Debug, Clone)]
pub struct EvalStep {
  group_length: usize,
  crops: usize,
  segments: usize,
  chunk_size: usize,
  fusion: Consensus,
  device: Device,
}

impl EvalStep {
  pub fn new(
    group_length: usize,
    crops: usize,
    segments: usize,
    chunk_size: usize,
    fusion: Consensus,
    device: Device,
  ) -> Self {
    Self {
      group_length,
      crops,
      segments,
      chunk_size: chunk_size.max(1),
      fusion,
      device,
    }
  }

  pub fn from_config(config: &EvalConfig, device: Device) -> Self {
    Self::new(
      config.modality.group_length(),
      config.crops.count(),
      config.test_segments,
      config.chunk_size,
      config.fusion,
      device,
    )
  }

  pub fn run<M>(&self, model: &M, sample: &VideoSample) -> anyhow::Result<VideoResult>
  where
    M: Model<Input = Tensor, Output = TsnOutput>,
    M::Error: std::error::Error + Send + Sync + 'static,
  {
    let frames = &sample.frames;
    if frames.channels() % self.group_length != 0 {
      bail!(
        "视频 {} 的通道数 {} 不能被帧组长度 {} 整除",
        sample.index,
        frames.channels(),
        self.group_length
      );
    }
    let groups = frames.channels() / self.group_length;
    if groups != self.crops * self.segments {
      bail!(
        "视频 {} 有 {} 个帧组，期望 {} 个裁剪 × {} 个时间段",
        sample.index,
        groups,
        self.crops,
        self.segments
      );
    }

    let input = frames.to_tensor(&self.device)?.reshape((
      groups,
      self.group_length,
      frames.height(),
      frames.width(),
    ))?;

    let mut scores = Vec::new();
    let mut features = Vec::new();
    let mut start = 0;
    while start < groups {
      let len = self.chunk_size.min(groups - start);
      let chunk = input.narrow(0, start, len)?;
      let output = model
        .infer(&chunk)
        .with_context(|| format!("视频 {} 第 {} 个帧组起的前向失败", sample.index, start))?;
      debug!(
        "视频 {} 分块 [{}, {}): 特征 {:?}",
        sample.index,
        start,
        start + len,
        output.features.dims()
      );
      scores.push(output.scores);
      features.push(output.features);
      start += len;
    }

    let scores = Tensor::cat(&scores, 0)?;
    let features = Tensor::cat(&features, 0)?;
    let (_, classes) = scores.dims2()?;
    let (_, feature_dim) = features.dims2()?;

    let scores = to_array3(&scores, (self.crops, self.segments, classes))?;
    let features = to_array3(&features, (self.crops, self.segments, feature_dim))?;

    let fused = self
      .fusion
      .reduce(scores.view())
      .into_shape_with_order((self.segments, 1, classes))?;
    let features = Consensus::Avg.reduce(features.view());

    Ok(VideoResult {
      index: sample.index,
      scores: fused,
      label: sample.label,
      features,
    })
  }
}

fn to_array3(tensor: &Tensor, shape: (usize, usize, usize)) -> anyhow::Result<Array3<f32>> {
  let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
  Ok(Array3::from_shape_vec(shape, values)?)
}

/// 全部视频的评测结果
#[derive(Debug, Clone)]
pub struct Evaluation {
  pub results: Vec<VideoResult>,
  pub metrics: EvalMetrics,
  /// 收到中断信号提前结束
  pub interrupted: bool,
}

/// 逐个视频评测并统计混淆矩阵
pub struct EvaluateTask {
  step: EvalStep,
  num_classes: usize,
  interrupt: Option<Receiver<()>>,
}

impl EvaluateTask {
  pub fn new(step: EvalStep, num_classes: usize) -> Self {
    Self {
      step,
      num_classes,
      interrupt: None,
    }
  }

  /// 安装 Ctrl-C 处理：当前视频完成后停止，并统计已完成的视频
  pub fn with_interrupt(mut self) -> anyhow::Result<Self> {
    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，当前视频完成后停止评测...");
      let _ = tx.send(());
    })
    .context("无法设置 Ctrl-C 处理函数")?;
    self.interrupt = Some(rx);
    Ok(self)
  }

  fn interrupted(&self) -> bool {
    self
      .interrupt
      .as_ref()
      .map(|rx| rx.try_recv().is_ok())
      .unwrap_or(false)
  }
}

impl<I, M> Task<I, M> for EvaluateTask
where
  I: ExactSizeIterator<Item = Result<VideoSample, InputError>>,
  M: Model<Input = Tensor, Output = TsnOutput>,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = Evaluation;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M) -> Result<Self::Output, Self::Error> {
    let total = input.len();
    info!("开始评测 {} 个视频...", total);

    let mut matrix = ConfusionMatrix::new(self.num_classes);
    let mut results = Vec::with_capacity(total);
    let mut interrupted = false;
    let start = Instant::now();

    for sample in input {
      let sample = sample.context("读取视频失败")?;
      let result = self.step.run(&model, &sample)?;
      let prediction = video_prediction(result.scores.view())?;
      matrix
        .add(result.label, prediction)
        .with_context(|| format!("视频 {} 的标签或预测无效", result.index))?;
      results.push(result);

      let done = results.len();
      let hits: u64 = matrix.class_hits().iter().sum();
      info!(
        "视频 {} 完成, 进度 {}/{}, 平均 {:.3} 秒/视频, 当前 top-1 {:.02}%",
        sample.index,
        done,
        total,
        start.elapsed().as_secs_f64() / done as f64,
        hits as f64 / done as f64 * 100.0
      );

      if self.interrupted() {
        warn!("评测在 {}/{} 个视频后中断", done, total);
        interrupted = true;
        break;
      }
    }

    info!("评测完成，共 {} 个视频，耗时 {:.2?}", results.len(), start.elapsed());
    Ok(Evaluation {
      metrics: matrix.metrics(),
      results,
      interrupted,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::{path::Path, sync::Arc};

  use image::{Rgb, RgbImage};

  use super::*;
  use crate::{
    checkpoint::{Checkpoint, NamedRemap},
    config::{CropCount, Modality},
    frame::StackedFrames,
    input::{Cropping, FrameNaming, FramePipeline, Normalize, PrefetchLoader, TsnDataset, VideoRecord},
    model::{BlockKind, ResNetConfig, Tsn, TsnBuilder, TsnConfig},
  };

  /// 分数等于每个帧组首个像素值的若干倍，特征为全 1
  struct FakeModel {
    classes: usize,
  }

  impl Model for FakeModel {
    type Input = Tensor;
    type Output = TsnOutput;
    type Error = candle_core::Error;

    fn infer(&self, input: &Tensor) -> Result<TsnOutput, candle_core::Error> {
      let (n, _, _, _) = input.dims4()?;
      let first = input.narrow(1, 0, 1)?.flatten_from(1)?.narrow(1, 0, 1)?;
      let weights: Vec<f32> = (1..=self.classes).map(|c| c as f32).collect();
      let weights = Tensor::from_vec(weights, (1, self.classes), input.device())?;
      let scores = first.broadcast_mul(&weights)?;
      let features = Tensor::ones((n, 4), DType::F32, input.device())?;
      Ok(TsnOutput { scores, features })
    }
  }

  /// 第 g 个帧组的值为 g + 1
  fn sample(groups: usize, group_length: usize, label: usize) -> VideoSample {
    let size = 2 * 2;
    let data = (0..groups)
      .flat_map(|g| std::iter::repeat_n((g + 1) as f32, group_length * size))
      .collect();
    VideoSample {
      index: 0,
      frames: StackedFrames::from_vec(data, groups * group_length, 2, 2).unwrap(),
      label,
    }
  }

  #[test]
  fn scores_are_segments_by_one_by_classes() {
    for modality in [Modality::Rgb, Modality::Flow, Modality::RgbDiff] {
      for crops in [1, 10] {
        let segments = 3;
        let step = EvalStep::new(
          modality.group_length(),
          crops,
          segments,
          4,
          Consensus::Avg,
          Device::Cpu,
        );
        let result = step
          .run(
            &FakeModel { classes: 5 },
            &sample(crops * segments, modality.group_length(), 1),
          )
          .unwrap();
        assert_eq!(result.scores.shape(), &[segments, 1, 5]);
        assert_eq!(result.features.shape(), &[segments, 4]);
      }
    }
  }

  #[test]
  fn every_chunk_contributes() {
    // 2 个裁剪 × 3 个时间段，分块大小 4，最后一块只有 2 个帧组
    let step = EvalStep::new(3, 2, 3, 4, Consensus::Avg, Device::Cpu);
    let result = step.run(&FakeModel { classes: 1 }, &sample(6, 3, 0)).unwrap();
    // 帧组 g 与 g + 3 属于同一时间段，平均值为 g + 2.5
    let scores: Vec<f32> = result.scores.iter().copied().collect();
    assert_eq!(scores, vec![2.5, 3.5, 4.5]);
  }

  #[test]
  fn max_fusion_takes_best_crop() {
    let step = EvalStep::new(3, 2, 3, 25, Consensus::Max, Device::Cpu);
    let result = step.run(&FakeModel { classes: 1 }, &sample(6, 3, 0)).unwrap();
    let scores: Vec<f32> = result.scores.iter().copied().collect();
    assert_eq!(scores, vec![4.0, 5.0, 6.0]);
  }

  #[test]
  fn group_count_mismatch_is_rejected() {
    let step = EvalStep::new(3, 10, 3, 25, Consensus::Avg, Device::Cpu);
    assert!(step.run(&FakeModel { classes: 2 }, &sample(3, 3, 0)).is_err());
    let step = EvalStep::new(10, 1, 1, 25, Consensus::Avg, Device::Cpu);
    assert!(step.run(&FakeModel { classes: 2 }, &sample(1, 3, 0)).is_err());
  }

  #[test]
  fn task_builds_confusion_matrix() {
    let step = EvalStep::new(3, 1, 1, 25, Consensus::Avg, Device::Cpu);
    // 分数随类别序号递增，预测总是最后一类
    let samples: Vec<Result<VideoSample, InputError>> = vec![
      Ok(sample(1, 3, 2)),
      Ok(VideoSample {
        index: 1,
        ..sample(1, 3, 0)
      }),
    ];
    let evaluation = EvaluateTask::new(step, 3)
      .run_task(samples.into_iter(), FakeModel { classes: 3 })
      .unwrap();
    assert_eq!(evaluation.results.len(), 2);
    assert!(!evaluation.interrupted);
    assert_eq!(evaluation.metrics.per_class, vec![Some(0.0), None, Some(1.0)]);
    assert_eq!(evaluation.metrics.mean_class_accuracy, 0.5);
  }

  fn tiny_tsn(classes: usize) -> Tsn {
    let builder = TsnBuilder::new(TsnConfig {
      num_classes: classes,
      modality: Modality::Rgb,
      backbone: ResNetConfig {
        block: BlockKind::Basic,
        layers: [1, 1, 1, 1],
        base_width: 4,
      },
      dropout: 0.8,
    });
    let entries = builder
      .declared_parameters()
      .unwrap()
      .into_iter()
      .map(|(name, shape)| {
        let tensor = (Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap() * 0.01).unwrap();
        (name, tensor)
      })
      .collect();
    let state = NamedRemap::default()
      .apply(&Checkpoint::from_entries(entries))
      .unwrap();
    builder.build(state).unwrap()
  }

  fn rgb_dataset(root: &Path, crops: CropCount) -> Arc<TsnDataset> {
    let (mean, std) = Modality::Rgb.normalization();
    Arc::new(TsnDataset::new(
      root.to_path_buf(),
      vec![VideoRecord {
        path: "clip".to_string(),
        num_frames: 6,
        label: 2,
      }],
      3,
      Modality::Rgb,
      FrameNaming::Rgb,
      FramePipeline::new(Cropping::new(crops, 36, 32), Normalize::new(mean, std)),
    ))
  }

  #[test]
  fn rgb_frames_through_tsn() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("clip");
    std::fs::create_dir(&dir).unwrap();
    for i in 1..=6u8 {
      RgbImage::from_fn(40, 36, |x, y| Rgb([i * 30, (x * 6) as u8, (y * 7) as u8]))
        .save(dir.join(format!("{:06}.jpg", i)))
        .unwrap();
    }

    let model = tiny_tsn(5);
    for crops in [CropCount::Single, CropCount::Ten] {
      let dataset = rgb_dataset(root.path(), crops);
      let sample = dataset.get(0).unwrap();
      let step = EvalStep::new(
        Modality::Rgb.group_length(),
        crops.count(),
        3,
        4,
        Consensus::Avg,
        Device::Cpu,
      );
      let result = step.run(&model, &sample).unwrap();
      assert_eq!(result.scores.shape(), &[3, 1, 5]);
      assert_eq!(result.features.shape(), &[3, 32]);
      assert_eq!(result.label, 2);

      let evaluation = EvaluateTask::new(step, 5)
        .run_task(PrefetchLoader::new(dataset, 1), &model)
        .unwrap();
      assert_eq!(evaluation.metrics.num_videos, 1);
      assert_eq!(evaluation.results[0].scores.shape(), &[3, 1, 5]);
    }
  }
}
