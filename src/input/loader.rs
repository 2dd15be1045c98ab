// 该文件是 TsnEval （时段网络评测） 项目的一部分。
// src/input/loader.rs - 多线程预读取
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, sync_channel},
  },
  thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use super::{InputError, dataset::TsnDataset};
use crate::frame::VideoSample;

/// 每个加载线程最多预先读好的视频数
const PREFETCH_DEPTH: usize = 2;

type LoadResult = Result<VideoSample, InputError>;

/// 按测试列表顺序产出视频样本。
///
/// 第 `w` 个线程负责序号 `w, w + n, w + 2n, ...`，读取端轮流从各线程取数，
/// 因此输出顺序与单线程一致。`workers == 0` 时在调用线程中读取。
pub struct PrefetchLoader {
  dataset: Arc<TsnDataset>,
  receivers: Vec<Receiver<LoadResult>>,
  handles: Vec<JoinHandle<()>>,
  stop: Arc<AtomicBool>,
  next: usize,
}

impl PrefetchLoader {
  pub fn new(dataset: Arc<TsnDataset>, workers: usize) -> Self {
    let stop = Arc::new(AtomicBool::new(false));
    let workers = workers.min(dataset.len());
    let mut receivers = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
      let (tx, rx) = sync_channel(PREFETCH_DEPTH);
      let dataset = Arc::clone(&dataset);
      let stop = Arc::clone(&stop);
      let handle = thread::spawn(move || {
        for index in (worker..dataset.len()).step_by(workers) {
          if stop.load(Ordering::Relaxed) {
            break;
          }
          if tx.send(dataset.get(index)).is_err() {
            break;
          }
        }
        debug!("加载线程 {} 退出", worker);
      });
      receivers.push(rx);
      handles.push(handle);
    }

    debug!("启动 {} 个加载线程", workers);
    Self {
      dataset,
      receivers,
      handles,
      stop,
      next: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.dataset.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dataset.is_empty()
  }

  fn shutdown(&mut self) {
    self.stop.store(true, Ordering::Relaxed);
    // 先断开通道，阻塞在 send 上的线程才能退出
    self.receivers.clear();
    for handle in self.handles.drain(..) {
      if handle.join().is_err() {
        warn!("加载线程异常退出");
      }
    }
  }
}

impl Iterator for PrefetchLoader {
  type Item = LoadResult;

  fn next(&mut self) -> Option<Self::Item> {
    let index = self.next;
    if index >= self.dataset.len() {
      return None;
    }
    self.next += 1;

    if self.receivers.is_empty() {
      return Some(self.dataset.get(index));
    }
    let rx = &self.receivers[index % self.receivers.len()];
    Some(
      rx.recv()
        .unwrap_or_else(|_| Err(InputError::WorkerDisconnected(index))),
    )
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let remaining = self.dataset.len().saturating_sub(self.next);
    (remaining, Some(remaining))
  }
}

impl ExactSizeIterator for PrefetchLoader {}

impl Drop for PrefetchLoader {
  fn drop(&mut self) {
    self.shutdown();
  }
}
