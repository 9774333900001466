// 该文件是 KMBox Detect 项目的一部分。
// src/model.rs - 模型与检测结果
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 KMBox Detect 贡献者

/// 检测结果列表的最大容量
pub const DETECTION_LIST_CAPACITY: usize = 128;

/// 模型输入空间中的候选框，只在单帧处理过程中存在
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionCandidate {
  pub bbox: [f32; 4], // [left, top, right, bottom]
  pub score: f32,
  pub class_id: u32,
  /// 解码顺序，用于分数相同时的稳定排序
  pub seq: u32,
}

impl DetectionCandidate {
  pub fn area(&self) -> f32 {
    box_area(&self.bbox)
  }
}

/// 已映射回原始帧坐标的检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub bbox: [f32; 4], // [left, top, right, bottom]
  pub score: f32,
  pub class_id: u32,
}

impl Detection {
  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }
}

/// 容量固定的检测结果列表，超出容量时记录被丢弃的数量
#[derive(Debug, Clone, Default)]
pub struct DetectionList {
  items: Vec<Detection>,
  dropped: usize,
}

impl DetectionList {
  pub fn new() -> Self {
    Self {
      items: Vec::with_capacity(DETECTION_LIST_CAPACITY),
      dropped: 0,
    }
  }

  /// 追加一个结果。列表已满时返回 false，并计入丢弃数
  pub fn push(&mut self, detection: Detection) -> bool {
    if self.items.len() >= DETECTION_LIST_CAPACITY {
      self.dropped += 1;
      return false;
    }
    self.items.push(detection);
    true
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn capacity(&self) -> usize {
    DETECTION_LIST_CAPACITY
  }

  pub fn overflowed(&self) -> bool {
    self.dropped > 0
  }

  pub fn dropped(&self) -> usize {
    self.dropped
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.items
  }
}

impl<'a> IntoIterator for &'a DetectionList {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

pub(crate) fn box_area(bbox: &[f32; 4]) -> f32 {
  (bbox[2] - bbox[0]).max(0.0) * (bbox[3] - bbox[1]).max(0.0)
}

pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 返回最大值及其下标；多个最大值时取第一个
pub(crate) fn argmax(values: impl Iterator<Item = f32>) -> (f32, usize) {
  let mut best = f32::NEG_INFINITY;
  let mut best_idx = 0usize;
  for (idx, v) in values.enumerate() {
    if v > best {
      best = v;
      best_idx = idx;
    }
  }
  (best, best_idx)
}

pub mod adapter;
mod anchor_based;
mod anchor_free;
pub mod config;
pub mod decode;
pub mod labels;
pub mod letterbox;
pub mod nms;
#[cfg(feature = "replay")]
pub mod replay;
pub mod tensor;

pub use self::adapter::{InferError, InferenceAdapter, LoadError};
pub use self::config::{AnchorTable, ConfigError, DEFAULT_ANCHORS, ModelConfig, ModelSpec, YoloFamily};
pub use self::decode::{Decode, DecodeError, DecodeStrategy};
pub use self::labels::{COCO_CLASSES, LabelError, load_labels};
pub use self::letterbox::Letterbox;
#[cfg(feature = "replay")]
pub use self::replay::{ReplayAdapter, ReplayDump};
pub use self::tensor::{QuantParams, RawTensor, RawTensorOutput, TensorData, TensorLayout};

#[cfg(test)]
mod tests {
  use super::*;

  fn det(score: f32) -> Detection {
    Detection {
      bbox: [0.0, 0.0, 1.0, 1.0],
      score,
      class_id: 0,
    }
  }

  #[test]
  fn list_caps_at_capacity() {
    let mut list = DetectionList::new();
    for i in 0..DETECTION_LIST_CAPACITY {
      assert!(list.push(det(i as f32)));
    }
    assert!(!list.overflowed());
    assert!(!list.push(det(0.0)));
    assert!(!list.push(det(0.0)));
    assert_eq!(list.len(), DETECTION_LIST_CAPACITY);
    assert!(list.overflowed());
    assert_eq!(list.dropped(), 2);
  }

  #[test]
  fn argmax_takes_first_maximum() {
    let (v, idx) = argmax([0.1, 0.7, 0.7, 0.2].into_iter());
    assert_eq!(v, 0.7);
    assert_eq!(idx, 1);
  }
}
