// 该文件是 KMBox Detect 项目的一部分。
// src/model/nms.rs - 非极大值抑制与结果映射
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

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::model::{Detection, DetectionCandidate, DetectionList, box_area, letterbox::Letterbox};

/// 计算两个边界框的 IoU，并集为空时返回 0
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = box_area(a) + box_area(b) - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 置信度降序，相同时按解码顺序
fn by_score(a: &DetectionCandidate, b: &DetectionCandidate) -> Ordering {
  b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq))
}

/// 按类别做非极大值抑制，不同类别之间互不抑制
pub fn suppress(mut candidates: Vec<DetectionCandidate>, nms_thresh: f32) -> Vec<DetectionCandidate> {
  let total = candidates.len();
  candidates.sort_by(|a, b| a.class_id.cmp(&b.class_id).then(by_score(a, b)));

  let mut kept: Vec<DetectionCandidate> = Vec::with_capacity(total);
  let mut class_start = 0usize;
  for candidate in candidates {
    if kept
      .last()
      .is_some_and(|last| last.class_id != candidate.class_id)
    {
      class_start = kept.len();
    }
    let keep = kept[class_start..]
      .iter()
      .all(|k| iou(&k.bbox, &candidate.bbox) < nms_thresh);
    if keep {
      kept.push(candidate);
    }
  }

  kept.sort_by(by_score);
  debug!("NMS: {} -> {}", total, kept.len());
  kept
}

/// 抑制后映射回帧坐标，并装入容量固定的列表
pub fn filter(
  candidates: Vec<DetectionCandidate>,
  nms_thresh: f32,
  letterbox: &Letterbox,
  frame_width: usize,
  frame_height: usize,
) -> DetectionList {
  // NaN 会让 IoU 比较失效，clamp 也不会处理它
  let candidates = candidates
    .into_iter()
    .filter(|c| c.bbox.iter().all(|v| v.is_finite()))
    .collect();

  let mut list = DetectionList::new();
  for candidate in suppress(candidates, nms_thresh) {
    list.push(Detection {
      bbox: letterbox.to_frame_box(&candidate.bbox, frame_width, frame_height),
      score: candidate.score,
      class_id: candidate.class_id,
    });
  }

  if list.overflowed() {
    warn!(
      "检测结果超出容量 {}，丢弃 {} 个低置信度结果",
      list.capacity(),
      list.dropped()
    );
  }
  list
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DETECTION_LIST_CAPACITY;

  fn cand(bbox: [f32; 4], score: f32, class_id: u32, seq: u32) -> DetectionCandidate {
    DetectionCandidate {
      bbox,
      score,
      class_id,
      seq,
    }
  }

  fn sample() -> Vec<DetectionCandidate> {
    vec![
      cand([0.0, 0.0, 10.0, 10.0], 0.9, 0, 1),
      cand([1.0, 1.0, 11.0, 11.0], 0.8, 0, 2),
      cand([20.0, 20.0, 30.0, 30.0], 0.7, 0, 3),
      cand([0.0, 0.0, 10.0, 10.0], 0.85, 1, 4),
      cand([2.0, 0.0, 12.0, 10.0], 0.6, 1, 5),
      cand([21.0, 21.0, 31.0, 31.0], 0.75, 0, 6),
    ]
  }

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(iou(&a, &a), 1.0);
    assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    assert_eq!(iou(&[1.0, 1.0, 1.0, 1.0], &[1.0, 1.0, 1.0, 1.0]), 0.0);
  }

  #[test]
  fn suppress_is_idempotent() {
    for thresh in [0.0, 0.3, 0.45, 0.7, 1.0] {
      let once = suppress(sample(), thresh);
      let twice = suppress(once.clone(), thresh);
      assert_eq!(once, twice);
    }
  }

  #[test]
  fn overlapping_same_class_keeps_one() {
    let thresh = 0.45;
    let kept = suppress(sample(), thresh);
    for (i, a) in kept.iter().enumerate() {
      for b in &kept[i + 1..] {
        if a.class_id == b.class_id {
          assert!(iou(&a.bbox, &b.bbox) < thresh);
        }
      }
    }
    let seqs = kept.iter().map(|c| c.seq).collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 4, 6]);
  }

  #[test]
  fn zero_threshold_keeps_one_per_class() {
    let kept = suppress(sample(), 0.0);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].class_id, 0);
    assert_eq!(kept[1].class_id, 1);
  }

  #[test]
  fn different_classes_are_never_suppressed() {
    let raw = vec![
      cand([0.0, 0.0, 10.0, 10.0], 0.9, 0, 1),
      cand([0.0, 0.0, 10.0, 10.0], 0.8, 1, 2),
    ];
    for thresh in [0.0, 0.5, 1.0] {
      assert_eq!(suppress(raw.clone(), thresh).len(), 2);
    }
  }

  #[test]
  fn ties_are_ordered_by_decode_sequence() {
    let raw = vec![
      cand([50.0, 50.0, 60.0, 60.0], 0.5, 2, 9),
      cand([0.0, 0.0, 10.0, 10.0], 0.5, 0, 3),
      cand([20.0, 20.0, 30.0, 30.0], 0.5, 1, 5),
    ];
    let seqs = suppress(raw, 0.45)
      .iter()
      .map(|c| c.seq)
      .collect::<Vec<_>>();
    assert_eq!(seqs, vec![3, 5, 9]);
  }

  #[test]
  fn overflow_keeps_highest_confidences() {
    let raw = (0..200u32)
      .map(|i| {
        let x = (i % 20) as f32 * 20.0;
        let y = (i / 20) as f32 * 20.0;
        cand([x, y, x + 10.0, y + 10.0], 0.5 + i as f32 * 0.002, 0, i)
      })
      .collect::<Vec<_>>();
    let list = filter(raw, 0.45, &Letterbox::IDENTITY, 1000, 1000);

    assert_eq!(list.len(), DETECTION_LIST_CAPACITY);
    assert!(list.overflowed());
    assert_eq!(list.dropped(), 72);
    let min_kept = list.iter().map(|d| d.score).fold(f32::INFINITY, f32::min);
    assert!((min_kept - (0.5 + 72.0 * 0.002)).abs() < 1e-6);
    assert!(list.as_slice().windows(2).all(|w| w[0].score > w[1].score));
  }

  #[test]
  fn boxes_are_mapped_into_frame() {
    let lb = Letterbox::fit(1280, 720, 640, 640);
    let raw = vec![cand([-20.0, 130.0, 100.0, 240.0], 0.9, 0, 1)];
    let list = filter(raw, 0.45, &lb, 1280, 720);
    assert_eq!(list.as_slice()[0].bbox, [0.0, 0.0, 200.0, 200.0]);
  }

  #[test]
  fn non_finite_boxes_never_reach_the_list() {
    let raw = vec![
      cand([f32::NAN, 0.0, 32.0, 32.0], 0.95, 0, 1),
      cand([0.0, 0.0, 30.0, 30.0], 0.9, 0, 2),
    ];
    let list = filter(raw, 0.45, &Letterbox::IDENTITY, 64, 64);
    assert_eq!(list.len(), 1);
    assert_eq!(list.as_slice()[0].bbox, [0.0, 0.0, 30.0, 30.0]);
  }
}
