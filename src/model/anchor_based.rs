// 该文件是 KMBox Detect 项目的一部分。
// src/model/anchor_based.rs - YOLOv5/YOLOv7 锚框检测头解码
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

use tracing::debug;

use crate::model::{
  DetectionCandidate, argmax,
  config::ModelConfig,
  decode::{Decode, DecodeError, check_head_count, head_stride},
  sigmoid,
  tensor::RawTensor,
};

/// 每个锚框的输出：x, y, w, h, objectness
const BOX_AND_OBJ: usize = 5;
const MAX_ANCHORS: usize = 3;

/// 锚框类检测头。每个尺度一个张量，通道数为 `锚框数 × (5 + 类别数)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorBasedDecoder;

impl Decode for AnchorBasedDecoder {
  fn decode(
    &self,
    raw: &[RawTensor],
    config: &ModelConfig,
  ) -> Result<Vec<DetectionCandidate>, DecodeError> {
    let anchors = config
      .anchors()
      .ok_or_else(|| DecodeError::mismatch(format!("{} 缺少锚框参数", config.family)))?;
    check_head_count(raw.len())?;

    let class_num = config.class_num;
    let per_anchor = BOX_AND_OBJ + class_num;
    let box_thresh = config.box_thresh();

    let mut items = Vec::new();
    let mut seq = 0u32;

    for (head_idx, tensor) in raw.iter().enumerate() {
      let view = tensor.anchor_view(head_idx, config.is_quant, MAX_ANCHORS)?;
      let num_anchors = view.channels / per_anchor;
      if view.channels % per_anchor != 0 || num_anchors == 0 || num_anchors > MAX_ANCHORS {
        return Err(DecodeError::mismatch(format!(
          "检测头 {}: 通道数 {} 不是 锚框数 × (5 + {}) 的形式",
          head_idx, view.channels, class_num
        )));
      }
      let stride = head_stride(head_idx, &view, config)?;
      let row = anchor_row(stride, head_idx);

      debug!(
        "检测头 {}: 网格 {}x{}, 步长 {}, 锚框数 {}, 锚框行 {}",
        head_idx, view.width, view.height, stride, num_anchors, row
      );

      for a in 0..num_anchors {
        let anchor_w = anchors[row][a * 2] as f32;
        let anchor_h = anchors[row][a * 2 + 1] as f32;
        let base = a * per_anchor;

        for y in 0..view.height {
          for x in 0..view.width {
            seq += 1;

            // 置信度不会超过 objectness，先用它过滤
            let objectness = sigmoid(view.get(base + 4, y, x));
            if !(objectness > box_thresh) {
              continue;
            }

            let (class_score, class_idx) =
              argmax((0..class_num).map(|k| sigmoid(view.get(base + BOX_AND_OBJ + k, y, x))));
            let score = objectness * class_score;
            if !(score > box_thresh) {
              continue;
            }

            let cx = (sigmoid(view.get(base, y, x)) * 2.0 - 0.5 + x as f32) * stride;
            let cy = (sigmoid(view.get(base + 1, y, x)) * 2.0 - 0.5 + y as f32) * stride;
            let w = (sigmoid(view.get(base + 2, y, x)) * 2.0).powi(2) * anchor_w;
            let h = (sigmoid(view.get(base + 3, y, x)) * 2.0).powi(2) * anchor_h;
            let bbox = [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0];
            if !bbox.iter().all(|v| v.is_finite()) {
              continue;
            }

            items.push(DetectionCandidate {
              bbox,
              score,
              class_id: class_idx as u32,
              seq,
            });
          }
        }
      }
    }

    Ok(items)
  }
}

/// 步长 8/16/32 分别对应锚框表的第 0/1/2 行，其他步长按检测头顺序取
fn anchor_row(stride: f32, head_idx: usize) -> usize {
  match stride as u32 {
    8 => 0,
    16 => 1,
    32 => 2,
    _ => head_idx,
  }
}
