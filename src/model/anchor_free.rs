// 该文件是 KMBox Detect 项目的一部分。
// src/model/anchor_free.rs - YOLOv6/v8/v10/v11 无锚框解耦检测头解码
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

use tracing::{debug, error};

use crate::model::{
  DetectionCandidate, argmax,
  config::ModelConfig,
  decode::{Decode, DecodeError, MAX_HEADS, check_head_count, head_stride},
  sigmoid,
  tensor::{HeadView, RawTensor},
};

const BOX_SIDES: usize = 4;

/// 无锚框检测头。每个尺度可以是一个融合张量（`4·R + 类别数` 通道），
/// 也可以是回归、分类两个张量。R > 1 时回归分支为 DFL 分布。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorFreeDecoder;

struct Head<'a> {
  reg: HeadView<'a>,
  cls: HeadView<'a>,
  cls_offset: usize,
  reg_max: usize,
}

/// 根据通道数匹配回归和分类输出，返回 (reg, cls)
fn match_reg_cls<'a>(
  first: HeadView<'a>,
  second: HeadView<'a>,
  class_num: usize,
  head_idx: usize,
) -> Option<(HeadView<'a>, HeadView<'a>)> {
  if (first.height, first.width) != (second.height, second.width) {
    return None;
  }
  if second.channels == class_num && first.channels % BOX_SIDES == 0 && first.channels > 0 {
    debug!("检测头 {}: 输出顺序正常 - 先回归后分类", head_idx);
    Some((first, second))
  } else if first.channels == class_num && second.channels % BOX_SIDES == 0 && second.channels > 0
  {
    debug!("检测头 {}: 输出顺序交换 - 先分类后回归", head_idx);
    Some((second, first))
  } else {
    None
  }
}

fn is_fused(view: &HeadView<'_>, class_num: usize) -> bool {
  view.channels > class_num && (view.channels - class_num) % BOX_SIDES == 0
}

fn split_heads<'a>(
  raw: &'a [RawTensor],
  config: &ModelConfig,
) -> Result<Vec<Head<'a>>, DecodeError> {
  let class_num = config.class_num;
  let views = raw
    .iter()
    .enumerate()
    .map(|(i, t)| t.head_view(i, config.is_quant))
    .collect::<Result<Vec<_>, _>>()?;

  if views.len() <= MAX_HEADS && views.iter().all(|v| is_fused(v, class_num)) {
    return Ok(
      views
        .into_iter()
        .map(|v| {
          let reg_max = (v.channels - class_num) / BOX_SIDES;
          Head {
            reg: v.clone(),
            cls: v,
            cls_offset: reg_max * BOX_SIDES,
            reg_max,
          }
        })
        .collect(),
    );
  }

  if views.len() % 2 != 0 {
    return Err(DecodeError::mismatch(format!(
      "无法把 {} 个输出划分为检测头",
      views.len()
    )));
  }
  check_head_count(views.len() / 2)?;

  let mut heads = Vec::with_capacity(views.len() / 2);
  let mut iter = views.into_iter();
  let mut head_idx = 0;
  while let (Some(first), Some(second)) = (iter.next(), iter.next()) {
    let (c1, c2) = (first.channels, second.channels);
    let Some((reg, cls)) = match_reg_cls(first, second, class_num, head_idx) else {
      error!(
        "检测头 {}: 输出通道不匹配 - 张量1: {}, 张量2: {}, 类别数: {}",
        head_idx, c1, c2, class_num
      );
      return Err(DecodeError::mismatch(format!(
        "检测头 {}: 通道数 {} / {} 无法匹配回归与分类分支",
        head_idx, c1, c2
      )));
    };
    let reg_max = reg.channels / BOX_SIDES;
    heads.push(Head {
      reg,
      cls,
      cls_offset: 0,
      reg_max,
    });
    head_idx += 1;
  }

  Ok(heads)
}

/// DFL：对 R 个分箱做 softmax 后求期望距离
fn dfl_distance(view: &HeadView<'_>, first: usize, reg_max: usize, y: usize, x: usize) -> f32 {
  let max = (0..reg_max)
    .map(|i| view.get(first + i, y, x))
    .fold(f32::NEG_INFINITY, f32::max);
  let mut sum = 0.0f32;
  let mut acc = 0.0f32;
  for i in 0..reg_max {
    let e = (view.get(first + i, y, x) - max).exp();
    sum += e;
    acc += e * i as f32;
  }
  acc / sum
}

impl Decode for AnchorFreeDecoder {
  fn decode(
    &self,
    raw: &[RawTensor],
    config: &ModelConfig,
  ) -> Result<Vec<DetectionCandidate>, DecodeError> {
    if raw.is_empty() {
      return Err(DecodeError::mismatch("推理输出为空"));
    }
    let heads = split_heads(raw, config)?;
    let class_num = config.class_num;
    let box_thresh = config.box_thresh();

    let mut items = Vec::new();
    let mut seq = 0u32;

    for (head_idx, head) in heads.iter().enumerate() {
      let stride = head_stride(head_idx, &head.cls, config)?;
      let (reg, cls) = (&head.reg, &head.cls);

      debug!(
        "检测头 {}: 网格 {}x{}, 步长 {}, DFL 分箱 {}",
        head_idx, cls.width, cls.height, stride, head.reg_max
      );

      for y in 0..cls.height {
        for x in 0..cls.width {
          seq += 1;

          let (max_logit, class_idx) =
            argmax((0..class_num).map(|k| cls.get(head.cls_offset + k, y, x)));
          let score = sigmoid(max_logit);
          if !(score > box_thresh) {
            continue;
          }

          let mut dist = [0.0f32; BOX_SIDES];
          for (side, d) in dist.iter_mut().enumerate() {
            *d = if head.reg_max == 1 {
              reg.get(side, y, x)
            } else {
              dfl_distance(reg, side * head.reg_max, head.reg_max, y, x)
            };
          }

          let grid_x = x as f32 + 0.5;
          let grid_y = y as f32 + 0.5;

          let bbox = [
            (grid_x - dist[0]) * stride,
            (grid_y - dist[1]) * stride,
            (grid_x + dist[2]) * stride,
            (grid_y + dist[3]) * stride,
          ];
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

    Ok(items)
  }
}
