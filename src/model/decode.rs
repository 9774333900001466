// 该文件是 KMBox Detect 项目的一部分。
// src/model/decode.rs - 检测头解码
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

use thiserror::Error;
use tracing::{debug, error};

use crate::model::{
  DetectionCandidate,
  anchor_based::AnchorBasedDecoder,
  anchor_free::AnchorFreeDecoder,
  config::{ModelConfig, YoloFamily},
  tensor::{HeadView, RawTensor},
};

/// 检测头最多三个尺度
pub const MAX_HEADS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("张量与模型配置不匹配: {0}")]
  ConfigMismatch(String),
}

impl DecodeError {
  pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
    let msg = msg.into();
    error!("{}", msg);
    DecodeError::ConfigMismatch(msg)
  }
}

/// 把一帧的原始输出解码成模型输入空间中的候选框
pub trait Decode {
  fn decode(
    &self,
    raw: &[RawTensor],
    config: &ModelConfig,
  ) -> Result<Vec<DetectionCandidate>, DecodeError>;
}

/// 按模型版本在加载时选定的解码策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
  AnchorBased(AnchorBasedDecoder),
  AnchorFree(AnchorFreeDecoder),
}

impl DecodeStrategy {
  pub fn for_family(family: YoloFamily) -> Self {
    if family.is_anchor_based() {
      DecodeStrategy::AnchorBased(AnchorBasedDecoder)
    } else {
      DecodeStrategy::AnchorFree(AnchorFreeDecoder)
    }
  }
}

impl Decode for DecodeStrategy {
  fn decode(
    &self,
    raw: &[RawTensor],
    config: &ModelConfig,
  ) -> Result<Vec<DetectionCandidate>, DecodeError> {
    let candidates = match self {
      DecodeStrategy::AnchorBased(d) => d.decode(raw, config)?,
      DecodeStrategy::AnchorFree(d) => d.decode(raw, config)?,
    };
    debug!("解码得到 {} 个候选框", candidates.len());
    Ok(candidates)
  }
}

/// 由网格尺寸推出步长，要求横纵两个方向一致且整除
pub(crate) fn head_stride(
  head_idx: usize,
  view: &HeadView<'_>,
  config: &ModelConfig,
) -> Result<f32, DecodeError> {
  let (h, w) = (view.height, view.width);
  if h == 0
    || w == 0
    || config.input_height % h != 0
    || config.input_width % w != 0
    || config.input_height / h != config.input_width / w
  {
    return Err(DecodeError::mismatch(format!(
      "检测头 {}: 网格 {}x{} 与输入 {}x{} 不匹配",
      head_idx, h, w, config.input_width, config.input_height
    )));
  }
  Ok((config.input_height / h) as f32)
}

pub(crate) fn check_head_count(count: usize) -> Result<(), DecodeError> {
  if count == 0 || count > MAX_HEADS {
    return Err(DecodeError::mismatch(format!(
      "检测头数量应为 1 到 {}，实际为 {}",
      MAX_HEADS, count
    )));
  }
  Ok(())
}
