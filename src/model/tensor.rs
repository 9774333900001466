// 该文件是 KMBox Detect 项目的一部分。
// src/model/tensor.rs - 推理输出张量
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

use crate::model::decode::DecodeError;

/// 张量的内存排布。RKNN 默认输出 NCHW
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "replay", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "replay", serde(rename_all = "lowercase"))]
pub enum TensorLayout {
  #[default]
  Nchw,
  Nhwc,
}

/// 非对称量化参数：`real = (q - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "replay", derive(serde::Deserialize, serde::Serialize))]
pub struct QuantParams {
  pub zero_point: i32,
  pub scale: f32,
}

impl QuantParams {
  pub fn dequantize(&self, q: i32) -> f32 {
    (q - self.zero_point) as f32 * self.scale
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  F32(Vec<f32>),
  I8(Vec<i8>),
  U8(Vec<u8>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::F32(v) => v.len(),
      TensorData::I8(v) => v.len(),
      TensorData::U8(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_integer(&self) -> bool {
    !matches!(self, TensorData::F32(_))
  }
}

/// 一个检测头的原始输出
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
  pub dims: Vec<usize>,
  pub layout: TensorLayout,
  pub data: TensorData,
  pub quant: Option<QuantParams>,
}

impl RawTensor {
  pub fn f32(dims: Vec<usize>, layout: TensorLayout, data: Vec<f32>) -> Self {
    Self {
      dims,
      layout,
      data: TensorData::F32(data),
      quant: None,
    }
  }

  pub fn i8(dims: Vec<usize>, layout: TensorLayout, data: Vec<i8>, quant: QuantParams) -> Self {
    Self {
      dims,
      layout,
      data: TensorData::I8(data),
      quant: Some(quant),
    }
  }

  pub fn u8(dims: Vec<usize>, layout: TensorLayout, data: Vec<u8>, quant: QuantParams) -> Self {
    Self {
      dims,
      layout,
      data: TensorData::U8(data),
      quant: Some(quant),
    }
  }

  /// 检查形状与量化信息后给出按 (通道, 行, 列) 访问的视图
  pub(crate) fn head_view(&self, index: usize, is_quant: bool) -> Result<HeadView<'_>, DecodeError> {
    self.view(index, is_quant, 1)
  }

  /// 锚框类输出还可以是 `[锚框数, H, W, 5 + 类别数]` 的 NHWC 排布，
  /// 视图把各锚框依次拼成 `锚框数 × (5 + 类别数)` 个通道
  pub(crate) fn anchor_view(
    &self,
    index: usize,
    is_quant: bool,
    max_anchors: usize,
  ) -> Result<HeadView<'_>, DecodeError> {
    self.view(index, is_quant, max_anchors)
  }

  fn view(&self, index: usize, is_quant: bool, max_groups: usize) -> Result<HeadView<'_>, DecodeError> {
    let &[lead, a, b, c] = self.dims.as_slice() else {
      return Err(DecodeError::mismatch(format!(
        "输出 {} 维度应为 4，实际为 {:?}",
        index, self.dims
      )));
    };
    let groups = match self.layout {
      TensorLayout::Nhwc if (1..=max_groups).contains(&lead) => lead,
      _ if lead == 1 => 1,
      _ if max_groups > 1 => {
        return Err(DecodeError::mismatch(format!(
          "输出 {} 首维 {} 既不是批大小 1，也不是 1 到 {} 个锚框的 NHWC 排布",
          index, lead, max_groups
        )));
      }
      _ => {
        return Err(DecodeError::mismatch(format!(
          "输出 {} 批大小应为 1，实际为 {}",
          index, lead
        )));
      }
    };

    let expected = groups * a * b * c;
    if self.data.len() != expected {
      return Err(DecodeError::mismatch(format!(
        "输出 {} 元素数量 {} 与形状 {:?} 不符",
        index,
        self.data.len(),
        self.dims
      )));
    }

    if self.data.is_integer() != is_quant {
      return Err(DecodeError::mismatch(format!(
        "输出 {} 的数据类型与模型量化标志 ({}) 不一致",
        index, is_quant
      )));
    }

    let quant = match (&self.data, self.quant) {
      (TensorData::F32(_), _) => QuantParams {
        zero_point: 0,
        scale: 1.0,
      },
      (_, Some(q)) => q,
      (_, None) => {
        return Err(DecodeError::mismatch(format!(
          "量化输出 {} 缺少 scale/zero_point",
          index
        )));
      }
    };

    let (channels, height, width) = match self.layout {
      TensorLayout::Nchw => (a, b, c),
      TensorLayout::Nhwc => (groups * c, a, b),
    };

    Ok(HeadView {
      data: &self.data,
      quant,
      layout: self.layout,
      group_channels: if self.layout == TensorLayout::Nhwc { c } else { a },
      channels,
      height,
      width,
    })
  }
}

/// 单帧推理得到的全部输出，按检测头顺序排列
pub type RawTensorOutput = Vec<RawTensor>;

#[derive(Clone)]
pub(crate) struct HeadView<'a> {
  data: &'a TensorData,
  quant: QuantParams,
  layout: TensorLayout,
  /// NHWC 时每组（每个锚框）的通道数
  group_channels: usize,
  pub channels: usize,
  pub height: usize,
  pub width: usize,
}

impl HeadView<'_> {
  /// 读取并反量化 (c, y, x) 处的值
  #[inline]
  pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
    let idx = match self.layout {
      TensorLayout::Nchw => (c * self.height + y) * self.width + x,
      TensorLayout::Nhwc => {
        let (g, k) = (c / self.group_channels, c % self.group_channels);
        ((g * self.height + y) * self.width + x) * self.group_channels + k
      }
    };
    match self.data {
      TensorData::F32(v) => v[idx],
      TensorData::I8(v) => self.quant.dequantize(v[idx] as i32),
      TensorData::U8(v) => self.quant.dequantize(v[idx] as i32),
    }
  }
}
