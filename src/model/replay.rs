// 该文件是 KMBox Detect 项目的一部分。
// src/model/replay.rs - 回放录制的推理输出
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

//! 没有加速器时，用录制下来的张量代替推理结果。
//!
//! 录制文件为 JSON：
//!
//! ```json
//! {
//!   "input_width": 640,
//!   "input_height": 640,
//!   "frames": [
//!     { "tensors": [
//!       { "dims": [1, 255, 80, 80], "layout": "nchw",
//!         "payload": { "dtype": "i8", "data": [...] },
//!         "quant": { "zero_point": -128, "scale": 0.0039 } }
//!     ] }
//!   ]
//! }
//! ```
//!
//! 每次推理按顺序取下一帧，取完后从头循环。

use std::{fs::File, io::BufReader, io::BufWriter, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
  frame::Frame,
  model::{
    adapter::{InferError, InferenceAdapter, LoadError},
    config::ModelConfig,
    tensor::{QuantParams, RawTensor, RawTensorOutput, TensorData, TensorLayout},
  },
};

/// 输入尺寸与模型不符
pub const ERR_INPUT_INVALID: i32 = -8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "data", rename_all = "lowercase")]
enum TensorPayload {
  F32(Vec<f32>),
  I8(Vec<i8>),
  U8(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TensorRecord {
  dims: Vec<usize>,
  #[serde(default)]
  layout: TensorLayout,
  payload: TensorPayload,
  #[serde(default)]
  quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FrameRecord {
  tensors: Vec<TensorRecord>,
}

impl From<&RawTensor> for TensorRecord {
  fn from(tensor: &RawTensor) -> Self {
    let payload = match &tensor.data {
      TensorData::F32(v) => TensorPayload::F32(v.clone()),
      TensorData::I8(v) => TensorPayload::I8(v.clone()),
      TensorData::U8(v) => TensorPayload::U8(v.clone()),
    };
    Self {
      dims: tensor.dims.clone(),
      layout: tensor.layout,
      payload,
      quant: tensor.quant,
    }
  }
}

impl From<&TensorRecord> for RawTensor {
  fn from(record: &TensorRecord) -> Self {
    let data = match &record.payload {
      TensorPayload::F32(v) => TensorData::F32(v.clone()),
      TensorPayload::I8(v) => TensorData::I8(v.clone()),
      TensorPayload::U8(v) => TensorData::U8(v.clone()),
    };
    RawTensor {
      dims: record.dims.clone(),
      layout: record.layout,
      data,
      quant: record.quant,
    }
  }
}

/// 录制文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDump {
  pub input_width: usize,
  pub input_height: usize,
  frames: Vec<FrameRecord>,
}

impl ReplayDump {
  pub fn new(input_width: usize, input_height: usize) -> Self {
    Self {
      input_width,
      input_height,
      frames: Vec::new(),
    }
  }

  /// 追加一帧推理输出
  pub fn push(&mut self, output: &[RawTensor]) {
    self.frames.push(FrameRecord {
      tensors: output.iter().map(TensorRecord::from).collect(),
    });
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  pub fn open(path: &Path) -> Result<Self, LoadError> {
    if !path.exists() {
      return Err(LoadError::NotFound(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
      .map_err(|e| LoadError::Incompatible(format!("无法解析录制文件 {}: {}", path.display(), e)))
  }

  pub fn save(&self, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, self)?;
    Ok(())
  }
}

/// 回放用的模型句柄
#[derive(Debug)]
pub struct ReplayModel {
  dump: ReplayDump,
  cursor: usize,
}

impl ReplayModel {
  /// 已经回放的帧数
  pub fn served(&self) -> usize {
    self.cursor
  }
}

/// 从录制文件读取推理输出的加速器替身
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayAdapter;

impl InferenceAdapter for ReplayAdapter {
  type Handle = ReplayModel;

  fn load(&mut self, path: &Path, config: &ModelConfig) -> Result<Self::Handle, LoadError> {
    info!("加载录制文件: {}", path.display());
    let dump = ReplayDump::open(path)?;

    if dump.is_empty() {
      return Err(LoadError::Incompatible(format!(
        "录制文件 {} 中没有任何帧",
        path.display()
      )));
    }
    if (dump.input_width, dump.input_height) != (config.input_width, config.input_height) {
      return Err(LoadError::Incompatible(format!(
        "录制输入尺寸 {}x{} 与模型配置 {}x{} 不符",
        dump.input_width, dump.input_height, config.input_width, config.input_height
      )));
    }

    debug!("录制文件共 {} 帧", dump.len());
    Ok(ReplayModel { dump, cursor: 0 })
  }

  fn infer(
    &mut self,
    handle: &mut Self::Handle,
    frame: &Frame,
  ) -> Result<RawTensorOutput, InferError> {
    let dump = &handle.dump;
    if (frame.width(), frame.height()) != (dump.input_width, dump.input_height) {
      return Err(InferError::new(
        ERR_INPUT_INVALID,
        format!(
          "输入帧 {}x{} 与模型输入 {}x{} 不符",
          frame.width(),
          frame.height(),
          dump.input_width,
          dump.input_height
        ),
      ));
    }

    let record = &dump.frames[handle.cursor % dump.frames.len()];
    handle.cursor += 1;
    Ok(record.tensors.iter().map(RawTensor::from).collect())
  }

  fn release(&mut self, handle: Self::Handle) {
    debug!("释放录制文件，共回放 {} 帧", handle.served());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::config::YoloFamily;

  fn dump_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("kmbox-detect-{}-{}.json", name, std::process::id()))
  }

  fn sample_dump() -> ReplayDump {
    let mut dump = ReplayDump::new(64, 64);
    dump.push(&[RawTensor::f32(
      vec![1, 6, 2, 2],
      TensorLayout::Nchw,
      vec![0.0; 24],
    )]);
    dump.push(&[RawTensor::i8(
      vec![1, 2, 2, 6],
      TensorLayout::Nhwc,
      vec![-1; 24],
      QuantParams {
        zero_point: 3,
        scale: 0.25,
      },
    )]);
    dump
  }

  #[test]
  fn dump_survives_save_and_open() {
    let path = dump_path("roundtrip");
    let dump = sample_dump();
    dump.save(&path).unwrap();
    let loaded = ReplayDump::open(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(dump, loaded);
  }

  #[test]
  fn adapter_cycles_through_frames() {
    let path = dump_path("cycle");
    sample_dump().save(&path).unwrap();

    let config = ModelConfig::new(YoloFamily::V5).with_input_size(64, 64);
    let mut adapter = ReplayAdapter;
    let mut handle = adapter.load(&path, &config).unwrap();
    std::fs::remove_file(&path).ok();

    let frame = Frame::zeroed(64, 64, 3);
    let first = adapter.infer(&mut handle, &frame).unwrap();
    let second = adapter.infer(&mut handle, &frame).unwrap();
    let third = adapter.infer(&mut handle, &frame).unwrap();
    assert_eq!(first[0].layout, TensorLayout::Nchw);
    assert_eq!(second[0].layout, TensorLayout::Nhwc);
    assert_eq!(first, third);
    assert_eq!(handle.served(), 3);
    adapter.release(handle);
  }

  #[test]
  fn wrong_input_geometry_is_rejected() {
    let path = dump_path("geometry");
    sample_dump().save(&path).unwrap();

    let mut adapter = ReplayAdapter;
    let bad = ModelConfig::new(YoloFamily::V5).with_input_size(640, 640);
    assert!(matches!(
      adapter.load(&path, &bad),
      Err(LoadError::Incompatible(_))
    ));

    let config = ModelConfig::new(YoloFamily::V5).with_input_size(64, 64);
    let mut handle = adapter.load(&path, &config).unwrap();
    std::fs::remove_file(&path).ok();
    let err = adapter
      .infer(&mut handle, &Frame::zeroed(32, 32, 3))
      .unwrap_err();
    assert_eq!(err.code, ERR_INPUT_INVALID);
  }

  #[test]
  fn missing_file_is_not_found() {
    let config = ModelConfig::new(YoloFamily::V8);
    let err = ReplayAdapter
      .load(Path::new("/nonexistent/kmbox/model.json"), &config)
      .unwrap_err();
    assert!(matches!(err, LoadError::NotFound(_)));
  }
}
