// 该文件是 KMBox Detect 项目的一部分。
// src/model/adapter.rs - 推理加速器接口
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

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
  frame::Frame,
  model::{config::ModelConfig, tensor::RawTensorOutput},
};

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型与配置不兼容: {0}")]
  Incompatible(String),
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 推理失败，`code` 为运行时返回的错误码
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("推理失败 (错误码 {code}): {message}")]
pub struct InferError {
  pub code: i32,
  pub message: String,
}

impl InferError {
  pub fn new(code: i32, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }
}

/// 外部加速器运行时。句柄由加载者独占，必须且只能释放一次
pub trait InferenceAdapter {
  type Handle;

  fn load(&mut self, path: &Path, config: &ModelConfig) -> Result<Self::Handle, LoadError>;

  /// 对一帧（已缩放到模型输入尺寸）执行推理
  fn infer(&mut self, handle: &mut Self::Handle, frame: &Frame)
  -> Result<RawTensorOutput, InferError>;

  fn release(&mut self, handle: Self::Handle);
}
