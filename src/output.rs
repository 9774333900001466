// 该文件是 KMBox Detect 项目的一部分。
// src/output.rs - 结果输出
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

use std::convert::Infallible;

use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, model::DetectionList};

/// 显示端，接收已经绘制好的帧
pub trait DisplaySink {
  type Error;

  fn present(&mut self, frame: &Frame) -> Result<(), Self::Error>;

  /// 同时拿到本帧的检测结果，默认只输出画面
  fn present_detections(
    &mut self,
    frame: &Frame,
    detections: &DetectionList,
  ) -> Result<(), Self::Error> {
    let _ = detections;
    self.present(frame)
  }
}

impl<S: DisplaySink + ?Sized> DisplaySink for &mut S {
  type Error = S::Error;

  fn present(&mut self, frame: &Frame) -> Result<(), Self::Error> {
    (**self).present(frame)
  }

  fn present_detections(
    &mut self,
    frame: &Frame,
    detections: &DetectionList,
  ) -> Result<(), Self::Error> {
    (**self).present_detections(frame, detections)
  }
}

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

/// 丢弃所有帧，只计数
#[derive(Debug, Default)]
pub struct NullOutput {
  presented: usize,
}

impl NullOutput {
  pub fn presented(&self) -> usize {
    self.presented
  }
}

impl FromUrlWithScheme for NullOutput {
  const SCHEME: &'static str = "null";
}

impl FromUrl for NullOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(NullOutput::default())
  }
}

impl DisplaySink for NullOutput {
  type Error = Infallible;

  fn present(&mut self, _frame: &Frame) -> Result<(), Self::Error> {
    self.presented += 1;
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl From<Infallible> for OutputError {
  fn from(err: Infallible) -> Self {
    match err {}
  }
}

pub enum OutputWrapper {
  Null(NullOutput),
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      NullOutput::SCHEME => Ok(OutputWrapper::Null(NullOutput::from_url(url)?)),
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      other => {
        tracing::error!("不支持的输出方案: {}", other);
        Err(OutputError::SchemeMismatch)
      }
    }
  }
}

impl DisplaySink for OutputWrapper {
  type Error = OutputError;

  fn present(&mut self, frame: &Frame) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Null(output) => output.present(frame).map_err(OutputError::from),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => {
        output.present(frame).map_err(OutputError::from)
      }
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => {
        output.present(frame).map_err(OutputError::from)
      }
    }
  }

  fn present_detections(
    &mut self,
    frame: &Frame,
    detections: &DetectionList,
  ) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Null(output) => output
        .present_detections(frame, detections)
        .map_err(OutputError::from),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .present_detections(frame, detections)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .present_detections(frame, detections)
        .map_err(OutputError::from),
    }
  }
}
