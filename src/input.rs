// 该文件是 KMBox Detect 项目的一部分。
// src/input.rs - 帧输入
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

use crate::{FromUrl, frame::Frame};

mod channel_input;
pub use self::channel_input::ChannelInput;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

/// 一次取帧的结果
#[derive(Debug)]
pub enum Acquire {
  Frame(Frame),
  /// 暂时没有数据，稍后重试
  NotReady,
  EndOfStream,
}

/// 帧来源，例如采集卡或者测试用的图片
pub trait FrameSource {
  type Error;

  fn acquire(&mut self) -> Result<Acquire, Self::Error>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
  type Error = S::Error;

  fn acquire(&mut self) -> Result<Acquire, Self::Error> {
    (**self).acquire()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

/// 按 URL 方案选择的输入
pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    tracing::error!("不支持的输入方案: {}", url.scheme());
    Err(InputError::SchemeMismatch)
  }
}

impl FrameSource for InputWrapper {
  type Error = InputError;

  fn acquire(&mut self) -> Result<Acquire, Self::Error> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => Ok(input.acquire()?),
    }
  }
}
