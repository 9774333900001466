// 该文件是 KMBox Detect 项目的一部分。
// src/input/read_image_file.rs - 从图片文件读取帧
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

use std::time::Instant;

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, PixelOrder},
  input::{Acquire, FrameSource},
  url_file_path,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Invalid parameter {key}: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 把一张图片重复输出若干次：`image:///path/a.jpg?repeat=10&order=bgr`
pub struct ImageFileInput {
  frame: Frame,
  remaining: usize,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let mut repeat = 1usize;
    let mut order = PixelOrder::Rgb;
    for (key, value) in url.query_pairs() {
      let invalid = || ImageFileInputError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match &*key {
        "repeat" => repeat = value.parse().map_err(|_| invalid())?,
        "order" => {
          order = match &*value {
            "rgb" => PixelOrder::Rgb,
            "bgr" => PixelOrder::Bgr,
            _ => return Err(invalid()),
          }
        }
        other => debug!("忽略未知的输入参数: {}", other),
      }
    }

    let path = url_file_path(url);
    let image = ImageReader::open(&path)?.decode()?.into_rgb8();
    info!(
      "读取图片 {}: {}x{}，重复 {} 次",
      path.display(),
      image.width(),
      image.height(),
      repeat
    );

    Ok(ImageFileInput {
      frame: Frame::from_rgb_image(&image, order),
      remaining: repeat,
    })
  }
}

impl ImageFileInput {
  pub fn new(frame: Frame, repeat: usize) -> Self {
    Self {
      frame,
      remaining: repeat,
    }
  }

  pub fn remaining(&self) -> usize {
    self.remaining
  }
}

impl FrameSource for ImageFileInput {
  type Error = ImageFileInputError;

  fn acquire(&mut self) -> Result<Acquire, Self::Error> {
    if self.remaining == 0 {
      return Ok(Acquire::EndOfStream);
    }
    self.remaining -= 1;
    Ok(Acquire::Frame(
      self.frame.clone().with_timestamp(Instant::now()),
    ))
  }
}
