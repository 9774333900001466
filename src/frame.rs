// 该文件是 KMBox Detect 项目的一部分。
// src/frame.rs - 视频帧定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// 打包像素的通道顺序。盒子上的采集卡给出的是 BGR。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrder {
  #[default]
  Rgb,
  Bgr,
}

impl PixelOrder {
  /// 把 RGB 三元组转换成本顺序下的字节排列
  pub fn arrange(self, rgb: [u8; 3]) -> [u8; 3] {
    match self {
      PixelOrder::Rgb => rgb,
      PixelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("不支持的通道数: {0}")]
  UnsupportedChannels(usize),
  #[error("帧尺寸为空: {width}x{height}")]
  EmptyFrame { width: usize, height: usize },
}

/// 一帧打包格式（HWC）的图像，持有自己的缓冲区
#[derive(Debug, Clone)]
pub struct Frame {
  data: Box<[u8]>,
  width: usize,
  height: usize,
  channels: usize,
  order: PixelOrder,
  captured_at: Instant,
}

impl Frame {
  pub fn new(
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let expected = width * height * channels;
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels,
      order: PixelOrder::default(),
      captured_at: Instant::now(),
    })
  }

  pub fn zeroed(width: usize, height: usize, channels: usize) -> Self {
    Self {
      data: vec![0u8; width * height * channels].into_boxed_slice(),
      width,
      height,
      channels,
      order: PixelOrder::default(),
      captured_at: Instant::now(),
    }
  }

  pub fn with_order(mut self, order: PixelOrder) -> Self {
    self.order = order;
    self
  }

  pub fn with_timestamp(mut self, captured_at: Instant) -> Self {
    self.captured_at = captured_at;
    self
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn order(&self) -> PixelOrder {
    self.order
  }

  pub fn captured_at(&self) -> Instant {
    self.captured_at
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 读取 (x, y) 处的像素，越界返回 None
  pub fn pixel(&self, x: usize, y: usize) -> Option<&[u8]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y * self.width + x) * self.channels;
    Some(&self.data[idx..idx + self.channels])
  }

  /// 以 RGB 顺序导出为 `RgbImage`
  pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
    if self.channels != RGB_CHANNELS {
      return Err(FrameError::UnsupportedChannels(self.channels));
    }

    let order = self.order;
    let data = &self.data;
    let width = self.width;
    Ok(ImageBuffer::from_fn(
      self.width as u32,
      self.height as u32,
      |x, y| {
        let idx = (y as usize * width + x as usize) * RGB_CHANNELS;
        // 交换两次即还原
        Rgb(order.arrange([data[idx], data[idx + 1], data[idx + 2]]))
      },
    ))
  }

  /// 从 `RgbImage` 构建指定通道顺序的帧
  pub fn from_rgb_image(image: &RgbImage, order: PixelOrder) -> Self {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut data = Vec::with_capacity(width * height * RGB_CHANNELS);
    for pixel in image.pixels() {
      data.extend_from_slice(&order.arrange(pixel.0));
    }

    Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels: RGB_CHANNELS,
      order,
      captured_at: Instant::now(),
    }
  }
}

impl AsRef<[u8]> for Frame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for Frame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = (image.width() as usize, image.height() as usize);
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      channels: RGB_CHANNELS,
      order: PixelOrder::Rgb,
      captured_at: Instant::now(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_wrong_buffer_length() {
    let err = Frame::new(4, 4, 3, vec![0; 10]).unwrap_err();
    assert_eq!(
      err,
      FrameError::SizeMismatch {
        expected: 48,
        actual: 10
      }
    );
  }

  #[test]
  fn bgr_frame_exports_rgb_image() {
    let frame = Frame::new(1, 1, 3, vec![1, 2, 3])
      .unwrap()
      .with_order(PixelOrder::Bgr);
    let image = frame.to_rgb_image().unwrap();
    assert_eq!(image.get_pixel(0, 0).0, [3, 2, 1]);

    let back = Frame::from_rgb_image(&image, PixelOrder::Bgr);
    assert_eq!(back.as_bytes(), frame.as_bytes());
  }

  #[test]
  fn pixel_out_of_bounds_is_none() {
    let frame = Frame::zeroed(2, 2, 3);
    assert!(frame.pixel(1, 1).is_some());
    assert!(frame.pixel(2, 0).is_none());
  }
}
