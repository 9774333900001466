// 该文件是 KMBox Detect 项目的一部分。
// src/model/letterbox.rs - 原始帧与模型输入之间的缩放填充变换
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

use image::{Rgb, RgbImage, imageops};
use tracing::debug;

use crate::frame::{Frame, FrameError};

/// 填充区域的灰度值
pub const PAD_VALUE: u8 = 114;

/// 等比缩放后居中填充。模型坐标 = 帧坐标 × scale + pad
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
}

impl Default for Letterbox {
  fn default() -> Self {
    Self::IDENTITY
  }
}

impl Letterbox {
  pub const IDENTITY: Letterbox = Letterbox {
    scale: 1.0,
    pad_x: 0.0,
    pad_y: 0.0,
  };

  /// 计算把 `src` 放进 `dst` 的变换
  pub fn fit(src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Self {
    if src_w == 0 || src_h == 0 || (src_w, src_h) == (dst_w, dst_h) {
      return Self::IDENTITY;
    }
    let (new_w, new_h, scale) = scaled_size(src_w, src_h, dst_w, dst_h);
    Self {
      scale,
      pad_x: ((dst_w - new_w) / 2) as f32,
      pad_y: ((dst_h - new_h) / 2) as f32,
    }
  }

  pub fn is_identity(&self) -> bool {
    *self == Self::IDENTITY
  }

  pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
    (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
  }

  pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
  }

  /// 把模型空间中的框映射回帧坐标，并裁剪到帧内
  pub fn to_frame_box(&self, bbox: &[f32; 4], frame_w: usize, frame_h: usize) -> [f32; 4] {
    let (w, h) = (frame_w as f32, frame_h as f32);
    let (x1, y1) = self.to_frame(bbox[0], bbox[1]);
    let (x2, y2) = self.to_frame(bbox[2], bbox[3]);
    [
      x1.clamp(0.0, w),
      y1.clamp(0.0, h),
      x2.clamp(0.0, w),
      y2.clamp(0.0, h),
    ]
  }

  /// 把帧缩放填充到 `dst_w x dst_h`，保留原帧的通道顺序与时间戳
  pub fn apply(frame: &Frame, dst_w: usize, dst_h: usize) -> Result<(Frame, Letterbox), FrameError> {
    let (src_w, src_h) = (frame.width(), frame.height());
    if src_w == 0 || src_h == 0 {
      return Err(FrameError::EmptyFrame {
        width: src_w,
        height: src_h,
      });
    }
    if dst_w == 0 || dst_h == 0 {
      return Err(FrameError::EmptyFrame {
        width: dst_w,
        height: dst_h,
      });
    }

    let letterbox = Letterbox::fit(src_w, src_h, dst_w, dst_h);
    let image = frame.to_rgb_image()?;
    let (new_w, new_h, _) = scaled_size(src_w, src_h, dst_w, dst_h);

    let resized = if (new_w, new_h) == (src_w, src_h) {
      image
    } else {
      imageops::resize(
        &image,
        new_w as u32,
        new_h as u32,
        imageops::FilterType::Triangle,
      )
    };

    let mut canvas = RgbImage::from_pixel(dst_w as u32, dst_h as u32, Rgb([PAD_VALUE; 3]));
    imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    debug!(
      "缩放填充: {}x{} -> {}x{}, 比例 {:.4}, 填充 ({}, {})",
      src_w, src_h, dst_w, dst_h, letterbox.scale, letterbox.pad_x, letterbox.pad_y
    );

    let out = Frame::from_rgb_image(&canvas, frame.order()).with_timestamp(frame.captured_at());
    Ok((out, letterbox))
  }
}

fn scaled_size(src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> (usize, usize, f32) {
  let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
  let new_w = ((src_w as f32 * scale).round() as usize).clamp(1, dst_w);
  let new_h = ((src_h as f32 * scale).round() as usize).clamp(1, dst_h);
  (new_w, new_h, scale)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelOrder;

  #[test]
  fn same_geometry_is_identity() {
    assert!(Letterbox::fit(640, 640, 640, 640).is_identity());
  }

  #[test]
  fn wide_frame_is_padded_vertically() {
    let lb = Letterbox::fit(1280, 720, 640, 640);
    assert_eq!(lb.scale, 0.5);
    assert_eq!(lb.pad_x, 0.0);
    assert_eq!(lb.pad_y, 140.0);
  }

  #[test]
  fn coordinates_round_trip() {
    let lb = Letterbox::fit(1280, 720, 640, 640);
    let (mx, my) = lb.to_model(100.0, 100.0);
    assert_eq!((mx, my), (50.0, 190.0));
    assert_eq!(lb.to_frame(mx, my), (100.0, 100.0));
  }

  #[test]
  fn frame_box_is_clamped() {
    let lb = Letterbox::fit(1280, 720, 640, 640);
    let b = lb.to_frame_box(&[-10.0, 100.0, 700.0, 600.0], 1280, 720);
    assert_eq!(b, [0.0, 0.0, 1280.0, 720.0]);
  }

  #[test]
  fn apply_pads_with_gray_and_keeps_order() {
    let data = (0..4 * 2 * 3).map(|v| v as u8).collect::<Vec<_>>();
    let frame = Frame::new(4, 2, 3, data)
      .unwrap()
      .with_order(PixelOrder::Bgr);
    let (out, lb) = Letterbox::apply(&frame, 4, 4).unwrap();

    assert_eq!(lb.pad_y, 1.0);
    assert_eq!((out.width(), out.height()), (4, 4));
    assert_eq!(out.order(), PixelOrder::Bgr);
    assert_eq!(out.captured_at(), frame.captured_at());
    assert_eq!(out.pixel(0, 0).unwrap(), &[PAD_VALUE; 3]);
    assert_eq!(out.pixel(3, 3).unwrap(), &[PAD_VALUE; 3]);
    assert_eq!(out.pixel(0, 1).unwrap(), frame.pixel(0, 0).unwrap());
    assert_eq!(out.pixel(3, 2).unwrap(), frame.pixel(3, 1).unwrap());
  }

  #[test]
  fn empty_frame_is_rejected() {
    let frame = Frame::zeroed(0, 0, 3);
    assert!(matches!(
      Letterbox::apply(&frame, 4, 4),
      Err(FrameError::EmptyFrame { .. })
    ));
  }
}
