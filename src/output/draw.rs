// 该文件是 KMBox Detect 项目的一部分。
// src/output/draw.rs - 在帧上绘制检测结果
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

use std::path::Path;

use ab_glyph::{FontArc, FontVec, PxScale};
use image::{ImageBuffer, Rgb};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::{Frame, PixelOrder, RGB_CHANNELS},
  model::{Detection, DetectionList},
};

// 默认绘制参数
const BOX_COLOR: u32 = 0xFF00_00FF; // 蓝色
const TEXT_COLOR: u32 = 0xFFFF_FFFF;
const BOX_THICKNESS: u32 = 2;
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_VERTICAL_PADDING: i32 = 2;

static EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

type Canvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("不支持的通道数: {0}，只能在 3 通道帧上绘制")]
  UnsupportedChannels(usize),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 检测框绘制器。颜色为 0xAARRGGBB，透明度为 0 时不绘制
pub struct Annotator {
  box_color: u32,
  text_color: u32,
  thickness: u32,
  font_size: f32,
  font: Option<FontArc>,
  class_names: Option<Vec<String>>,
}

impl Default for Annotator {
  fn default() -> Self {
    let font = FontArc::try_from_slice(EMBEDDED_FONT).ok();
    if font.is_none() {
      warn!("无法加载嵌入的字体，标签文字将不会绘制");
    }

    Self {
      box_color: BOX_COLOR,
      text_color: TEXT_COLOR,
      thickness: BOX_THICKNESS,
      font_size: LABEL_FONT_SIZE,
      font,
      class_names: None,
    }
  }
}

impl Annotator {
  pub fn with_box_color(mut self, argb: u32) -> Self {
    self.box_color = argb;
    self
  }

  pub fn with_text_color(mut self, argb: u32) -> Self {
    self.text_color = argb;
    self
  }

  pub fn with_thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness;
    self
  }

  pub fn with_font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size;
    self
  }

  pub fn with_font(mut self, font: FontVec) -> Self {
    self.font = Some(FontArc::new(font));
    self
  }

  /// 从 TTF/OTF 文件加载标签字体
  pub fn with_font_file(self, path: &Path) -> Result<Self, AnnotateError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data)
      .map_err(|_| AnnotateError::InvalidFont(path.display().to_string()))?;
    debug!("加载标签字体: {}", path.display());
    Ok(self.with_font(font))
  }

  pub fn with_class_names(mut self, names: Vec<String>) -> Self {
    self.class_names = Some(names);
    self
  }

  /// 标签文本：`<类别> <置信度>%`
  pub fn label(&self, detection: &Detection) -> String {
    let class = self
      .class_names
      .as_ref()
      .and_then(|names| names.get(detection.class_id as usize))
      .cloned()
      .unwrap_or_else(|| detection.class_id.to_string());
    format!("{} {:.1}%", class, detection.score * 100.0)
  }

  /// 绘制空心矩形，超出帧的部分被裁掉
  #[allow(clippy::too_many_arguments)]
  pub fn draw_rectangle(
    &self,
    frame: &mut Frame,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    argb: u32,
    thickness: u32,
  ) -> Result<(), AnnotateError> {
    let order = frame.order();
    let mut canvas = canvas(frame)?;
    stroke_rect(&mut canvas, order, x, y, width, height, argb, thickness);
    Ok(())
  }

  /// 在 (x, y) 处绘制文本，(x, y) 为文本左上角
  pub fn draw_text(
    &self,
    frame: &mut Frame,
    text: &str,
    x: i32,
    y: i32,
    argb: u32,
    font_size: f32,
  ) -> Result<(), AnnotateError> {
    let order = frame.order();
    let mut canvas = canvas(frame)?;
    self.put_text(&mut canvas, order, text, x, y, argb, font_size);
    Ok(())
  }

  /// 在帧上绘制所有检测框及标签
  pub fn annotate(&self, frame: &mut Frame, detections: &DetectionList) -> Result<(), AnnotateError> {
    let order = frame.order();
    let mut canvas = canvas(frame)?;
    let (frame_w, frame_h) = (canvas.width() as i32, canvas.height() as i32);

    for detection in detections {
      let x_min = detection.bbox[0].floor() as i32;
      let y_min = detection.bbox[1].floor() as i32;
      let x_max = detection.bbox[2].ceil() as i32;
      let y_max = detection.bbox[3].ceil() as i32;
      if x_min >= x_max || y_min >= y_max || !visible(x_min, y_min, x_max, y_max, frame_w, frame_h)
      {
        continue;
      }

      stroke_rect(
        &mut canvas,
        order,
        x_min,
        y_min,
        (x_max - x_min) as u32,
        (y_max - y_min) as u32,
        self.box_color,
        self.thickness,
      );

      // 标签放在框的上方，放不下时放进框内
      let label = self.label(detection);
      let (text_w, text_h) = self.text_extent(&label, self.font_size);
      let label_h = text_h as i32 + LABEL_VERTICAL_PADDING * 2;
      let label_x = x_min.max(0);
      let label_y = if y_min - label_h >= 0 {
        y_min - label_h
      } else {
        y_min.max(0)
      };
      let label_w = (text_w as i32).min(frame_w - label_x);
      if label_w > 0 && alpha(self.box_color) > 0 {
        let rect = Rect::at(label_x, label_y).of_size(label_w as u32, label_h as u32);
        draw_filled_rect_mut(&mut canvas, rect, rgb(order, self.box_color));
      }
      self.put_text(
        &mut canvas,
        order,
        &label,
        label_x,
        label_y + LABEL_VERTICAL_PADDING,
        self.text_color,
        self.font_size,
      );
    }

    Ok(())
  }

  fn text_extent(&self, text: &str, font_size: f32) -> (u32, u32) {
    match &self.font {
      Some(font) => text_size(PxScale::from(font_size), font, text),
      None => (0, 0),
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn put_text(
    &self,
    canvas: &mut Canvas<'_>,
    order: PixelOrder,
    text: &str,
    x: i32,
    y: i32,
    argb: u32,
    font_size: f32,
  ) {
    if alpha(argb) == 0 || text.is_empty() {
      return;
    }
    if let Some(font) = &self.font {
      let color = rgb(order, argb);
      draw_text_mut(canvas, color, x, y, PxScale::from(font_size), font, text);
    }
  }
}

fn canvas(frame: &mut Frame) -> Result<Canvas<'_>, AnnotateError> {
  if frame.channels() != RGB_CHANNELS {
    return Err(AnnotateError::UnsupportedChannels(frame.channels()));
  }
  let (w, h) = (frame.width() as u32, frame.height() as u32);
  ImageBuffer::from_raw(w, h, frame.as_mut()).ok_or(AnnotateError::UnsupportedChannels(RGB_CHANNELS))
}

fn alpha(argb: u32) -> u8 {
  (argb >> 24) as u8
}

fn rgb(order: PixelOrder, argb: u32) -> Rgb<u8> {
  let [_, r, g, b] = argb.to_be_bytes();
  Rgb(order.arrange([r, g, b]))
}

fn visible(x_min: i32, y_min: i32, x_max: i32, y_max: i32, frame_w: i32, frame_h: i32) -> bool {
  x_max > 0 && y_max > 0 && x_min < frame_w && y_min < frame_h
}

#[allow(clippy::too_many_arguments)]
fn stroke_rect(
  canvas: &mut Canvas<'_>,
  order: PixelOrder,
  x: i32,
  y: i32,
  width: u32,
  height: u32,
  argb: u32,
  thickness: u32,
) {
  let (frame_w, frame_h) = (canvas.width() as i32, canvas.height() as i32);
  if width == 0 || height == 0 || alpha(argb) == 0 {
    return;
  }
  let (x_max, y_max) = (x.saturating_add(width as i32), y.saturating_add(height as i32));
  if !visible(x, y, x_max, y_max, frame_w, frame_h) {
    return;
  }

  let color = rgb(order, argb);
  // 由外向内逐圈加粗
  for t in 0..thickness.max(1) {
    let inset = 2 * t;
    if width <= inset || height <= inset {
      break;
    }
    let rect = Rect::at(x + t as i32, y + t as i32).of_size(width - inset, height - inset);
    draw_hollow_rect_mut(canvas, rect, color);
  }
}
