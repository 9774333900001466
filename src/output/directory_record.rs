// 该文件是 KMBox Detect 项目的一部分。
// src/output/directory_record.rs - 按日期目录记录帧与检测结果
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

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError},
  model::DetectionList,
  output::DisplaySink,
  url_file_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("帧错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// `folder:///data/record?always&record`
///
/// 帧保存为 `<目录>/<年>/<月>/<日>/<时-分-秒>-<序号>.png`。
/// 默认只保存有检测结果的帧，`always` 保存所有帧；
/// `record` 额外写一个同名 `.txt`，每行 `类别, 置信度, x1, y1, x2, y2`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: u16,
  always: bool,
  record: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let record = uri.query_pairs().any(|(k, _)| k == "record");

    Ok(DirectoryRecordOutput::new(url_file_path(uri), always, record))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>, always: bool, record: bool) -> Self {
    Self {
      directory: directory.into(),
      frame_counter: 0,
      always,
      record,
    }
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn frame_path(&mut self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  fn write_record(path: &Path, detections: &DetectionList) -> std::io::Result<()> {
    let records = detections
      .iter()
      .map(|d| {
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          d.class_id, d.score, d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]
        )
      })
      .collect::<Vec<_>>();
    std::fs::write(path.with_extension("txt"), records.join("\n"))
  }
}

impl DisplaySink for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn present(&mut self, frame: &Frame) -> Result<(), Self::Error> {
    let path = self.frame_path()?;
    frame.to_rgb_image()?.save(&path)?;
    debug!("记录帧: {}", path.display());
    Ok(())
  }

  fn present_detections(
    &mut self,
    frame: &Frame,
    detections: &DetectionList,
  ) -> Result<(), Self::Error> {
    if !self.always && detections.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    frame.to_rgb_image()?.save(&path)?;
    if self.record {
      Self::write_record(&path, detections)?;
    }
    debug!("记录帧: {} ({} 个结果)", path.display(), detections.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Detection;

  fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
      let Ok(entries) = std::fs::read_dir(&dir) else {
        continue;
      };
      for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
          stack.push(path);
        } else if path.extension().is_some_and(|e| e == ext) {
          found.push(path);
        }
      }
    }
    found
  }

  #[test]
  fn skips_empty_results_unless_always() {
    let dir = std::env::temp_dir().join(format!("kmbox-record-empty-{}", std::process::id()));
    let frame = Frame::zeroed(4, 4, 3);

    let mut output = DirectoryRecordOutput::new(&dir, false, false);
    output
      .present_detections(&frame, &DetectionList::new())
      .unwrap();
    assert!(files_with_extension(&dir, "png").is_empty());

    let mut output = DirectoryRecordOutput::new(&dir, true, false);
    output
      .present_detections(&frame, &DetectionList::new())
      .unwrap();
    let saved = files_with_extension(&dir, "png");
    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(saved.len(), 1);
  }

  #[test]
  fn writes_text_record_next_to_frame() {
    let dir = std::env::temp_dir().join(format!("kmbox-record-txt-{}", std::process::id()));
    let url = url::Url::parse(&format!("folder://{}?record", dir.display())).unwrap();
    let mut output = DirectoryRecordOutput::from_url(&url).unwrap();

    let mut detections = DetectionList::new();
    detections.push(Detection {
      bbox: [1.0, 2.0, 3.0, 4.0],
      score: 0.5,
      class_id: 7,
    });
    output
      .present_detections(&Frame::zeroed(4, 4, 3), &detections)
      .unwrap();

    let records = files_with_extension(&dir, "txt");
    let content = records
      .first()
      .map(|p| std::fs::read_to_string(p).unwrap())
      .unwrap_or_default();
    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(records.len(), 1);
    assert_eq!(content, "7, 0.5000, 1.0000, 2.0000, 3.0000, 4.0000");
  }
}
