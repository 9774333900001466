// 该文件是 KMBox Detect 项目的一部分。
// src/model/config.rs - 模型配置
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

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, url_file_path};

/// 三个检测尺度 × 三个锚框的 (宽, 高)
pub type AnchorTable = [[u32; 6]; 3];

/// COCO 上训练的 YOLOv5/YOLOv7 默认锚框
pub const DEFAULT_ANCHORS: AnchorTable = [
  [10, 13, 16, 30, 33, 23],
  [30, 61, 62, 45, 59, 119],
  [116, 90, 156, 198, 373, 326],
];

const DEFAULT_INPUT_SIZE: usize = 640;
const DEFAULT_CLASS_NUM: usize = 80;
const DEFAULT_BOX_THRESH: f32 = 0.5;
const DEFAULT_NMS_THRESH: f32 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YoloFamily {
  V5,
  V6,
  V7,
  V8,
  V10,
  V11,
}

impl YoloFamily {
  pub const ALL: [YoloFamily; 6] = [
    YoloFamily::V5,
    YoloFamily::V6,
    YoloFamily::V7,
    YoloFamily::V8,
    YoloFamily::V10,
    YoloFamily::V11,
  ];

  pub fn from_version(version: u32) -> Option<Self> {
    match version {
      5 => Some(YoloFamily::V5),
      6 => Some(YoloFamily::V6),
      7 => Some(YoloFamily::V7),
      8 => Some(YoloFamily::V8),
      10 => Some(YoloFamily::V10),
      11 => Some(YoloFamily::V11),
      _ => None,
    }
  }

  pub fn version(self) -> u32 {
    match self {
      YoloFamily::V5 => 5,
      YoloFamily::V6 => 6,
      YoloFamily::V7 => 7,
      YoloFamily::V8 => 8,
      YoloFamily::V10 => 10,
      YoloFamily::V11 => 11,
    }
  }

  /// 带独立目标置信度、需要锚框的检测头
  pub fn is_anchor_based(self) -> bool {
    matches!(self, YoloFamily::V5 | YoloFamily::V7)
  }

  pub fn scheme(self) -> &'static str {
    match self {
      YoloFamily::V5 => "yolov5",
      YoloFamily::V6 => "yolov6",
      YoloFamily::V7 => "yolov7",
      YoloFamily::V8 => "yolov8",
      YoloFamily::V10 => "yolov10",
      YoloFamily::V11 => "yolov11",
    }
  }
}

impl fmt::Display for YoloFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.scheme())
  }
}

impl FromStr for YoloFamily {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let version = s
      .trim()
      .trim_start_matches("yolov")
      .trim_start_matches('v')
      .parse::<u32>()
      .map_err(|_| ConfigError::UnknownFamily(s.to_string()))?;
    YoloFamily::from_version(version).ok_or_else(|| ConfigError::UnknownFamily(s.to_string()))
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("不支持的 YOLO 版本: {0}")]
  UnknownFamily(String),
  #[error("阈值 {name} 超出 [0, 1] 范围: {value}")]
  ThresholdOutOfRange { name: &'static str, value: f32 },
  #[error("模型输入尺寸无效: {width}x{height}x{channels}")]
  InvalidGeometry {
    width: usize,
    height: usize,
    channels: usize,
  },
  #[error("类别数量必须大于 0")]
  NoClasses,
  #[error("{0} 是无锚框模型，不能设置锚框")]
  UnexpectedAnchors(YoloFamily),
  #[error("{0} 需要锚框参数")]
  MissingAnchors(YoloFamily),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 一个已加载模型的静态描述
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
  pub family: YoloFamily,
  pub input_width: usize,
  pub input_height: usize,
  pub input_channels: usize,
  pub is_quant: bool,
  pub class_num: usize,
  box_thresh: f32,
  nms_thresh: f32,
  anchors: Option<AnchorTable>,
}

impl ModelConfig {
  /// 以默认参数创建配置，锚框类模型使用默认锚框
  pub fn new(family: YoloFamily) -> Self {
    Self {
      family,
      input_width: DEFAULT_INPUT_SIZE,
      input_height: DEFAULT_INPUT_SIZE,
      input_channels: crate::frame::RGB_CHANNELS,
      is_quant: false,
      class_num: DEFAULT_CLASS_NUM,
      box_thresh: DEFAULT_BOX_THRESH,
      nms_thresh: DEFAULT_NMS_THRESH,
      anchors: family.is_anchor_based().then_some(DEFAULT_ANCHORS),
    }
  }

  pub fn with_input_size(mut self, width: usize, height: usize) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn with_class_num(mut self, class_num: usize) -> Self {
    self.class_num = class_num;
    self
  }

  pub fn with_quant(mut self, is_quant: bool) -> Self {
    self.is_quant = is_quant;
    self
  }

  pub fn with_thresholds(mut self, box_thresh: f32, nms_thresh: f32) -> Self {
    self.box_thresh = box_thresh;
    self.nms_thresh = nms_thresh;
    self
  }

  pub fn with_anchors(mut self, anchors: Option<AnchorTable>) -> Self {
    self.anchors = anchors;
    self
  }

  pub fn box_thresh(&self) -> f32 {
    self.box_thresh
  }

  pub fn nms_thresh(&self) -> f32 {
    self.nms_thresh
  }

  pub fn anchors(&self) -> Option<&AnchorTable> {
    self.anchors.as_ref()
  }

  /// 调整阈值，两个阈值都合法时才生效
  pub fn set_thresholds(&mut self, box_thresh: f32, nms_thresh: f32) -> Result<(), ConfigError> {
    check_threshold("box_thresh", box_thresh)?;
    check_threshold("nms_thresh", nms_thresh)?;
    self.box_thresh = box_thresh;
    self.nms_thresh = nms_thresh;
    Ok(())
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    check_threshold("box_thresh", self.box_thresh)?;
    check_threshold("nms_thresh", self.nms_thresh)?;

    if self.input_width == 0 || self.input_height == 0 || self.input_channels == 0 {
      return Err(ConfigError::InvalidGeometry {
        width: self.input_width,
        height: self.input_height,
        channels: self.input_channels,
      });
    }
    if self.class_num == 0 {
      return Err(ConfigError::NoClasses);
    }

    match (self.family.is_anchor_based(), self.anchors.is_some()) {
      (true, false) => Err(ConfigError::MissingAnchors(self.family)),
      (false, true) => Err(ConfigError::UnexpectedAnchors(self.family)),
      _ => Ok(()),
    }
  }
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::ThresholdOutOfRange { name, value })
  }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.parse::<T>().map_err(|_| ConfigError::InvalidParameter {
    key: key.to_string(),
    value: value.to_string(),
  })
}

fn parse_anchors(value: &str) -> Result<AnchorTable, ConfigError> {
  let invalid = || ConfigError::InvalidParameter {
    key: "anchors".to_string(),
    value: value.to_string(),
  };

  let numbers = value
    .split(',')
    .map(|s| s.trim().parse::<u32>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|_| invalid())?;
  if numbers.len() != 18 {
    return Err(invalid());
  }

  let mut table = [[0u32; 6]; 3];
  for (i, v) in numbers.into_iter().enumerate() {
    table[i / 6][i % 6] = v;
  }
  Ok(table)
}

/// 模型 URL：`yolov5:///path/model.rknn?classes=80&box_thresh=0.5`
#[derive(Debug, Clone)]
pub struct ModelSpec {
  pub path: PathBuf,
  pub config: ModelConfig,
}

impl FromUrl for ModelSpec {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let family: YoloFamily = url.scheme().parse()?;
    let mut config = ModelConfig::new(family);

    for (key, value) in url.query_pairs() {
      match &*key {
        "classes" => config.class_num = parse_param(&key, &value)?,
        "width" => config.input_width = parse_param(&key, &value)?,
        "height" => config.input_height = parse_param(&key, &value)?,
        "channels" => config.input_channels = parse_param(&key, &value)?,
        "quant" => config.is_quant = parse_param(&key, &value)?,
        "box_thresh" => config.box_thresh = parse_param(&key, &value)?,
        "nms_thresh" => config.nms_thresh = parse_param(&key, &value)?,
        "anchors" => config.anchors = Some(parse_anchors(&value)?),
        other => debug!("忽略未知的模型参数: {}", other),
      }
    }

    config.validate()?;

    Ok(ModelSpec {
      path: url_file_path(url),
      config,
    })
  }
}
