// 该文件是 KMBox Detect 项目的一部分。
// src/bin/replay.rs - 用录制的推理输出回放检测流水线
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

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use kmbox_detect::{
  FromUrl,
  input::InputWrapper,
  model::{ModelSpec, ReplayAdapter, load_labels},
  output::{OutputWrapper, draw::Annotator},
  task::{Pipeline, PipelineOptions},
};

/// 回放参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型 URL，例如 yolov8:///data/dump.json?classes=80
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 标签字体（TTF/OTF），缺省使用内置字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,

  /// 类别名称：`coco` 或每行一个名称的文本文件，缺省显示类别编号
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<String>,

  /// 逐帧输出各阶段耗时
  #[arg(long)]
  pub latency: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let spec = ModelSpec::from_url(&args.model)?;
  let mut input = InputWrapper::from_url(&args.input)?;
  let mut output = OutputWrapper::from_url(&args.output)?;

  let mut annotator = Annotator::default();
  if let Some(font) = &args.font {
    annotator = annotator.with_font_file(font)?;
  }
  if let Some(labels) = &args.labels {
    annotator = annotator.with_class_names(load_labels(labels)?);
  }

  let options = PipelineOptions::default()
    .with_report_latency(args.latency)
    .with_frame_limit(args.frame_number);
  let mut pipeline = Pipeline::new(ReplayAdapter, spec.config, options)?.with_annotator(annotator);
  pipeline.load(&spec.path)?;

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号");
      stop.store(true, Ordering::Relaxed);
    })?;
  }

  let stats = pipeline.run(&mut input, &mut output, &stop)?;
  info!(
    "共处理 {} 帧，空轮询 {} 次",
    stats.frames, stats.not_ready_polls
  );
  pipeline.release()?;

  Ok(())
}
