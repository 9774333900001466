// 该文件是 KMBox Detect 项目的一部分。
// src/task.rs - 检测流水线
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
  fmt,
  path::Path,
  sync::atomic::{AtomicBool, Ordering},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{Frame, FrameError},
  input::{Acquire, FrameSource},
  model::{
    ConfigError, Decode, DecodeError, DecodeStrategy, DetectionCandidate, DetectionList, InferError,
    InferenceAdapter, Letterbox, LoadError, ModelConfig, RawTensor, RawTensorOutput, nms,
  },
  output::{
    DisplaySink,
    draw::{AnnotateError, Annotator},
  },
};

/// 没有新帧时的等待时间
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  ModelLoaded,
  Running,
  Draining,
  Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Load,
  Acquire,
  Inference,
  Decode,
  Render,
  Display,
  Lifecycle,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Load => "加载",
      Stage::Acquire => "取帧",
      Stage::Inference => "推理",
      Stage::Decode => "解码",
      Stage::Render => "绘制",
      Stage::Display => "显示",
      Stage::Lifecycle => "生命周期",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("模型配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("模型加载失败: {0}")]
  Load(#[from] LoadError),
  #[error("取帧失败: {0}")]
  Acquire(#[source] BoxError),
  #[error("预处理失败: {0}")]
  Preprocess(#[from] FrameError),
  #[error(transparent)]
  Infer(#[from] InferError),
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error("绘制失败: {0}")]
  Render(#[from] AnnotateError),
  #[error("输出失败: {0}")]
  Display(#[source] BoxError),
  #[error("模型已释放")]
  UseAfterRelease,
  #[error("当前状态 {state:?} 下不能执行 {operation}")]
  InvalidState {
    state: PipelineState,
    operation: &'static str,
  },
}

impl PipelineError {
  pub fn stage(&self) -> Stage {
    match self {
      PipelineError::Config(_) | PipelineError::Load(_) => Stage::Load,
      PipelineError::Acquire(_) => Stage::Acquire,
      PipelineError::Preprocess(_) | PipelineError::Infer(_) => Stage::Inference,
      PipelineError::Decode(_) => Stage::Decode,
      PipelineError::Render(_) => Stage::Render,
      PipelineError::Display(_) => Stage::Display,
      PipelineError::UseAfterRelease | PipelineError::InvalidState { .. } => Stage::Lifecycle,
    }
  }

  /// 非零错误码。推理错误沿用运行时给出的错误码
  pub fn code(&self) -> i32 {
    match self {
      PipelineError::Load(_) => 1,
      PipelineError::Config(_) => 2,
      PipelineError::Acquire(_) => 3,
      PipelineError::Preprocess(_) => 4,
      PipelineError::Infer(e) if e.code != 0 => e.code,
      PipelineError::Infer(_) => 5,
      PipelineError::Decode(_) => 6,
      PipelineError::Render(_) => 7,
      PipelineError::Display(_) => 8,
      PipelineError::UseAfterRelease => 9,
      PipelineError::InvalidState { .. } => 10,
    }
  }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
  pub poll_interval: Duration,
  pub report_latency: bool,
  pub frame_limit: Option<usize>,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      poll_interval: DEFAULT_POLL_INTERVAL,
      report_latency: true,
      frame_limit: None,
    }
  }
}

impl PipelineOptions {
  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  pub fn with_report_latency(mut self, report_latency: bool) -> Self {
    self.report_latency = report_latency;
    self
  }

  pub fn with_frame_limit(mut self, frame_limit: Option<usize>) -> Self {
    self.frame_limit = frame_limit;
    self
  }
}

/// 单帧各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageLatency {
  pub acquire: Duration,
  pub inference: Duration,
  /// 解码与 NMS
  pub decode: Duration,
  pub render: Duration,
  pub display: Duration,
}

impl StageLatency {
  pub fn total(&self) -> Duration {
    self.acquire + self.inference + self.decode + self.render + self.display
  }
}

#[derive(Debug, Clone)]
pub struct FrameReport {
  /// 从 1 开始的帧序号
  pub index: usize,
  pub detections: DetectionList,
  pub latency: StageLatency,
}

#[derive(Debug)]
pub enum Step {
  Frame(FrameReport),
  NotReady,
  EndOfStream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
  pub frames: usize,
  pub not_ready_polls: usize,
}

/// 取帧 → 推理 → 解码 → NMS → 绘制 → 输出
///
/// 模型句柄由流水线独占，`release` 或析构时释放且只释放一次。
pub struct Pipeline<A: InferenceAdapter> {
  adapter: A,
  handle: Option<A::Handle>,
  config: ModelConfig,
  strategy: DecodeStrategy,
  annotator: Annotator,
  options: PipelineOptions,
  state: PipelineState,
  stats: PipelineStats,
}

impl<A: InferenceAdapter> Pipeline<A> {
  pub fn new(adapter: A, config: ModelConfig, options: PipelineOptions) -> Result<Self, PipelineError> {
    config.validate()?;
    let strategy = DecodeStrategy::for_family(config.family);
    info!(
      "创建检测流水线: {}, 输入 {}x{}, 类别数 {}, 量化 {}",
      config.family, config.input_width, config.input_height, config.class_num, config.is_quant
    );

    Ok(Self {
      adapter,
      handle: None,
      config,
      strategy,
      annotator: Annotator::default(),
      options,
      state: PipelineState::Idle,
      stats: PipelineStats::default(),
    })
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = annotator;
    self
  }

  pub fn state(&self) -> PipelineState {
    self.state
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn stats(&self) -> PipelineStats {
    self.stats
  }

  fn invalid(&self, operation: &'static str) -> PipelineError {
    if self.state == PipelineState::Released {
      PipelineError::UseAfterRelease
    } else {
      PipelineError::InvalidState {
        state: self.state,
        operation,
      }
    }
  }

  pub fn load(&mut self, path: &Path) -> Result<(), PipelineError> {
    if self.state != PipelineState::Idle {
      return Err(self.invalid("load"));
    }

    info!("加载模型文件: {}", path.display());
    match self.adapter.load(path, &self.config) {
      Ok(handle) => {
        self.handle = Some(handle);
        self.state = PipelineState::ModelLoaded;
        info!("模型加载完成");
        Ok(())
      }
      Err(e) => {
        error!("模型加载失败: {}", e);
        Err(e.into())
      }
    }
  }

  pub fn start(&mut self) -> Result<(), PipelineError> {
    match self.state {
      PipelineState::ModelLoaded => {
        info!("开始任务...");
        self.state = PipelineState::Running;
        Ok(())
      }
      PipelineState::Running => Ok(()),
      _ => Err(self.invalid("start")),
    }
  }

  /// 在两帧之间调整阈值
  pub fn set_thresholds(&mut self, box_thresh: f32, nms_thresh: f32) -> Result<(), PipelineError> {
    if self.state == PipelineState::Released {
      return Err(PipelineError::UseAfterRelease);
    }
    self.config.set_thresholds(box_thresh, nms_thresh)?;
    debug!("阈值调整为 box {} / nms {}", box_thresh, nms_thresh);
    Ok(())
  }

  /// 对模型尺寸的帧执行推理
  pub fn infer(&mut self, frame: &Frame) -> Result<RawTensorOutput, PipelineError> {
    let handle = match self.handle.as_mut() {
      Some(handle) => handle,
      None => return Err(self.invalid("infer")),
    };
    Ok(self.adapter.infer(handle, frame)?)
  }

  pub fn decode(&self, raw: &[RawTensor]) -> Result<Vec<DetectionCandidate>, PipelineError> {
    if self.state == PipelineState::Released {
      return Err(PipelineError::UseAfterRelease);
    }
    Ok(self.strategy.decode(raw, &self.config)?)
  }

  /// 处理一次取帧。没有新帧时等待 `poll_interval` 后返回 `Step::NotReady`
  pub fn step<S, D>(&mut self, source: &mut S, sink: &mut D) -> Result<Step, PipelineError>
  where
    S: FrameSource,
    S::Error: std::error::Error + Send + Sync + 'static,
    D: DisplaySink,
    D::Error: std::error::Error + Send + Sync + 'static,
  {
    match self.state {
      PipelineState::Running => {}
      PipelineState::Draining => return Ok(Step::EndOfStream),
      _ => return Err(self.invalid("step")),
    }

    let started = Instant::now();
    let mut frame = match source
      .acquire()
      .map_err(|e| PipelineError::Acquire(Box::new(e)))?
    {
      Acquire::Frame(frame) => frame,
      Acquire::NotReady => {
        thread::sleep(self.options.poll_interval);
        self.stats.not_ready_polls += 1;
        debug!("输入暂无数据，{:?} 后重试", self.options.poll_interval);
        return Ok(Step::NotReady);
      }
      Acquire::EndOfStream => {
        info!("输入结束，共处理 {} 帧", self.stats.frames);
        self.state = PipelineState::Draining;
        return Ok(Step::EndOfStream);
      }
    };
    let mut latency = StageLatency {
      acquire: started.elapsed(),
      ..Default::default()
    };

    // 推理
    let now = Instant::now();
    let (width, height) = (self.config.input_width, self.config.input_height);
    let (resized, letterbox) = if (frame.width(), frame.height()) == (width, height) {
      (None, Letterbox::IDENTITY)
    } else {
      let (resized, letterbox) = Letterbox::apply(&frame, width, height)?;
      (Some(resized), letterbox)
    };
    let raw = self.infer(resized.as_ref().unwrap_or(&frame))?;
    latency.inference = now.elapsed();

    // 解码与 NMS
    let now = Instant::now();
    let candidates = self.decode(&raw)?;
    let detections = nms::filter(
      candidates,
      self.config.nms_thresh(),
      &letterbox,
      frame.width(),
      frame.height(),
    );
    latency.decode = now.elapsed();

    // 绘制
    let now = Instant::now();
    self.annotator.annotate(&mut frame, &detections)?;
    latency.render = now.elapsed();

    // 输出
    let now = Instant::now();
    sink
      .present_detections(&frame, &detections)
      .map_err(|e| PipelineError::Display(Box::new(e)))?;
    latency.display = now.elapsed();

    self.stats.frames += 1;
    let index = self.stats.frames;
    if self.options.report_latency {
      info!(
        "第 {} 帧: 检测 {} 个, 取帧 {:.2?}, 推理 {:.2?}, 解码 {:.2?}, 绘制 {:.2?}, 显示 {:.2?}",
        index,
        detections.len(),
        latency.acquire,
        latency.inference,
        latency.decode,
        latency.render,
        latency.display
      );
    }

    Ok(Step::Frame(FrameReport {
      index,
      detections,
      latency,
    }))
  }

  /// 循环处理直到输入结束、收到停止信号或达到帧数上限
  pub fn run<S, D>(
    &mut self,
    source: &mut S,
    sink: &mut D,
    stop: &AtomicBool,
  ) -> Result<PipelineStats, PipelineError>
  where
    S: FrameSource,
    S::Error: std::error::Error + Send + Sync + 'static,
    D: DisplaySink,
    D::Error: std::error::Error + Send + Sync + 'static,
  {
    self.start()?;

    loop {
      if stop.load(Ordering::Relaxed) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      match self.step(source, sink)? {
        Step::Frame(report) => {
          if self.options.frame_limit.is_some_and(|n| report.index >= n) {
            info!("达到指定帧数 {}, 退出任务循环", report.index);
            break;
          }
        }
        Step::NotReady => {}
        Step::EndOfStream => break,
      }
    }

    info!("任务完成，退出");
    Ok(self.stats)
  }

  /// 释放模型句柄，之后的所有调用都会失败
  pub fn release(&mut self) -> Result<(), PipelineError> {
    match self.state {
      PipelineState::ModelLoaded | PipelineState::Running | PipelineState::Draining => {}
      _ => return Err(self.invalid("release")),
    }
    if let Some(handle) = self.handle.take() {
      self.adapter.release(handle);
    }
    self.state = PipelineState::Released;
    info!("模型已释放");
    Ok(())
  }
}

impl<A: InferenceAdapter> Drop for Pipeline<A> {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      debug!("流水线析构，释放模型句柄");
      self.adapter.release(handle);
    }
  }
}
