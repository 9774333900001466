// 该文件是 KMBox Detect 项目的一部分。
// tests/pipeline.rs - 流水线端到端测试
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
  convert::Infallible,
  path::PathBuf,
  sync::atomic::AtomicBool,
  thread,
  time::Duration,
};

use kmbox_detect::{
  FromUrl,
  frame::Frame,
  input::{ChannelInput, ImageFileInput},
  model::{
    Decode, DecodeStrategy, DetectionList, ModelConfig, ModelSpec, RawTensor, ReplayAdapter,
    ReplayDump, TensorLayout, YoloFamily,
    nms::{iou, suppress},
  },
  output::DisplaySink,
  task::{Pipeline, PipelineOptions, PipelineState},
};

#[derive(Default)]
struct RecordingSink {
  results: Vec<DetectionList>,
}

impl DisplaySink for RecordingSink {
  type Error = Infallible;

  fn present(&mut self, _frame: &Frame) -> Result<(), Infallible> {
    Ok(())
  }

  fn present_detections(
    &mut self,
    _frame: &Frame,
    detections: &DetectionList,
  ) -> Result<(), Infallible> {
    self.results.push(detections.clone());
    Ok(())
  }
}

fn logit(p: f32) -> f32 {
  (p / (1.0 - p)).ln()
}

/// 三个尺度统一使用 (10,13) 起始的锚框
const UNIFORM_ANCHORS: &str = "10,13,16,30,33,23,10,13,16,30,33,23,10,13,16,30,33,23";

fn temp_dump(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!("kmbox-it-{}-{}.json", name, std::process::id()))
}

/// 1 尺度 1 锚框 1 类别，2x2 网格。每项为 (格子, 置信度, x 偏移 logit)
fn anchor_based_output(cells: &[(usize, f32, f32)]) -> Vec<RawTensor> {
  let (c, h, w) = (6, 2, 2);
  let mut data = vec![-10.0f32; c * h * w];
  data[..4 * h * w].fill(0.0);
  for &(cell, conf, tx) in cells {
    data[cell] = tx;
    data[4 * h * w + cell] = logit(conf);
    data[5 * h * w + cell] = 20.0;
  }
  vec![RawTensor::f32(vec![1, c, h, w], TensorLayout::Nchw, data)]
}

/// (0,0) 置信度 0.9；(0,1) 置信度 0.3，x 偏移压到最小，几乎与前者重合
fn overlapping_pair() -> Vec<RawTensor> {
  anchor_based_output(&[(0, 0.9, 0.0), (1, 0.3, -10.0)])
}

fn v5_config(box_thresh: f32, nms_thresh: f32) -> ModelConfig {
  ModelConfig::new(YoloFamily::V5)
    .with_input_size(64, 64)
    .with_class_num(1)
    .with_thresholds(box_thresh, nms_thresh)
    .with_anchors(Some([[10, 13, 16, 30, 33, 23]; 3]))
}

/// 融合输出，2 类别，2x2 网格。每项为 (格子, 类别, 类别 logit, ltrb 距离)
fn anchor_free_output(cells: &[(usize, usize, f32, [f32; 4])]) -> Vec<RawTensor> {
  let (c, h, w) = (6, 2, 2);
  let mut data = vec![-10.0f32; c * h * w];
  data[..4 * h * w].fill(0.0);
  for &(cell, class, logit, dist) in cells {
    for (side, d) in dist.iter().enumerate() {
      data[side * h * w + cell] = *d;
    }
    data[(4 + class) * h * w + cell] = logit;
  }
  vec![RawTensor::f32(vec![1, c, h, w], TensorLayout::Nchw, data)]
}

fn replay_pipeline(
  url: &str,
  dump: &ReplayDump,
  path: &PathBuf,
  options: PipelineOptions,
) -> Pipeline<ReplayAdapter> {
  dump.save(path).unwrap();
  let spec = ModelSpec::from_url(&url::Url::parse(url).unwrap()).unwrap();
  let mut pipeline = Pipeline::new(ReplayAdapter, spec.config, options).unwrap();
  pipeline.load(&spec.path).unwrap();
  pipeline
}

fn quiet() -> PipelineOptions {
  PipelineOptions::default().with_report_latency(false)
}

#[test]
fn anchor_based_single_scale_keeps_confident_cell() {
  let path = temp_dump("v5");
  let mut dump = ReplayDump::new(64, 64);
  dump.push(&overlapping_pair());
  let url = format!(
    "yolov5://{}?classes=1&width=64&height=64&box_thresh=0.5&nms_thresh=0.4&anchors={}",
    path.display(),
    UNIFORM_ANCHORS
  );
  let mut pipeline = replay_pipeline(&url, &dump, &path, quiet());

  let mut input = ImageFileInput::new(Frame::zeroed(64, 64, 3), 3);
  let mut sink = RecordingSink::default();
  let stats = pipeline
    .run(&mut input, &mut sink, &AtomicBool::new(false))
    .unwrap();
  std::fs::remove_file(&path).ok();

  assert_eq!(stats.frames, 3);
  assert_eq!(pipeline.state(), PipelineState::Draining);
  assert_eq!(sink.results.len(), 3);
  for detections in &sink.results {
    assert_eq!(detections.len(), 1);
    let detection = detections.as_slice()[0];
    assert!((detection.score - 0.9).abs() < 1e-4);
    assert_eq!(detection.class_id, 0);
    assert_eq!(detection.bbox, [11.0, 9.5, 21.0, 22.5]);
    assert!(!detections.overflowed());
  }

  pipeline.release().unwrap();
  assert_eq!(pipeline.state(), PipelineState::Released);
}

#[test]
fn low_confidence_neighbour_is_cut_by_threshold_before_nms() {
  let raw = overlapping_pair();
  let decoder = DecodeStrategy::for_family(YoloFamily::V5);

  let candidates = decoder.decode(&raw, &v5_config(0.5, 0.4)).unwrap();
  assert_eq!(candidates.len(), 1);
  assert_eq!(suppress(candidates.clone(), 0.4), candidates);

  // 放低阈值后两个框都进入 NMS，只留下 0.9 的那个
  let candidates = decoder.decode(&raw, &v5_config(0.2, 0.4)).unwrap();
  assert_eq!(candidates.len(), 2);
  assert!(iou(&candidates[0].bbox, &candidates[1].bbox) >= 0.4);
  let kept = suppress(candidates, 0.4);
  assert_eq!(kept.len(), 1);
  assert!((kept[0].score - 0.9).abs() < 1e-4);
}

#[test]
fn anchor_free_identical_boxes_survive_only_across_classes() {
  let path = temp_dump("v8");
  let mut dump = ReplayDump::new(64, 64);
  // 两个格子回归出同一个框 [0, 0, 64, 32]
  let left = [0.5, 0.5, 1.5, 0.5];
  let right = [1.5, 0.5, 0.5, 0.5];
  dump.push(&anchor_free_output(&[(0, 0, 5.0, left), (1, 1, 3.0, right)]));
  dump.push(&anchor_free_output(&[(0, 0, 5.0, left), (1, 0, 3.0, right)]));
  let url = format!(
    "yolov8://{}?classes=2&width=64&height=64&box_thresh=0.5&nms_thresh=0.45",
    path.display()
  );
  let mut pipeline = replay_pipeline(&url, &dump, &path, quiet());

  let mut input = ImageFileInput::new(Frame::zeroed(64, 64, 3), 2);
  let mut sink = RecordingSink::default();
  pipeline
    .run(&mut input, &mut sink, &AtomicBool::new(false))
    .unwrap();
  std::fs::remove_file(&path).ok();

  let [cross, same] = sink.results.as_slice() else {
    panic!("expected two frames, got {}", sink.results.len());
  };
  assert_eq!(cross.len(), 2);
  assert_eq!(cross.as_slice()[0].class_id, 0);
  assert_eq!(cross.as_slice()[1].class_id, 1);
  assert_eq!(cross.as_slice()[0].bbox, [0.0, 0.0, 64.0, 32.0]);
  assert!(cross.as_slice()[0].score > cross.as_slice()[1].score);

  assert_eq!(same.len(), 1);
  assert_eq!(same.as_slice()[0].class_id, 0);
}

#[test]
fn channel_input_waits_for_late_frames() {
  let path = temp_dump("channel");
  let mut dump = ReplayDump::new(64, 64);
  dump.push(&anchor_based_output(&[(3, 0.8, 0.0)]));
  let url = format!(
    "yolov5://{}?classes=1&width=64&height=64&anchors={}",
    path.display(),
    UNIFORM_ANCHORS
  );
  let mut pipeline = replay_pipeline(&url, &dump, &path, quiet());

  let (tx, mut input) = ChannelInput::pair();
  let producer = thread::spawn(move || {
    thread::sleep(Duration::from_millis(30));
    for _ in 0..2 {
      tx.send(Frame::zeroed(64, 64, 3)).unwrap();
    }
  });

  let mut sink = RecordingSink::default();
  let stats = pipeline
    .run(&mut input, &mut sink, &AtomicBool::new(false))
    .unwrap();
  producer.join().unwrap();
  std::fs::remove_file(&path).ok();

  assert_eq!(stats.frames, 2);
  assert!(stats.not_ready_polls >= 1);
  assert_eq!(sink.results.len(), 2);
  assert!(sink.results.iter().all(|d| d.len() == 1));
}

#[test]
fn frame_size_mismatch_with_replay_is_letterboxed() {
  let path = temp_dump("letterbox");
  let mut dump = ReplayDump::new(64, 64);
  dump.push(&anchor_based_output(&[(0, 0.9, 0.0)]));
  let url = format!(
    "yolov5://{}?classes=1&width=64&height=64&anchors={}",
    path.display(),
    UNIFORM_ANCHORS
  );
  let mut pipeline = replay_pipeline(&url, &dump, &path, quiet().with_frame_limit(Some(1)));

  let mut input = ImageFileInput::new(Frame::zeroed(128, 128, 3), 5);
  let mut sink = RecordingSink::default();
  let stats = pipeline
    .run(&mut input, &mut sink, &AtomicBool::new(false))
    .unwrap();
  std::fs::remove_file(&path).ok();

  assert_eq!(stats.frames, 1);
  assert_eq!(input.remaining(), 4);
  // 128x128 缩放到 64x64，无填充
  assert_eq!(sink.results[0].as_slice()[0].bbox, [22.0, 19.0, 42.0, 45.0]);
}
