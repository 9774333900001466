// 该文件是 KMBox Detect 项目的一部分。
// src/input/channel_input.rs - 由采集线程通过通道送入的帧
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
  sync::mpsc::{self, Receiver, Sender, TryRecvError},
};

use crate::{
  frame::Frame,
  input::{Acquire, FrameSource},
};

/// 通道为空时返回 `NotReady`，所有发送端关闭后返回 `EndOfStream`
pub struct ChannelInput {
  rx: Receiver<Frame>,
}

impl ChannelInput {
  pub fn new(rx: Receiver<Frame>) -> Self {
    Self { rx }
  }

  /// 创建发送端与输入
  pub fn pair() -> (Sender<Frame>, Self) {
    let (tx, rx) = mpsc::channel();
    (tx, Self::new(rx))
  }
}

impl FrameSource for ChannelInput {
  type Error = Infallible;

  fn acquire(&mut self) -> Result<Acquire, Self::Error> {
    match self.rx.try_recv() {
      Ok(frame) => Ok(Acquire::Frame(frame)),
      Err(TryRecvError::Empty) => Ok(Acquire::NotReady),
      Err(TryRecvError::Disconnected) => Ok(Acquire::EndOfStream),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_then_frame_then_end() {
    let (tx, mut input) = ChannelInput::pair();
    assert!(matches!(input.acquire(), Ok(Acquire::NotReady)));

    tx.send(Frame::zeroed(2, 2, 3)).unwrap();
    assert!(matches!(input.acquire(), Ok(Acquire::Frame(_))));
    assert!(matches!(input.acquire(), Ok(Acquire::NotReady)));

    tx.send(Frame::zeroed(2, 2, 3)).unwrap();
    drop(tx);
    // 已发送的帧仍然先被取出
    assert!(matches!(input.acquire(), Ok(Acquire::Frame(_))));
    assert!(matches!(input.acquire(), Ok(Acquire::EndOfStream)));
  }
}
