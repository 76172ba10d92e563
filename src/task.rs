// 该文件是 Shoushi （手势） 项目的一部分。
// src/task.rs - 检测任务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{thread, time::Duration};
use tracing::{info, warn};

use crate::{
  bridge::{BridgeError, FrameDetectorBridge},
  frame::Nv21Frame,
  model::LandmarkSet,
  output::Render,
};

pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(self, input: I, bridge: &FrameDetectorBridge, output: O) -> Result<(), Self::Error>;
}

fn ensure_engine(bridge: &FrameDetectorBridge) -> anyhow::Result<()> {
  if !bridge.is_engine_ready() {
    return Err(BridgeError::NotInitialized.into());
  }
  Ok(())
}

pub struct OneShotTask;

impl<RE, I, O> Task<I, O> for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Nv21Frame>,
  O: Render<Nv21Frame, LandmarkSet, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, bridge: &FrameDetectorBridge, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    ensure_engine(bridge)?;
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功 ({}x{})，开始检测...", frame.width(), frame.height());
    let now = std::time::Instant::now();
    let result = bridge.detect_frame(&frame)?;
    let elapsed = now.elapsed();
    info!("检测完成，{} 只手，耗时: {:.2?}", result.len(), elapsed);
    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<RE, I, O> Task<I, O> for ContinuousTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Nv21Frame>,
  O: Render<Nv21Frame, LandmarkSet, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, bridge: &FrameDetectorBridge, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    ensure_engine(bridge)?;
    let (tx, rx) = std::sync::mpsc::channel();

    // 同一进程只能设置一次处理函数
    if let Err(e) = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    }) {
      warn!("无法设置中断信号处理: {}", e);
    }

    let mut frame_index = 0usize;
    let mut failed = 0usize;
    let mut now = std::time::Instant::now();
    for frame in input {
      frame_index = frame_index.wrapping_add(1);
      info!("处理第 {} 帧图像", frame_index);
      match bridge.detect_frame(&frame) {
        Ok(result) => {
          let elapsed_a = now.elapsed();
          output.render_result(&frame, &result)?;
          let elapsed_b = now.elapsed();
          info!("检测完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
        }
        Err(e) => {
          failed += 1;
          warn!("第 {} 帧检测失败 [{}]: {}", frame_index, e.code(), e);
        }
      }
      now = std::time::Instant::now();
      if self.frame_number.map(|n| frame_index >= n).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，共 {} 帧，失败 {} 帧", frame_index, failed);
    Ok(())
  }
}
