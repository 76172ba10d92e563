// 该文件是 Shoushi （手势） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续帧手部关键点检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use shoushi::{
  FromUrl,
  bridge::{FrameDetectorBridge, setup_engine},
  input::InputWrapper,
  model::EngineWrapper,
  output::OutputWrapper,
  task::{ContinuousTask, Task},
};
use tracing::info;

/// Shoushi 连续检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，如 nv21:///data/frames.yuv?width=640&height=480
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let model = args.model;
  let bridge = FrameDetectorBridge::spawn(move || setup_engine(|| EngineWrapper::from_url(&model)))?;

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .run_task(input, &bridge, output)?;

  Ok(())
}
