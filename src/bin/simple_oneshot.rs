// 该文件是 Shoushi （手势） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧手部关键点检测
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
  bridge::{BridgeOptions, FrameDetectorBridge, setup_engine},
  convert::JPEG_QUALITY,
  input::InputWrapper,
  model::EngineWrapper,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};
use tracing::info;

/// Shoushi 单帧检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// JPEG 中转编码质量
  #[arg(long, value_name = "QUALITY", default_value_t = JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100))]
  pub jpeg_quality: u8,
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
  let options = BridgeOptions {
    jpeg_quality: args.jpeg_quality,
    ..BridgeOptions::default()
  };
  let bridge = FrameDetectorBridge::spawn_with_options(
    move || setup_engine(|| EngineWrapper::from_url(&model)),
    options,
  )?;

  OneShotTask.run_task(input, &bridge, output)?;

  Ok(())
}
