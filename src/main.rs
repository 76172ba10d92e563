// 该文件是 Shoushi （手势） 项目的一部分。
// src/main.rs - 标准输入输出上的方法调用通道
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  io::{self, BufRead, Write},
  sync::mpsc,
  thread,
};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shoushi::{
  FromUrl,
  bridge::{BridgeOptions, DEFAULT_QUEUE_HIGH_WATER, FrameDetectorBridge, setup_engine},
  channel::{HandLandmarkerChannel, PendingResponse, encode_reply},
  convert::JPEG_QUALITY,
  model::EngineWrapper,
};

/// Shoushi 方法调用通道参数配置
///
/// 每行读入一个 JSON 方法调用，按相同顺序每行写出一个应答。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 手部关键点模型，如 handlm:///models/hand?num_hands=2
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// JPEG 中转编码质量
  #[arg(long, value_name = "QUALITY", default_value_t = JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100))]
  pub jpeg_quality: u8,
  /// 检测队列积压告警阈值
  #[arg(long, value_name = "DEPTH", default_value_t = DEFAULT_QUEUE_HIGH_WATER)]
  pub queue_high_water: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_writer(io::stderr).init();

  let args = Args::parse();

  match args.model.as_ref() {
    Some(model) => info!("模型: {}", model),
    None => warn!("未指定模型，检测请求将返回 NOT_INITIALIZED"),
  }

  let options = BridgeOptions {
    jpeg_quality: args.jpeg_quality,
    queue_high_water: args.queue_high_water,
  };
  let model = args.model;
  let bridge = FrameDetectorBridge::spawn_with_options(
    move || model.and_then(|url| setup_engine(|| EngineWrapper::from_url(&url))),
    options,
  )?;
  let channel = HandLandmarkerChannel::new(bridge);

  // 应答按受理顺序写出
  let (tx, rx) = mpsc::channel::<(Option<u64>, PendingResponse)>();
  let writer = thread::Builder::new()
    .name("shoushi-reply".to_string())
    .spawn(move || -> io::Result<()> {
      let stdout = io::stdout();
      for (id, pending) in rx {
        let line = encode_reply(id, pending.wait());
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
      }
      Ok(())
    })?;

  for line in io::stdin().lock().lines() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    if tx.send(channel.dispatch_line(&line)).is_err() {
      warn!("应答线程已退出，停止读取");
      break;
    }
  }

  info!("输入结束，等待 {} 个检测请求完成", channel.bridge().queue_depth());
  drop(tx);
  match writer.join() {
    Ok(result) => result?,
    Err(_) => anyhow::bail!("应答线程异常退出"),
  }
  info!("应答全部写出，退出");

  Ok(())
}
