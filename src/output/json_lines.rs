// 该文件是 Shoushi （手势） 项目的一部分。
// src/output/json_lines.rs - 逐帧记录检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::Path,
  sync::Mutex,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Nv21Frame, model::LandmarkSet, output::Render};

#[derive(Error, Debug)]
pub enum JsonLinesOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 编码错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 单帧记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
  pub frame: u64,
  pub width: u32,
  pub height: u32,
  pub hands: LandmarkSet,
  pub features: Vec<f64>,
}

/// `json:///path/to/result.jsonl`，每帧一行
pub struct JsonLinesOutput {
  writer: Mutex<BufWriter<File>>,
  frame_counter: Mutex<u64>,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonLinesOutputError::SchemeMismatch);
    }

    let path = Path::new(uri.path());
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    Ok(JsonLinesOutput {
      writer: Mutex::new(BufWriter::new(File::create(path)?)),
      frame_counter: Mutex::new(0),
    })
  }
}

impl JsonLinesOutput {
  fn frame_id(&self) -> u64 {
    let mut counter = self.frame_counter.lock().unwrap_or_else(|e| e.into_inner());
    *counter += 1;
    *counter
  }
}

impl Render<Nv21Frame, LandmarkSet> for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn render_result(&self, frame: &Nv21Frame, result: &LandmarkSet) -> Result<(), Self::Error> {
    let record = FrameRecord {
      frame: self.frame_id(),
      width: frame.width(),
      height: frame.height(),
      hands: result.clone(),
      features: result.relative_features(),
    };
    let line = serde_json::to_string(&record)?;

    let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(writer, "{}", line)?;
    // 每帧落盘，进程被中断时不丢记录
    writer.flush()?;
    debug!("记录第 {} 帧结果", record.frame);

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::RELATIVE_FEATURE_LEN;

  #[test]
  fn writes_one_line_per_frame() {
    let path = std::env::temp_dir().join(format!("shoushi-json-{}.jsonl", std::process::id()));
    let url = Url::parse(&format!("json://{}", path.display())).unwrap();
    let output = JsonLinesOutput::from_url(&url).unwrap();

    let frame = Nv21Frame::new(vec![0; 6], 2, 2);
    output
      .render_result(&frame, &LandmarkSet::from(vec![vec![0.75, 0.5, 0.25, 1.0]]))
      .unwrap();
    output.render_result(&frame, &LandmarkSet::default()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let records: Vec<FrameRecord> = text
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].frame, 1);
    assert_eq!(records[0].features.len(), RELATIVE_FEATURE_LEN);
    assert_eq!(&records[0].features[..4], &[0.5, 0.0, 0.0, 0.5]);
    assert!(records[1].features.is_empty());
    assert_eq!(records[1].frame, 2);
    assert!(records[1].hands.is_empty());
    let _ = std::fs::remove_file(&path);
  }
}
