// 该文件是 Shoushi （手势） 项目的一部分。
// src/input/nv21_file.rs - NV21 原始帧文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Nv21Frame, query_value};

#[derive(Error, Debug)]
pub enum Nv21FileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("缺少或无效的尺寸参数: {0}")]
  InvalidDimension(&'static str),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 连续存放的 NV21 帧，`nv21:///path/to/frames.yuv?width=640&height=480`
///
/// 文件末尾不足一帧的数据仍作为一帧送出，由检测桥报告解码错误。
pub struct Nv21FileInput {
  data: Vec<u8>,
  offset: usize,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for Nv21FileInput {
  const SCHEME: &'static str = "nv21";
}

fn dimension(url: &Url, key: &'static str) -> Result<u32, Nv21FileInputError> {
  query_value(url, key)
    .and_then(|v| v.parse::<u32>().ok())
    .filter(|v| *v > 0)
    .ok_or(Nv21FileInputError::InvalidDimension(key))
}

impl FromUrl for Nv21FileInput {
  type Error = Nv21FileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Nv21FileInputError::SchemeMismatch);
    }

    let width = dimension(url, "width")?;
    let height = dimension(url, "height")?;
    let data = std::fs::read(url.path())?;
    info!(
      "读取 NV21 文件: {} ({} 字节, {}x{})",
      url.path(),
      data.len(),
      width,
      height
    );

    Ok(Self::new(data, width, height))
  }
}

impl Nv21FileInput {
  pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
    Self {
      data,
      offset: 0,
      width,
      height,
    }
  }

  fn frame_len(&self) -> usize {
    Nv21Frame::expected_len(self.width, self.height).unwrap_or(usize::MAX)
  }
}

impl Iterator for Nv21FileInput {
  type Item = Nv21Frame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.offset >= self.data.len() {
      return None;
    }
    let end = self.offset.saturating_add(self.frame_len()).min(self.data.len());
    let chunk = self.data[self.offset..end].to_vec();
    if end - self.offset < self.frame_len() {
      warn!("NV21 文件末尾数据不足一帧: {} 字节", chunk.len());
    }
    self.offset = end;
    Some(Nv21Frame::new(chunk, self.width, self.height))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_frames_and_keeps_tail() {
    // 4x2 的帧为 12 字节
    let input = Nv21FileInput::new(vec![0; 30], 4, 2);
    let frames: Vec<_> = input.collect();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].is_complete());
    assert!(frames[1].is_complete());
    assert!(!frames[2].is_complete());
    assert_eq!(frames[2].as_bytes().len(), 6);
  }

  #[test]
  fn dimensions_are_required() {
    let url = Url::parse("nv21:///tmp/none.yuv?width=640").unwrap();
    assert!(matches!(
      Nv21FileInput::from_url(&url),
      Err(Nv21FileInputError::InvalidDimension("height"))
    ));
    let url = Url::parse("nv21:///tmp/none.yuv?width=0&height=2").unwrap();
    assert!(matches!(
      Nv21FileInput::from_url(&url),
      Err(Nv21FileInputError::InvalidDimension("width"))
    ));
  }
}
