// 该文件是 Shoushi （手势） 项目的一部分。
// src/convert.rs - NV21 / RGB / JPEG 格式转换
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

use image::{ExtendedColorType, ImageEncoder, ImageFormat, RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::debug;

use crate::frame::{DecodedImage, Nv21Frame};

/// 相机帧重编码时使用的 JPEG 质量
pub const JPEG_QUALITY: u8 = 50;

#[derive(Error, Debug)]
pub enum ConvertError {
  #[error("图像尺寸无效: {0}x{1}")]
  InvalidDimensions(u32, u32),
  #[error("NV21 数据长度不足: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  Truncated { expected: usize, actual: usize },
  #[error("JPEG 编码错误: {0}")]
  Encode(image::ImageError),
  #[error("JPEG 解码错误: {0}")]
  Decode(image::ImageError),
}

fn clamp_u8(value: f32) -> u8 {
  value.round().clamp(0.0, 255.0) as u8
}

/// NV21 中第 (x, y) 个像素对应的 V 分量下标，U 分量紧随其后
fn chroma_index(width: u32, height: u32, x: u32, y: u32) -> usize {
  let stride = (width as usize).div_ceil(2) * 2;
  (width as usize) * (height as usize) + (y as usize / 2) * stride + (x as usize / 2) * 2
}

/// 按 JFIF 全范围 BT.601 系数将 NV21 转换为 RGB
pub fn nv21_to_rgb(frame: &Nv21Frame) -> Result<RgbImage, ConvertError> {
  let (width, height) = (frame.width(), frame.height());
  if width == 0 || height == 0 {
    return Err(ConvertError::InvalidDimensions(width, height));
  }
  let expected = Nv21Frame::expected_len(width, height)
    .ok_or(ConvertError::InvalidDimensions(width, height))?;
  let data = frame.as_bytes();
  if data.len() < expected {
    return Err(ConvertError::Truncated {
      expected,
      actual: data.len(),
    });
  }

  let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
  for y in 0..height {
    for x in 0..width {
      let luma = data[(y as usize) * (width as usize) + x as usize] as f32;
      let ci = chroma_index(width, height, x, y);
      let v = data[ci] as f32 - 128.0;
      let u = data[ci + 1] as f32 - 128.0;

      rgb.push(clamp_u8(luma + 1.402 * v));
      rgb.push(clamp_u8(luma - 0.344_136 * u - 0.714_136 * v));
      rgb.push(clamp_u8(luma + 1.772 * u));
    }
  }

  RgbImage::from_raw(width, height, rgb).ok_or(ConvertError::InvalidDimensions(width, height))
}

/// RGB 转 NV21，色度取 2x2 像素块的平均值
pub fn rgb_to_nv21(image: &RgbImage) -> Nv21Frame {
  let (width, height) = image.dimensions();
  let len = Nv21Frame::expected_len(width, height).unwrap_or(0);
  let mut data = vec![0u8; len];

  for (x, y, pixel) in image.enumerate_pixels() {
    let [r, g, b] = pixel.0.map(f32::from);
    data[(y as usize) * (width as usize) + x as usize] = clamp_u8(0.299 * r + 0.587 * g + 0.114 * b);
  }

  for by in (0..height).step_by(2) {
    for bx in (0..width).step_by(2) {
      let (mut sum_u, mut sum_v, mut count) = (0.0f32, 0.0f32, 0.0f32);
      for y in by..(by + 2).min(height) {
        for x in bx..(bx + 2).min(width) {
          let [r, g, b] = image.get_pixel(x, y).0.map(f32::from);
          sum_u += -0.168_736 * r - 0.331_264 * g + 0.5 * b;
          sum_v += 0.5 * r - 0.418_688 * g - 0.081_312 * b;
          count += 1.0;
        }
      }
      let ci = chroma_index(width, height, bx, by);
      data[ci] = clamp_u8(sum_v / count + 128.0);
      data[ci + 1] = clamp_u8(sum_u / count + 128.0);
    }
  }

  Nv21Frame::new(data, width, height)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ConvertError> {
  let mut buffer = Vec::new();
  let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
  encoder
    .write_image(
      image.as_raw(),
      image.width(),
      image.height(),
      ExtendedColorType::Rgb8,
    )
    .map_err(ConvertError::Encode)?;
  Ok(buffer)
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<DecodedImage, ConvertError> {
  let image =
    image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).map_err(ConvertError::Decode)?;
  Ok(DecodedImage::from(image.to_rgb8()))
}

/// 相机帧到检测输入的完整转换：NV21 -> JPEG -> 位图
pub fn nv21_to_decoded(frame: &Nv21Frame, quality: u8) -> Result<DecodedImage, ConvertError> {
  let rgb = nv21_to_rgb(frame)?;
  let jpeg = encode_jpeg(&rgb, quality)?;
  debug!(
    "NV21 {}x{} 重编码为 JPEG, 大小 {:.1} KB",
    frame.width(),
    frame.height(),
    jpeg.len() as f64 / 1024.0
  );
  decode_jpeg(&jpeg)
}
