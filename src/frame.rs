// 该文件是 Shoushi （手势） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::{Rgb, RgbImage, imageops};

const RGB_CHANNELS: usize = 3;

/// 相机送来的 NV21 原始帧：Y 平面之后紧跟交错的 VU 平面
#[derive(Debug, Clone)]
pub struct Nv21Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
}

impl Nv21Frame {
  /// 不做长度校验，校验在转换阶段进行
  pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
    Self {
      data: data.into_boxed_slice(),
      width,
      height,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 给定尺寸下完整 NV21 帧应有的字节数，溢出时返回 `None`
  pub fn expected_len(width: u32, height: u32) -> Option<usize> {
    let luma = (width as usize).checked_mul(height as usize)?;
    let chroma = (width as usize)
      .div_ceil(2)
      .checked_mul((height as usize).div_ceil(2))?
      .checked_mul(2)?;
    luma.checked_add(chroma)
  }

  pub fn is_complete(&self) -> bool {
    Self::expected_len(self.width, self.height)
      .map(|len| self.data.len() >= len)
      .unwrap_or(false)
  }
}

/// JPEG 重编码后解码得到的位图，只在一次检测调用中存在
#[derive(Debug, Clone)]
pub struct DecodedImage {
  image: RgbImage,
}

impl From<RgbImage> for DecodedImage {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl DecodedImage {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn as_rgb(&self) -> &RgbImage {
    &self.image
  }
}

pub trait AsNhwcFrame<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> &[u8];
}

/// 保持宽高比缩放后的填充信息，坐标均以模型输入像素为单位
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub pad_x: f32,
  pub pad_y: f32,
  pub content_w: f32,
  pub content_h: f32,
}

impl Letterbox {
  /// 将模型输入上的归一化坐标映射回原图归一化坐标
  pub fn to_image(&self, u: f32, v: f32, model_w: f32, model_h: f32) -> (f32, f32) {
    (
      (u * model_w - self.pad_x) / self.content_w,
      (v * model_h - self.pad_y) / self.content_h,
    )
  }
}

/// 原图上的旋转正方形区域，中心与边长以像素为单位，旋转为弧度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
  pub center_x: f32,
  pub center_y: f32,
  pub side: f32,
  pub rotation: f32,
}

impl RotatedRect {
  /// 区域内归一化坐标 (u, v) 对应的原图像素坐标
  pub fn to_image(&self, u: f32, v: f32) -> (f32, f32) {
    let (sin, cos) = self.rotation.sin_cos();
    let dx = (u - 0.5) * self.side;
    let dy = (v - 0.5) * self.side;
    (
      self.center_x + dx * cos - dy * sin,
      self.center_y + dx * sin + dy * cos,
    )
  }
}

#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> From<Vec<u8>> for RgbNhwcFrame<W, H> {
  fn from(data: Vec<u8>) -> Self {
    if data.len() != (RGB_CHANNELS * W as usize * H as usize) {
      panic!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        RGB_CHANNELS * W as usize * H as usize,
        data.len()
      );
    }

    Self {
      data: data.into_boxed_slice(),
    }
  }
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    let size = RGB_CHANNELS * (W as usize) * (H as usize);
    let data = vec![0u8; size].into_boxed_slice();
    Self { data }
  }
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  /// 保持宽高比缩放到 W x H，空白处填充黑色
  pub fn letterbox(image: &RgbImage) -> (Self, Letterbox) {
    let (src_w, src_h) = image.dimensions();
    let scale = (W as f32 / src_w as f32).min(H as f32 / src_h as f32);
    let content_w = ((src_w as f32 * scale).round() as u32).clamp(1, W);
    let content_h = ((src_h as f32 * scale).round() as u32).clamp(1, H);
    let resized = imageops::resize(image, content_w, content_h, imageops::FilterType::Triangle);

    let pad_x = (W - content_w) / 2;
    let pad_y = (H - content_h) / 2;
    let mut canvas = RgbImage::new(W, H);
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let letterbox = Letterbox {
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
      content_w: content_w as f32,
      content_h: content_h as f32,
    };
    (Self::from(canvas.into_raw()), letterbox)
  }

  /// 从原图中采样旋转正方形区域，区域超出原图的部分为黑色
  pub fn from_rotated_crop(image: &RgbImage, rect: &RotatedRect) -> Self {
    let mut frame = Self::default();
    let (src_w, src_h) = image.dimensions();
    let slice = frame.as_mut();

    for h in 0..H {
      for w in 0..W {
        let u = (w as f32 + 0.5) / W as f32;
        let v = (h as f32 + 0.5) / H as f32;
        let (x, y) = rect.to_image(u, v);
        if x < 0.0 || y < 0.0 || x >= src_w as f32 || y >= src_h as f32 {
          continue;
        }
        let Rgb(pixel) = *image.get_pixel(x as u32, y as u32);
        let index = (h as usize * W as usize + w as usize) * RGB_CHANNELS;
        slice[index..index + RGB_CHANNELS].copy_from_slice(&pixel);
      }
    }
    frame
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNhwcFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expected_len_rounds_chroma_up() {
    assert_eq!(Nv21Frame::expected_len(4, 2), Some(8 + 4));
    assert_eq!(Nv21Frame::expected_len(3, 3), Some(9 + 8));
    assert_eq!(Nv21Frame::expected_len(0, 10), Some(0));
  }

  #[test]
  fn short_buffer_is_incomplete() {
    let frame = Nv21Frame::new(vec![0; 11], 4, 2);
    assert!(!frame.is_complete());
    let frame = Nv21Frame::new(vec![0; 12], 4, 2);
    assert!(frame.is_complete());
  }

  #[test]
  fn letterbox_maps_corners_back() {
    let image = RgbImage::from_pixel(200, 100, Rgb([10, 20, 30]));
    let (frame, letterbox) = RgbNhwcFrame::<64, 64>::letterbox(&image);
    assert_eq!(frame.as_nhwc().len(), 64 * 64 * 3);
    assert_eq!(letterbox.pad_x, 0.0);
    assert_eq!(letterbox.pad_y, 16.0);

    let (x, y) = letterbox.to_image(0.0, 16.0 / 64.0, 64.0, 64.0);
    assert!(x.abs() < 1e-6);
    assert!(y.abs() < 1e-6);
    let (x, y) = letterbox.to_image(1.0, 48.0 / 64.0, 64.0, 64.0);
    assert!((x - 1.0).abs() < 1e-6);
    assert!((y - 1.0).abs() < 1e-6);
  }

  #[test]
  fn rotated_crop_outside_image_is_black() {
    let image = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
    let rect = RotatedRect {
      center_x: 100.0,
      center_y: 100.0,
      side: 4.0,
      rotation: 0.0,
    };
    let frame = RgbNhwcFrame::<4, 4>::from_rotated_crop(&image, &rect);
    assert!(frame.as_nhwc().iter().all(|&v| v == 0));

    let rect = RotatedRect {
      center_x: 4.0,
      center_y: 4.0,
      side: 4.0,
      rotation: std::f32::consts::FRAC_PI_2,
    };
    let frame = RgbNhwcFrame::<4, 4>::from_rotated_crop(&image, &rect);
    assert!(frame.as_nhwc().iter().all(|&v| v == 255));
  }

  #[test]
  fn rotated_rect_quarter_turn() {
    let rect = RotatedRect {
      center_x: 10.0,
      center_y: 10.0,
      side: 2.0,
      rotation: std::f32::consts::FRAC_PI_2,
    };
    // 区域右侧中点旋转 90 度后落在中心正下方
    let (x, y) = rect.to_image(1.0, 0.5);
    assert!((x - 10.0).abs() < 1e-5);
    assert!((y - 11.0).abs() < 1e-5);
  }
}
