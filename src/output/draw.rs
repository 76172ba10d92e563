// 该文件是 Shoushi （手势） 项目的一部分。
// src/output/draw.rs - 手部关键点可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_circle_mut, draw_hollow_rect_mut},
  rect::Rect,
};

use crate::model::LandmarkSet;

const POINT_RADIUS: i32 = 5;
const POINT_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_MARGIN: i32 = 10;
const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

pub struct Draw {
  point_radius: i32,
  point_color: [u8; 3],
  box_margin: i32,
  box_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      point_radius: POINT_RADIUS,
      point_color: POINT_COLOR,
      box_margin: BOX_MARGIN,
      box_color: BOX_COLOR,
    }
  }
}

impl Draw {
  /// 在图像上绘制关键点及包围所有关键点的边框
  pub fn draw_landmarks(&self, image: &mut RgbImage, set: &LandmarkSet) {
    let (w, h) = (image.width() as f64, image.height() as f64);

    for (x, y) in set.points() {
      let center = ((x * w) as i32, (y * h) as i32);
      draw_filled_circle_mut(image, center, self.point_radius, Rgb(self.point_color));
    }

    let Some([x_min, y_min, x_max, y_max]) = set.bounding_box() else {
      return;
    };

    // Clamp to image bounds
    let x1 = ((x_min * w) as i32 - self.box_margin).clamp(0, w as i32 - 1);
    let y1 = ((y_min * h) as i32 - self.box_margin).clamp(0, h as i32 - 1);
    let x2 = ((x_max * w) as i32 + self.box_margin).clamp(0, w as i32 - 1);
    let y2 = ((y_max * h) as i32 + self.box_margin).clamp(0, h as i32 - 1);
    if x1 >= x2 || y1 >= y2 {
      return;
    }

    let rect = Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32);
    draw_hollow_rect_mut(image, rect, Rgb(self.box_color));
  }
}
