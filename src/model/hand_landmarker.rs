// 该文件是 Shoushi （手势） 项目的一部分。
// src/model/hand_landmarker.rs - RKNN 手部关键点检测（手掌检测 + 关键点回归）
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{f32::consts::PI, path::Path};

use image::RgbImage;
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  frame::{AsNhwcFrame, DecodedImage, Letterbox, RgbNhwcFrame, RotatedRect},
  model::{
    HAND_LANDMARK_COUNT, Hand, HandLandmarker, HandLandmarkerOptions, HandLandmarkerResult,
    Handedness, NormalizedLandmark,
  },
};

const PALM_MODEL_FILE: &str = "palm_detection.rknn";
const LANDMARK_MODEL_FILE: &str = "hand_landmark.rknn";

const PALM_INPUT: u32 = 192;
const PALM_NUM_OUTPUTS: u32 = 2;
const PALM_ANCHOR_STRIDES: [u32; 4] = [8, 16, 16, 16];
const PALM_NUM_ANCHORS: usize = 2016;
const PALM_REGRESSOR_SIZE: usize = 18;
const PALM_NUM_KEYPOINTS: usize = 7;
const PALM_SCORE_CLIP: f32 = 100.0;
const PALM_NMS_IOU: f32 = 0.3;
const PALM_WRIST_KEYPOINT: usize = 0;
const PALM_MIDDLE_MCP_KEYPOINT: usize = 2;

const LANDMARK_INPUT: u32 = 224;
const LANDMARK_NUM_OUTPUTS: u32 = 4;
const LANDMARK_PRESENCE_THRESH: f32 = 0.5;

// 手掌框到手部 ROI 的变换
const ROI_SCALE: f32 = 2.6;
const ROI_SHIFT_Y: f32 = -0.5;

#[derive(Error, Debug)]
pub enum RknnHandLandmarkerError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("第 {index} 个输出大小不匹配: 期望 {expected}, 实际 {actual}")]
  OutputMismatch {
    index: usize,
    expected: usize,
    actual: usize,
  },
}

impl From<std::io::Error> for RknnHandLandmarkerError {
  fn from(err: std::io::Error) -> Self {
    RknnHandLandmarkerError::ModelLoadError(err)
  }
}

impl From<rknpu::Error> for RknnHandLandmarkerError {
  fn from(err: rknpu::Error) -> Self {
    RknnHandLandmarkerError::RknnError(err)
  }
}

impl RknnHandLandmarkerError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnHandLandmarkerError::ModelInvalid(msg.to_string(), e)
  }
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
  cx: f32,
  cy: f32,
}

#[derive(Debug, Clone)]
struct PalmDetection {
  score: f32,
  // 原图归一化坐标 [x_min, y_min, x_max, y_max]
  bbox: [f32; 4],
  keypoints: [(f32, f32); PALM_NUM_KEYPOINTS],
}

pub struct RknnHandLandmarker {
  palm: Context,
  landmark: Context,
  anchors: Box<[Anchor]>,
  options: HandLandmarkerOptions,
}

pub struct RknnHandLandmarkerBuilder {
  options: HandLandmarkerOptions,
}

impl From<HandLandmarkerOptions> for RknnHandLandmarkerBuilder {
  fn from(options: HandLandmarkerOptions) -> Self {
    Self { options }
  }
}

fn load_context(
  path: &Path,
  num_inputs_expected: u32,
  num_outputs_expected: u32,
) -> Result<Context, RknnHandLandmarkerError> {
  info!("加载模型文件: {}", path.display());
  let model_data = std::fs::read(path)?;
  debug!(
    "模型文件大小: {:.2} MB",
    model_data.len() as f64 / (1024.0 * 1024.0)
  );

  let context = Context::new(&model_data, InitFlags::default())?;

  let num_inputs = context
    .num_inputs()
    .map_err(|e| RknnHandLandmarkerError::invalid("无法获取输入数量", e))?;
  let num_outputs = context
    .num_outputs()
    .map_err(|e| RknnHandLandmarkerError::invalid("无法获取输出数量", e))?;

  if num_inputs != num_inputs_expected || num_outputs != num_outputs_expected {
    let msg = format!(
      "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
      num_inputs_expected, num_outputs_expected, num_inputs, num_outputs
    );
    error!("{}: {}", path.display(), msg);
    return Err(RknnHandLandmarkerError::invalid(
      &msg,
      rknpu::Error::InvalidModel,
    ));
  }

  Ok(context)
}

impl RknnHandLandmarkerBuilder {
  pub fn build(self) -> Result<RknnHandLandmarker, RknnHandLandmarkerError> {
    let options = self.options;

    info!("创建手掌检测上下文");
    let palm = load_context(
      &options.model_asset_path.join(PALM_MODEL_FILE),
      1,
      PALM_NUM_OUTPUTS,
    )?;
    info!("创建手部关键点上下文");
    let landmark = load_context(
      &options.model_asset_path.join(LANDMARK_MODEL_FILE),
      1,
      LANDMARK_NUM_OUTPUTS,
    )?;

    let anchors = generate_anchors();
    debug!("生成锚框 {} 个", anchors.len());
    info!(
      "模型加载完成, 最多 {} 只手, 置信度阈值 {}",
      options.num_hands, options.min_hand_detection_confidence
    );

    Ok(RknnHandLandmarker {
      palm,
      landmark,
      anchors: anchors.into_boxed_slice(),
      options,
    })
  }
}

impl RknnHandLandmarker {
  pub fn new(options: HandLandmarkerOptions) -> Result<Self, RknnHandLandmarkerError> {
    RknnHandLandmarkerBuilder::from(options).build()
  }

  fn detect_palms(&self, image: &RgbImage) -> Result<Vec<PalmDetection>, RknnHandLandmarkerError> {
    let (input, letterbox) = RgbNhwcFrame::<PALM_INPUT, PALM_INPUT>::letterbox(image);

    debug!("设置手掌检测输入");
    self
      .palm
      .set_input(0, input.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)?;
    self.palm.run()?;
    let output = self.palm.get_outputs()?;

    let tensor1 = output.get_f32(0)?;
    let tensor2 = output.get_f32(1)?;
    // RKNN 输出顺序可能变化，根据张量大小区分回归与分类
    let reg_expected = PALM_NUM_ANCHORS * PALM_REGRESSOR_SIZE;
    let (reg, cls) = if tensor1.len() == reg_expected && tensor2.len() == PALM_NUM_ANCHORS {
      (tensor1, tensor2)
    } else if tensor2.len() == reg_expected && tensor1.len() == PALM_NUM_ANCHORS {
      (tensor2, tensor1)
    } else {
      return Err(RknnHandLandmarkerError::OutputMismatch {
        index: 0,
        expected: reg_expected,
        actual: tensor1.len(),
      });
    };

    let detections = decode_palms(
      reg,
      cls,
      &self.anchors,
      &letterbox,
      self.options.min_hand_detection_confidence,
    );
    debug!("手掌候选 {} 个", detections.len());
    Ok(non_max_suppression(detections, self.options.num_hands))
  }

  fn detect_landmarks(
    &self,
    image: &RgbImage,
    roi: &RotatedRect,
  ) -> Result<Option<Hand>, RknnHandLandmarkerError> {
    let input = RgbNhwcFrame::<LANDMARK_INPUT, LANDMARK_INPUT>::from_rotated_crop(image, roi);
    self
      .landmark
      .set_input(0, input.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)?;
    self.landmark.run()?;
    let output = self.landmark.get_outputs()?;

    let landmarks = output.get_f32(0)?;
    let presence = output.get_f32(1)?;
    let handedness = output.get_f32(2)?;
    for (index, tensor, expected) in [
      (0, landmarks, HAND_LANDMARK_COUNT * 3),
      (1, presence, 1),
      (2, handedness, 1),
    ] {
      if tensor.len() != expected {
        return Err(RknnHandLandmarkerError::OutputMismatch {
          index,
          expected,
          actual: tensor.len(),
        });
      }
    }

    // 导出模型的存在性与左右手输出均为 logit
    let score = sigmoid(presence[0]);
    if score < LANDMARK_PRESENCE_THRESH {
      debug!("手部存在性 {:.3} 低于阈值, 丢弃", score);
      return Ok(None);
    }

    Ok(Some(Hand {
      landmarks: project_landmarks(landmarks, roi, image.width() as f32, image.height() as f32),
      score,
      handedness: classify_handedness(handedness[0]),
    }))
  }
}

impl HandLandmarker for RknnHandLandmarker {
  type Error = RknnHandLandmarkerError;

  fn detect(&self, image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error> {
    let image = image.as_rgb();
    let palms = self.detect_palms(image)?;

    let mut hands = Vec::with_capacity(palms.len());
    for palm in &palms {
      let roi = palm_to_roi(palm, image.width() as f32, image.height() as f32);
      debug!("手部 ROI: {:?}", roi);
      if let Some(hand) = self.detect_landmarks(image, &roi)? {
        hands.push(hand);
      }
    }

    debug!("检测到 {} 只手", hands.len());
    Ok(HandLandmarkerResult {
      hands: hands.into_boxed_slice(),
    })
  }
}

/// 固定尺寸 SSD 锚框，相同步长的层合并到同一特征图
fn generate_anchors() -> Vec<Anchor> {
  let mut anchors = Vec::with_capacity(PALM_NUM_ANCHORS);
  let mut layer = 0;
  while layer < PALM_ANCHOR_STRIDES.len() {
    let stride = PALM_ANCHOR_STRIDES[layer];
    let mut same = 0;
    while layer + same < PALM_ANCHOR_STRIDES.len() && PALM_ANCHOR_STRIDES[layer + same] == stride {
      same += 1;
    }
    // 每层一个 1:1 锚框加一个插值尺度锚框
    let per_cell = same * 2;
    let map = PALM_INPUT.div_ceil(stride);
    for y in 0..map {
      for x in 0..map {
        for _ in 0..per_cell {
          anchors.push(Anchor {
            cx: (x as f32 + 0.5) / map as f32,
            cy: (y as f32 + 0.5) / map as f32,
          });
        }
      }
    }
    layer += same;
  }
  anchors
}

fn decode_palms(
  reg: &[f32],
  cls: &[f32],
  anchors: &[Anchor],
  letterbox: &Letterbox,
  min_score: f32,
) -> Vec<PalmDetection> {
  let scale = PALM_INPUT as f32;
  let to_image = |u: f32, v: f32| letterbox.to_image(u, v, scale, scale);

  anchors
    .iter()
    .enumerate()
    .filter_map(|(i, anchor)| {
      let score = sigmoid(cls[i].clamp(-PALM_SCORE_CLIP, PALM_SCORE_CLIP));
      if score < min_score {
        return None;
      }
      let r = &reg[i * PALM_REGRESSOR_SIZE..(i + 1) * PALM_REGRESSOR_SIZE];
      let cx = r[0] / scale + anchor.cx;
      let cy = r[1] / scale + anchor.cy;
      let (w, h) = (r[2] / scale, r[3] / scale);
      let (x_min, y_min) = to_image(cx - w / 2.0, cy - h / 2.0);
      let (x_max, y_max) = to_image(cx + w / 2.0, cy + h / 2.0);

      let mut keypoints = [(0.0, 0.0); PALM_NUM_KEYPOINTS];
      for (k, keypoint) in keypoints.iter_mut().enumerate() {
        *keypoint = to_image(
          r[4 + 2 * k] / scale + anchor.cx,
          r[5 + 2 * k] / scale + anchor.cy,
        );
      }

      Some(PalmDetection {
        score,
        bbox: [x_min, y_min, x_max, y_max],
        keypoints,
      })
    })
    .collect()
}

/// 关键点模型输出 (像素 x, 像素 y, 相对深度) 映射回原图归一化坐标
fn project_landmarks(
  raw: &[f32],
  roi: &RotatedRect,
  width: f32,
  height: f32,
) -> Box<[NormalizedLandmark]> {
  let input = LANDMARK_INPUT as f32;
  raw
    .chunks_exact(3)
    .map(|p| {
      let (px, py) = roi.to_image(p[0] / input, p[1] / input);
      NormalizedLandmark {
        x: px / width,
        y: py / height,
        z: p[2] / input * roi.side / width,
      }
    })
    .collect()
}

fn classify_handedness(logit: f32) -> Handedness {
  if sigmoid(logit) > 0.5 {
    Handedness::Right
  } else {
    Handedness::Left
  }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = w * h;
  let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

fn non_max_suppression(mut detections: Vec<PalmDetection>, limit: usize) -> Vec<PalmDetection> {
  detections.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut kept: Vec<PalmDetection> = Vec::with_capacity(limit);
  for detection in detections {
    if kept.len() >= limit {
      break;
    }
    if kept.iter().all(|k| iou(&k.bbox, &detection.bbox) <= PALM_NMS_IOU) {
      kept.push(detection);
    }
  }
  kept
}

/// 手掌框旋转对齐到手腕-中指方向，上移并放大为正方形 ROI
fn palm_to_roi(palm: &PalmDetection, width: f32, height: f32) -> RotatedRect {
  let (x0, y0) = palm.keypoints[PALM_WRIST_KEYPOINT];
  let (x1, y1) = palm.keypoints[PALM_MIDDLE_MCP_KEYPOINT];
  let angle = PI / 2.0 - (-(y1 - y0) * height).atan2((x1 - x0) * width);
  let rotation = angle - 2.0 * PI * ((angle + PI) / (2.0 * PI)).floor();

  let box_w = (palm.bbox[2] - palm.bbox[0]) * width;
  let box_h = (palm.bbox[3] - palm.bbox[1]) * height;
  let (sin, cos) = rotation.sin_cos();
  let center_x = (palm.bbox[0] + palm.bbox[2]) / 2.0 * width - box_h * ROI_SHIFT_Y * sin;
  let center_y = (palm.bbox[1] + palm.bbox[3]) / 2.0 * height + box_h * ROI_SHIFT_Y * cos;

  RotatedRect {
    center_x,
    center_y,
    side: box_w.max(box_h) * ROI_SCALE,
    rotation,
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn anchor_count_matches_palm_model() {
    let anchors = generate_anchors();
    assert_eq!(anchors.len(), PALM_NUM_ANCHORS);
    assert!((anchors[0].cx - 0.5 / 24.0).abs() < 1e-6);
    assert!((anchors[1152].cx - 0.5 / 12.0).abs() < 1e-6);
  }

  #[test]
  fn nms_keeps_best_disjoint_palms() {
    let palm = |score: f32, x: f32| PalmDetection {
      score,
      bbox: [x, 0.1, x + 0.2, 0.3],
      keypoints: [(0.0, 0.0); PALM_NUM_KEYPOINTS],
    };
    let kept = non_max_suppression(
      vec![palm(0.6, 0.0), palm(0.9, 0.01), palm(0.8, 0.5), palm(0.7, 0.7)],
      2,
    );
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].score, 0.8);
  }

  fn palm_tensors(logits: &[f32]) -> (Vec<f32>, Vec<f32>, Vec<Anchor>) {
    let mut reg = vec![0.0; logits.len() * PALM_REGRESSOR_SIZE];
    // 第一个锚框：48 像素见方的框，手腕关键点在中心下方 24 像素
    reg[2] = 48.0;
    reg[3] = 48.0;
    reg[5] = 24.0;
    let anchors = vec![Anchor { cx: 0.5, cy: 0.5 }; logits.len()];
    (reg, logits.to_vec(), anchors)
  }

  fn letterbox_384x192() -> Letterbox {
    let (_, letterbox) = RgbNhwcFrame::<PALM_INPUT, PALM_INPUT>::letterbox(&RgbImage::new(384, 192));
    letterbox
  }

  #[test]
  fn palm_score_threshold_is_inclusive_at_half() {
    let letterbox = letterbox_384x192();
    let (reg, cls, anchors) = palm_tensors(&[0.01, -0.01]);
    let palms = decode_palms(
      &reg,
      &cls,
      &anchors,
      &letterbox,
      crate::model::DEFAULT_MIN_HAND_DETECTION_CONFIDENCE,
    );
    assert_eq!(palms.len(), 1);
    assert!(palms[0].score > 0.5);

    let (reg, cls, anchors) = palm_tensors(&[0.0]);
    assert_eq!(decode_palms(&reg, &cls, &anchors, &letterbox, 0.5).len(), 1);
    assert!(decode_palms(&reg, &cls, &anchors, &letterbox, 0.6).is_empty());
  }

  #[test]
  fn palm_box_is_unmapped_through_letterbox() {
    let letterbox = letterbox_384x192();
    assert_eq!(letterbox.pad_x, 0.0);
    assert_eq!(letterbox.pad_y, 48.0);

    let (reg, cls, anchors) = palm_tensors(&[4.0]);
    let palm = &decode_palms(&reg, &cls, &anchors, &letterbox, 0.5)[0];
    // 模型输入上 72..120 像素的框，纵向去掉 48 像素填充后除以 96
    let expected = [0.375, 0.25, 0.625, 0.75];
    for (got, want) in palm.bbox.iter().zip(expected) {
      assert!((got - want).abs() < 1e-5, "{got} != {want}");
    }
    let (wx, wy) = palm.keypoints[PALM_WRIST_KEYPOINT];
    assert!((wx - 0.5).abs() < 1e-5);
    assert!((wy - 0.75).abs() < 1e-5);
    let (mx, my) = palm.keypoints[PALM_MIDDLE_MCP_KEYPOINT];
    assert!((mx - 0.5).abs() < 1e-5);
    assert!((my - 0.5).abs() < 1e-5);
  }

  #[test]
  fn landmarks_project_from_roi_to_image() {
    let upright = RotatedRect {
      center_x: 50.0,
      center_y: 25.0,
      side: 40.0,
      rotation: 0.0,
    };
    let raw = [112.0, 112.0, 0.0, 0.0, 0.0, 22.4];
    let points = project_landmarks(&raw, &upright, 100.0, 50.0);
    assert_eq!(points.len(), 2);
    assert!((points[0].x - 0.5).abs() < 1e-5);
    assert!((points[0].y - 0.5).abs() < 1e-5);
    assert!((points[1].x - 0.3).abs() < 1e-5);
    assert!((points[1].y - 0.1).abs() < 1e-5);
    assert!((points[1].z - 0.04).abs() < 1e-5);

    let turned = RotatedRect {
      rotation: std::f32::consts::FRAC_PI_2,
      ..upright
    };
    // 区域右侧中点旋转后落在中心正下方
    let points = project_landmarks(&[224.0, 112.0, 0.0], &turned, 100.0, 50.0);
    assert!((points[0].x - 0.5).abs() < 1e-5);
    assert!((points[0].y - 0.9).abs() < 1e-5);
  }

  #[test]
  fn handedness_is_read_as_logit() {
    assert_eq!(classify_handedness(2.0), Handedness::Right);
    assert_eq!(classify_handedness(0.3), Handedness::Right);
    assert_eq!(classify_handedness(-0.3), Handedness::Left);
    assert_eq!(classify_handedness(0.0), Handedness::Left);
  }

  #[test]
  fn upright_palm_roi_is_shifted_up() {
    let mut keypoints = [(0.5, 0.5); PALM_NUM_KEYPOINTS];
    keypoints[PALM_WRIST_KEYPOINT] = (0.5, 0.6);
    keypoints[PALM_MIDDLE_MCP_KEYPOINT] = (0.5, 0.4);
    let palm = PalmDetection {
      score: 0.9,
      bbox: [0.4, 0.4, 0.6, 0.6],
      keypoints,
    };
    let roi = palm_to_roi(&palm, 100.0, 100.0);
    assert!(roi.rotation.abs() < 1e-5);
    assert!((roi.center_x - 50.0).abs() < 1e-3);
    assert!((roi.center_y - 40.0).abs() < 1e-3);
    assert!((roi.side - 52.0).abs() < 1e-3);
  }
}
