// 该文件是 Shoushi （手势） 项目的一部分。
// src/model.rs - 手部关键点模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::DecodedImage, query_value};

/// 每只手的关键点数量
pub const HAND_LANDMARK_COUNT: usize = 21;

pub const DEFAULT_NUM_HANDS: usize = 2;
pub const DEFAULT_MIN_HAND_DETECTION_CONFIDENCE: f32 = 0.5;

/// 手势分类器输入的手数
pub const CLASSIFIER_HANDS: usize = 2;
/// 手势分类器特征长度，两只手各 21 个 (x, y)
pub const RELATIVE_FEATURE_LEN: usize = CLASSIFIER_HANDS * HAND_LANDMARK_COUNT * 2;

/// 手部关键点检测引擎，构造后只读
pub trait HandLandmarker {
  type Error: std::error::Error;

  fn detect(&self, image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLandmark {
  pub x: f32,
  pub y: f32,
  pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handedness {
  Left,
  Right,
}

#[derive(Debug, Clone)]
pub struct Hand {
  pub landmarks: Box<[NormalizedLandmark]>,
  pub score: f32,
  pub handedness: Handedness,
}

#[derive(Debug, Clone, Default)]
pub struct HandLandmarkerResult {
  pub hands: Box<[Hand]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunningMode {
  /// 逐张独立检测，帧间不做跟踪
  #[default]
  Image,
}

#[derive(Error, Debug)]
pub enum OptionsError {
  #[error("模型路径必须使用 {0} 方案")]
  SchemeMismatch(&'static str),
  #[error("参数 {0} 无效: {1}")]
  InvalidValue(&'static str, String),
}

/// 检测引擎配置，对应 `handlm:///模型目录?num_hands=2&min_confidence=0.5`
#[derive(Debug, Clone, PartialEq)]
pub struct HandLandmarkerOptions {
  pub model_asset_path: PathBuf,
  pub running_mode: RunningMode,
  pub num_hands: usize,
  pub min_hand_detection_confidence: f32,
}

impl Default for HandLandmarkerOptions {
  fn default() -> Self {
    Self {
      model_asset_path: PathBuf::from("hand_landmarker"),
      running_mode: RunningMode::Image,
      num_hands: DEFAULT_NUM_HANDS,
      min_hand_detection_confidence: DEFAULT_MIN_HAND_DETECTION_CONFIDENCE,
    }
  }
}

impl FromUrlWithScheme for HandLandmarkerOptions {
  const SCHEME: &'static str = "handlm";
}

impl FromUrl for HandLandmarkerOptions {
  type Error = OptionsError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OptionsError::SchemeMismatch(Self::SCHEME));
    }

    let mut options = HandLandmarkerOptions {
      model_asset_path: PathBuf::from(url.path()),
      ..Default::default()
    };

    if let Some(value) = query_value(url, "num_hands") {
      options.num_hands = match value.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => return Err(OptionsError::InvalidValue("num_hands", value)),
      };
    }

    if let Some(value) = query_value(url, "min_confidence") {
      options.min_hand_detection_confidence = match value.parse::<f32>() {
        Ok(c) if (0.0..=1.0).contains(&c) => c,
        _ => return Err(OptionsError::InvalidValue("min_confidence", value)),
      };
    }

    if let Some(value) = query_value(url, "running_mode") {
      options.running_mode = match value.as_str() {
        "image" => RunningMode::Image,
        _ => return Err(OptionsError::InvalidValue("running_mode", value)),
      };
    }

    Ok(options)
  }
}

/// 扁平化的检测结果：外层按手，内层为 [x0, y0, x1, y1, ...]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
  hands: Vec<Vec<f64>>,
}

impl From<&HandLandmarkerResult> for LandmarkSet {
  fn from(result: &HandLandmarkerResult) -> Self {
    let hands = result
      .hands
      .iter()
      .map(|hand| {
        hand
          .landmarks
          .iter()
          .flat_map(|point| [point.x as f64, point.y as f64])
          .collect()
      })
      .collect();
    Self { hands }
  }
}

impl From<Vec<Vec<f64>>> for LandmarkSet {
  fn from(hands: Vec<Vec<f64>>) -> Self {
    Self { hands }
  }
}

impl LandmarkSet {
  pub fn hands(&self) -> &[Vec<f64>] {
    &self.hands
  }

  pub fn len(&self) -> usize {
    self.hands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.hands.is_empty()
  }

  /// 所有关键点的 (x, y)，按手、按关键点顺序
  pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
    self
      .hands
      .iter()
      .flat_map(|hand| hand.chunks_exact(2).map(|p| (p[0], p[1])))
  }

  /// 所有关键点的归一化包围盒 [x_min, y_min, x_max, y_max]
  pub fn bounding_box(&self) -> Option<[f64; 4]> {
    self.points().fold(None, |acc, (x, y)| match acc {
      None => Some([x, y, x, y]),
      Some([x0, y0, x1, y1]) => Some([x0.min(x), y0.min(y), x1.max(x), y1.max(y)]),
    })
  }

  /// 手势分类器的定长特征
  ///
  /// 取手腕 x 坐标最小的两只手，按从左到右排列，坐标减去这两只手的最小 x / y。
  /// 结果固定为 [`RELATIVE_FEATURE_LEN`] 个值，只有一只手时后半部分补零。
  /// 没有手时返回空向量。
  pub fn relative_features(&self) -> Vec<f64> {
    let mut sorted: Vec<&Vec<f64>> = self.hands.iter().filter(|h| h.len() >= 2).collect();
    if sorted.is_empty() {
      return Vec::new();
    }
    sorted.sort_by(|a, b| a[0].total_cmp(&b[0]));
    sorted.truncate(CLASSIFIER_HANDS);

    let points: Vec<&[f64]> = sorted.iter().flat_map(|h| h.chunks_exact(2)).collect();
    let min_x = points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
    let min_y = points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);

    let mut features: Vec<f64> = points
      .iter()
      .flat_map(|p| [p[0] - min_x, p[1] - min_y])
      .collect();
    features.resize(RELATIVE_FEATURE_LEN, 0.0);
    features
  }
}

#[cfg(feature = "model_hand_landmarker")]
mod hand_landmarker;
#[cfg(feature = "model_hand_landmarker")]
pub use self::hand_landmarker::{
  RknnHandLandmarker, RknnHandLandmarkerBuilder, RknnHandLandmarkerError,
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[cfg(feature = "model_hand_landmarker")]
  #[error("RKNN 手部关键点模型错误: {0}")]
  Rknn(#[from] RknnHandLandmarkerError),
  #[error("模型配置错误: {0}")]
  Options(#[from] OptionsError),
  #[error("不支持的模型方案: {0}")]
  Unsupported(String),
}

/// 按 URL 方案选择的检测引擎
pub enum EngineWrapper {
  #[cfg(feature = "model_hand_landmarker")]
  Rknn(RknnHandLandmarker),
}

impl FromUrl for EngineWrapper {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_hand_landmarker")]
    {
      if url.scheme() == HandLandmarkerOptions::SCHEME {
        let options = HandLandmarkerOptions::from_url(url)?;
        return Ok(EngineWrapper::Rknn(RknnHandLandmarker::new(options)?));
      }
    }
    Err(EngineError::Unsupported(url.scheme().to_string()))
  }
}

impl HandLandmarker for EngineWrapper {
  type Error = EngineError;

  fn detect(&self, image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error> {
    #[cfg(not(feature = "model_hand_landmarker"))]
    let _ = image;
    match *self {
      #[cfg(feature = "model_hand_landmarker")]
      EngineWrapper::Rknn(ref engine) => engine.detect(image).map_err(EngineError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hand(points: &[(f32, f32)]) -> Hand {
    Hand {
      landmarks: points
        .iter()
        .map(|&(x, y)| NormalizedLandmark { x, y, z: 0.3 })
        .collect(),
      score: 0.9,
      handedness: Handedness::Right,
    }
  }

  #[test]
  fn flatten_keeps_hand_and_landmark_order() {
    let result = HandLandmarkerResult {
      hands: vec![hand(&[(0.5, 0.25), (0.75, 0.125)]), hand(&[(0.0, 1.0)])].into_boxed_slice(),
    };
    let set = LandmarkSet::from(&result);
    assert_eq!(set.hands(), &[vec![0.5, 0.25, 0.75, 0.125], vec![0.0, 1.0]]);
  }

  #[test]
  fn empty_result_flattens_to_empty_set() {
    let set = LandmarkSet::from(&HandLandmarkerResult::default());
    assert!(set.is_empty());
    assert_eq!(serde_json::to_string(&set).unwrap(), "[]");
    assert_eq!(set.bounding_box(), None);
    assert!(set.relative_features().is_empty());
  }

  #[test]
  fn relative_features_sort_by_wrist() {
    let set = LandmarkSet::from(vec![vec![0.75, 0.5, 0.875, 0.25], vec![0.25, 0.75]]);
    assert_eq!(set.bounding_box(), Some([0.25, 0.25, 0.875, 0.75]));
    let features = set.relative_features();
    assert_eq!(features.len(), RELATIVE_FEATURE_LEN);
    assert_eq!(&features[..6], &[0.0, 0.5, 0.5, 0.25, 0.625, 0.0]);
    assert!(features[6..].iter().all(|&v| v == 0.0));
  }

  fn full_hand(wrist_x: f64, y: f64) -> Vec<f64> {
    (0..HAND_LANDMARK_COUNT)
      .flat_map(|i| [wrist_x + i as f64 / 64.0, y])
      .collect()
  }

  #[test]
  fn one_hand_is_padded_to_classifier_width() {
    let set = LandmarkSet::from(vec![full_hand(0.5, 0.25)]);
    let features = set.relative_features();
    assert_eq!(features.len(), 84);
    assert_eq!(&features[..4], &[0.0, 0.0, 1.0 / 64.0, 0.0]);
    assert_eq!(features[40], 20.0 / 64.0);
    assert!(features[42..].iter().all(|&v| v == 0.0));
  }

  #[test]
  fn extra_hands_keep_two_leftmost() {
    let set = LandmarkSet::from(vec![
      full_hand(0.75, 0.125),
      full_hand(0.25, 0.5),
      full_hand(0.0, 0.75),
    ]);
    let features = set.relative_features();
    assert_eq!(features.len(), RELATIVE_FEATURE_LEN);
    // 最左边两只手的最小坐标为 (0.0, 0.5)
    assert_eq!(&features[..2], &[0.0, 0.25]);
    assert_eq!(&features[42..44], &[0.25, 0.0]);
    assert!(!features.contains(&0.75));
  }

  #[test]
  fn options_from_url() {
    let url = Url::parse("handlm:///opt/models/hand?num_hands=1&min_confidence=0.7").unwrap();
    let options = HandLandmarkerOptions::from_url(&url).unwrap();
    assert_eq!(options.model_asset_path, PathBuf::from("/opt/models/hand"));
    assert_eq!(options.num_hands, 1);
    assert_eq!(options.min_hand_detection_confidence, 0.7);
    assert_eq!(options.running_mode, RunningMode::Image);
  }

  #[test]
  fn options_defaults_and_rejections() {
    let url = Url::parse("handlm:///models").unwrap();
    let options = HandLandmarkerOptions::from_url(&url).unwrap();
    assert_eq!(options.num_hands, 2);
    assert_eq!(options.min_hand_detection_confidence, 0.5);

    for bad in [
      "handlm:///m?num_hands=0",
      "handlm:///m?min_confidence=1.5",
      "handlm:///m?running_mode=stream",
      "handlm:///m?running_mode=video",
      "yolo26:///m",
    ] {
      assert!(HandLandmarkerOptions::from_url(&Url::parse(bad).unwrap()).is_err(), "{bad}");
    }
  }

  #[cfg(not(feature = "model_hand_landmarker"))]
  #[test]
  fn engine_without_backend_is_unsupported() {
    let url = Url::parse("handlm:///models").unwrap();
    assert!(matches!(
      EngineWrapper::from_url(&url),
      Err(EngineError::Unsupported(_))
    ));
  }
}
