// 该文件是 Shoushi （手势） 项目的一部分。
// src/bridge.rs - 相机帧到手部关键点的检测桥
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

//! 检测桥只有一个后台工作线程，请求按到达顺序逐个执行。
//! 检测引擎在工作线程上构造并归其独占，构造失败时引擎缺失，
//! 之后的每次检测都立即返回 [`BridgeError::NotInitialized`]。

use std::{
  fmt::Display,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver, Sender},
  },
  thread::{self, JoinHandle},
  time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  convert::{self, JPEG_QUALITY},
  frame::Nv21Frame,
  model::{HandLandmarker, LandmarkSet},
};

pub const DEFAULT_QUEUE_HIGH_WATER: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
  #[error("图像数据或尺寸缺失")]
  InvalidArgs,
  #[error("关键点检测器未初始化")]
  NotInitialized,
  #[error("无法从 NV21 数据解码图像: {0}")]
  DecodeError(String),
  #[error("{0}")]
  DetectionError(String),
  #[error("检测工作线程已退出")]
  WorkerGone,
}

impl BridgeError {
  /// 返回给调用方的错误码
  pub fn code(&self) -> &'static str {
    match self {
      BridgeError::InvalidArgs => "INVALID_ARGS",
      BridgeError::NotInitialized => "NOT_INITIALIZED",
      BridgeError::DecodeError(_) => "DECODE_ERROR",
      BridgeError::DetectionError(_) | BridgeError::WorkerGone => "DETECTION_ERROR",
    }
  }
}

/// 构造检测引擎，失败时记录日志并返回 `None`，错误推迟到首次检测时暴露
pub fn setup_engine<E, Err, F>(build: F) -> Option<E>
where
  F: FnOnce() -> Result<E, Err>,
  Err: Display,
{
  let now = Instant::now();
  match build() {
    Ok(engine) => {
      info!("检测引擎初始化完成，耗时: {:.2?}", now.elapsed());
      Some(engine)
    }
    Err(e) => {
      error!("检测引擎初始化失败: {}", e);
      None
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
  pub jpeg_quality: u8,
  pub queue_high_water: usize,
}

impl Default for BridgeOptions {
  fn default() -> Self {
    Self {
      jpeg_quality: JPEG_QUALITY,
      queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
    }
  }
}

type DetectReply = Result<LandmarkSet, BridgeError>;

struct DetectRequest {
  frame: Nv21Frame,
  reply: Sender<DetectReply>,
}

/// 已入队的检测请求
#[derive(Debug)]
pub struct PendingDetection {
  receiver: Receiver<DetectReply>,
}

impl PendingDetection {
  /// 阻塞等待检测完成
  pub fn wait(self) -> DetectReply {
    self.receiver.recv().unwrap_or(Err(BridgeError::WorkerGone))
  }
}

pub struct FrameDetectorBridge {
  sender: Option<Sender<DetectRequest>>,
  worker: Option<JoinHandle<()>>,
  engine_ready: bool,
  pending: Arc<AtomicUsize>,
  options: BridgeOptions,
}

impl FrameDetectorBridge {
  pub fn spawn<E, F>(factory: F) -> std::io::Result<Self>
  where
    E: HandLandmarker + 'static,
    F: FnOnce() -> Option<E> + Send + 'static,
  {
    Self::spawn_with_options(factory, BridgeOptions::default())
  }

  /// 启动工作线程并在其上构造引擎，等待构造结束后返回
  pub fn spawn_with_options<E, F>(factory: F, options: BridgeOptions) -> std::io::Result<Self>
  where
    E: HandLandmarker + 'static,
    F: FnOnce() -> Option<E> + Send + 'static,
  {
    let (tx, rx) = mpsc::channel::<DetectRequest>();
    let (ready_tx, ready_rx) = mpsc::channel::<bool>();
    let pending = Arc::new(AtomicUsize::new(0));
    let worker_pending = pending.clone();
    let quality = options.jpeg_quality;

    let worker = thread::Builder::new()
      .name("shoushi-detect".to_string())
      .spawn(move || {
        let engine = factory();
        let _ = ready_tx.send(engine.is_some());
        run_worker(engine, rx, worker_pending, quality);
      })?;

    let engine_ready = ready_rx.recv().unwrap_or_else(|_| {
      error!("检测引擎构造过程中工作线程异常退出");
      false
    });
    if !engine_ready {
      warn!("检测引擎不可用，所有检测请求将返回 NOT_INITIALIZED");
    }

    Ok(Self {
      sender: Some(tx),
      worker: Some(worker),
      engine_ready,
      pending,
      options,
    })
  }

  pub fn is_engine_ready(&self) -> bool {
    self.engine_ready
  }

  /// 已提交但尚未完成的请求数
  pub fn queue_depth(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  /// 校验参数并入队，参数或引擎不可用时同步返回错误
  pub fn submit(&self, bytes: Vec<u8>, width: i32, height: i32) -> Result<PendingDetection, BridgeError> {
    if bytes.is_empty() || width <= 0 || height <= 0 {
      debug!("拒绝检测请求: {} 字节, {}x{}", bytes.len(), width, height);
      return Err(BridgeError::InvalidArgs);
    }
    if !self.engine_ready {
      return Err(BridgeError::NotInitialized);
    }

    let sender = self.sender.as_ref().ok_or(BridgeError::WorkerGone)?;
    let (reply, receiver) = mpsc::channel();
    let frame = Nv21Frame::new(bytes, width as u32, height as u32);

    let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
    if sender.send(DetectRequest { frame, reply }).is_err() {
      self.pending.fetch_sub(1, Ordering::SeqCst);
      return Err(BridgeError::WorkerGone);
    }
    if depth > self.options.queue_high_water {
      warn!("检测队列积压 {} 个请求", depth);
    }

    Ok(PendingDetection { receiver })
  }

  pub fn detect(&self, bytes: Vec<u8>, width: i32, height: i32) -> Result<LandmarkSet, BridgeError> {
    self.submit(bytes, width, height)?.wait()
  }

  pub fn detect_frame(&self, frame: &Nv21Frame) -> Result<LandmarkSet, BridgeError> {
    let (width, height) = (frame.width(), frame.height());
    let width = i32::try_from(width).map_err(|_| BridgeError::InvalidArgs)?;
    let height = i32::try_from(height).map_err(|_| BridgeError::InvalidArgs)?;
    self.detect(frame.as_bytes().to_vec(), width, height)
  }
}

impl Drop for FrameDetectorBridge {
  fn drop(&mut self) {
    // 关闭队列后工作线程处理完剩余请求再退出
    drop(self.sender.take());
    if let Some(worker) = self.worker.take()
      && worker.join().is_err()
    {
      error!("检测工作线程异常退出");
    }
  }
}

fn run_worker<E: HandLandmarker>(
  engine: Option<E>,
  requests: Receiver<DetectRequest>,
  pending: Arc<AtomicUsize>,
  quality: u8,
) {
  info!("检测工作线程启动");
  let mut index = 0usize;
  for request in requests {
    index += 1;
    let now = Instant::now();
    let result = run_detection(engine.as_ref(), &request.frame, quality);
    match &result {
      Ok(set) => debug!(
        "({})检测完成，{} 只手，耗时: {:.2?}",
        index,
        set.len(),
        now.elapsed()
      ),
      Err(e) => warn!("({})检测失败 [{}]: {}", index, e.code(), e),
    }
    pending.fetch_sub(1, Ordering::SeqCst);
    if request.reply.send(result).is_err() {
      debug!("({})调用方已放弃等待结果", index);
    }
  }
  info!("检测队列关闭，工作线程退出");
}

fn run_detection<E: HandLandmarker>(
  engine: Option<&E>,
  frame: &Nv21Frame,
  quality: u8,
) -> Result<LandmarkSet, BridgeError> {
  let engine = engine.ok_or(BridgeError::NotInitialized)?;

  let image = convert::nv21_to_decoded(frame, quality)
    .map_err(|e| BridgeError::DecodeError(e.to_string()))?;

  let result = catch_unwind(AssertUnwindSafe(|| engine.detect(&image)))
    .map_err(|panic| BridgeError::DetectionError(panic_message(panic.as_ref())))?
    .map_err(|e| BridgeError::DetectionError(e.to_string()))?;

  Ok(LandmarkSet::from(&result))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(msg) = panic.downcast_ref::<&str>() {
    msg.to_string()
  } else if let Some(msg) = panic.downcast_ref::<String>() {
    msg.clone()
  } else {
    "检测引擎内部错误".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::DecodedImage,
    model::{Hand, HandLandmarkerResult, Handedness, NormalizedLandmark},
  };

  #[derive(Debug, Error)]
  #[error("模型推理失败")]
  struct FailingError;

  struct Fixed(usize);

  impl HandLandmarker for Fixed {
    type Error = FailingError;

    fn detect(&self, _image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error> {
      let hand = Hand {
        landmarks: (0..21)
          .map(|i| NormalizedLandmark {
            x: i as f32 / 32.0,
            y: 0.5,
            z: -0.1,
          })
          .collect(),
        score: 0.95,
        handedness: Handedness::Left,
      };
      Ok(HandLandmarkerResult {
        hands: vec![hand; self.0].into_boxed_slice(),
      })
    }
  }

  struct Failing;

  impl HandLandmarker for Failing {
    type Error = FailingError;

    fn detect(&self, _image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error> {
      Err(FailingError)
    }
  }

  struct Panicking;

  impl HandLandmarker for Panicking {
    type Error = FailingError;

    fn detect(&self, _image: &DecodedImage) -> Result<HandLandmarkerResult, Self::Error> {
      panic!("张量越界")
    }
  }

  fn gray(width: u32, height: u32) -> Vec<u8> {
    vec![128; Nv21Frame::expected_len(width, height).unwrap()]
  }

  #[test]
  fn setup_engine_swallows_failure() {
    let engine: Option<Fixed> = setup_engine(|| Err::<Fixed, _>("模型文件不存在"));
    assert!(engine.is_none());
    let engine = setup_engine(|| Ok::<_, String>(Fixed(0)));
    assert!(engine.is_some());
  }

  #[test]
  fn error_codes() {
    assert_eq!(BridgeError::InvalidArgs.code(), "INVALID_ARGS");
    assert_eq!(BridgeError::NotInitialized.code(), "NOT_INITIALIZED");
    assert_eq!(BridgeError::DecodeError(String::new()).code(), "DECODE_ERROR");
    assert_eq!(BridgeError::DetectionError(String::new()).code(), "DETECTION_ERROR");
  }

  #[test]
  fn detects_one_hand() {
    let bridge = FrameDetectorBridge::spawn(|| Some(Fixed(1))).unwrap();
    assert!(bridge.is_engine_ready());
    let set = bridge.detect(gray(16, 16), 16, 16).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.hands()[0].len(), 42);
    assert_eq!(set.hands()[0][2], 1.0 / 32.0);
    assert_eq!(set.hands()[0][3], 0.5);
  }

  #[test]
  fn absent_engine_is_not_initialized() {
    let bridge = FrameDetectorBridge::spawn(|| None::<Fixed>).unwrap();
    assert!(!bridge.is_engine_ready());
    assert_eq!(bridge.detect(gray(8, 8), 8, 8), Err(BridgeError::NotInitialized));
  }

  #[test]
  fn invalid_args_win_over_missing_engine() {
    let bridge = FrameDetectorBridge::spawn(|| None::<Fixed>).unwrap();
    assert_eq!(bridge.detect(Vec::new(), 8, 8), Err(BridgeError::InvalidArgs));
    assert_eq!(bridge.detect(gray(8, 8), 0, 8), Err(BridgeError::InvalidArgs));
    assert_eq!(bridge.detect(gray(8, 8), 8, -1), Err(BridgeError::InvalidArgs));
  }

  #[test]
  fn short_buffer_is_decode_error() {
    let bridge = FrameDetectorBridge::spawn(|| Some(Fixed(1))).unwrap();
    assert!(matches!(
      bridge.detect(vec![1, 2, 3], 640, 480),
      Err(BridgeError::DecodeError(_))
    ));
  }

  #[test]
  fn engine_error_message_passes_through() {
    let bridge = FrameDetectorBridge::spawn(|| Some(Failing)).unwrap();
    assert_eq!(
      bridge.detect(gray(8, 8), 8, 8),
      Err(BridgeError::DetectionError("模型推理失败".to_string()))
    );
  }

  #[test]
  fn engine_panic_is_detection_error_and_worker_survives() {
    let bridge = FrameDetectorBridge::spawn(|| Some(Panicking)).unwrap();
    assert_eq!(
      bridge.detect(gray(8, 8), 8, 8),
      Err(BridgeError::DetectionError("张量越界".to_string()))
    );
    assert!(matches!(
      bridge.detect(gray(8, 8), 8, 8),
      Err(BridgeError::DetectionError(_))
    ));
  }

  #[test]
  fn queue_drains_to_zero() {
    let bridge = FrameDetectorBridge::spawn(|| Some(Fixed(0))).unwrap();
    let pending: Vec<_> = (0..4)
      .map(|_| bridge.submit(gray(8, 8), 8, 8).unwrap())
      .collect();
    for p in pending {
      assert!(p.wait().unwrap().is_empty());
    }
    assert_eq!(bridge.queue_depth(), 0);
  }
}
