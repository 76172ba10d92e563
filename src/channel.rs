// 该文件是 Shoushi （手势） 项目的一部分。
// src/channel.rs - 方法调用通道
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

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::{BridgeError, FrameDetectorBridge, PendingDetection};

pub const DETECT_HANDS: &str = "detectHands";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  pub method: String,
  #[serde(default)]
  pub arguments: Value,
}

impl MethodCall {
  pub fn new(method: &str, arguments: Value) -> Self {
    Self {
      id: None,
      method: method.to_string(),
      arguments,
    }
  }

  /// 参数缺失或类型不符时返回 `None`
  pub fn argument<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .arguments
      .get(key)
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodResponse {
  Success {
    result: Value,
  },
  Error {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<Value>,
  },
  NotImplemented,
}

impl MethodResponse {
  pub fn error(code: &str, message: impl Into<String>) -> Self {
    MethodResponse::Error {
      code: code.to_string(),
      message: message.into(),
      details: None,
    }
  }
}

impl From<BridgeError> for MethodResponse {
  fn from(err: BridgeError) -> Self {
    MethodResponse::error(err.code(), err.to_string())
  }
}

impl From<Result<crate::model::LandmarkSet, BridgeError>> for MethodResponse {
  fn from(result: Result<crate::model::LandmarkSet, BridgeError>) -> Self {
    match result.and_then(|set| {
      serde_json::to_value(set).map_err(|e| BridgeError::DetectionError(e.to_string()))
    }) {
      Ok(result) => MethodResponse::Success { result },
      Err(e) => MethodResponse::from(e),
    }
  }
}

/// 带请求编号的应答，按行编码
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  #[serde(flatten)]
  pub response: MethodResponse,
}

/// 已受理的调用，检测类调用需要等待工作线程
pub enum PendingResponse {
  Ready(MethodResponse),
  Detecting(PendingDetection),
}

impl PendingResponse {
  pub fn wait(self) -> MethodResponse {
    match self {
      PendingResponse::Ready(response) => response,
      PendingResponse::Detecting(pending) => MethodResponse::from(pending.wait()),
    }
  }
}

pub struct HandLandmarkerChannel {
  bridge: FrameDetectorBridge,
}

impl HandLandmarkerChannel {
  pub fn new(bridge: FrameDetectorBridge) -> Self {
    Self { bridge }
  }

  pub fn bridge(&self) -> &FrameDetectorBridge {
    &self.bridge
  }

  /// 受理调用但不等待结果，每个调用恰好对应一个应答
  pub fn dispatch(&self, call: &MethodCall) -> PendingResponse {
    if call.method != DETECT_HANDS {
      debug!("未实现的方法: {}", call.method);
      return PendingResponse::Ready(MethodResponse::NotImplemented);
    }

    let image: Option<Vec<u8>> = call.argument("image");
    // 缺失或超出范围的尺寸按 0 处理
    let width: i32 = call.argument("width").unwrap_or(0);
    let height: i32 = call.argument("height").unwrap_or(0);

    match self
      .bridge
      .submit(image.unwrap_or_default(), width, height)
    {
      Ok(pending) => PendingResponse::Detecting(pending),
      Err(e) => PendingResponse::Ready(MethodResponse::from(e)),
    }
  }

  pub fn handle(&self, call: &MethodCall) -> MethodResponse {
    self.dispatch(call).wait()
  }

  /// 解码一行 JSON 调用；无法解析的行以 INVALID_ARGS 应答
  pub fn dispatch_line(&self, line: &str) -> (Option<u64>, PendingResponse) {
    match serde_json::from_str::<MethodCall>(line) {
      Ok(call) => (call.id, self.dispatch(&call)),
      Err(e) => {
        warn!("无法解析方法调用: {}", e);
        (
          None,
          PendingResponse::Ready(MethodResponse::error(
            BridgeError::InvalidArgs.code(),
            format!("无法解析方法调用: {}", e),
          )),
        )
      }
    }
  }
}

pub fn encode_reply(id: Option<u64>, response: MethodResponse) -> String {
  let reply = Reply { id, response };
  serde_json::to_string(&reply).unwrap_or_else(|e| {
    format!(
      r#"{{"status":"error","code":"DETECTION_ERROR","message":"应答编码失败: {}"}}"#,
      e
    )
  })
}
