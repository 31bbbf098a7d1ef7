// websocket_wire/src/error.rs

//! 定义 WebSocket 线协议库的错误类型。
//!
//! 错误按来源分为四类，每一类在连接边界上有固定的处理方式：
//! - 握手错误：以 HTTP 拒绝响应结束升级，见 [`WsError::http_status`]。
//! - 协议错误：以关闭码 1002（或 1009）关闭连接，见 [`WsError::close_code`]。
//! - 使用错误：同步返回给调用方。
//! - 传输错误：映射为 1006 异常关闭事件。

use thiserror::Error;

use crate::message::close_code;

/// WebSocket 线协议库的统一错误类型。
#[derive(Error, Debug)]
pub enum WsError {
    /// 升级请求缺少必需的请求头。
    #[error("缺少必需的请求头: {0}")]
    MissingHeader(&'static str),

    /// `Sec-WebSocket-Key` 不是 16 字节数据的 base64 编码。
    #[error("无效的 Sec-WebSocket-Key")]
    InvalidKey,

    /// 客户端请求的协议版本不是 13。
    #[error("不支持的 WebSocket 版本: {0}")]
    UnsupportedVersion(String),

    /// 请求不是 WebSocket 升级请求。
    #[error("不是 WebSocket 升级请求")]
    NotUpgrade,

    /// 请求头超过允许的最大长度。
    #[error("握手请求头过大 (上限 {max} 字节)")]
    RequestTooLarge { max: usize },

    /// HTTP 请求格式错误，或握手完成前连接已断开。
    #[error("无效的 HTTP 请求: {0}")]
    InvalidRequest(String),

    /// 帧头中的操作码不在 TEXT/BINARY/CLOSE/PING/PONG 之列。
    #[error("无效的操作码: 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("保留位被置位，但未协商任何扩展")]
    ReservedBitsSet,

    #[error("控制帧不允许分片")]
    FragmentedControlFrame,

    #[error("控制帧载荷过大: {0} 字节 (上限 125)")]
    ControlFrameTooLarge(u64),

    /// 声明的载荷长度超过支持的上限。长度从不被截断。
    #[error("载荷过大: {size} 字节 (上限 {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// CLOSE 帧载荷只有 1 字节，或关闭原因不是合法的 UTF-8。
    #[error("无效的 CLOSE 帧载荷")]
    InvalidClosePayload,

    /// 连接在一帧尚未接收完整时被对端关闭。
    #[error("帧未接收完整时连接已关闭 (缓冲区剩余 {0} 字节)")]
    TruncatedFrame(usize),

    /// 客户端发往服务端的帧必须加掩码。
    #[error("客户端帧未加掩码")]
    UnmaskedClientFrame,

    /// 调用方传入了不支持的参数，例如用控制帧操作码发送数据。
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 在已关闭的连接上发送或关闭。
    #[error("连接已关闭")]
    ConnectionClosed,

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),
}

impl WsError {
    /// 该错误导致连接关闭时使用的关闭码。
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::PayloadTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
            WsError::InvalidOpcode(_)
            | WsError::ReservedBitsSet
            | WsError::FragmentedControlFrame
            | WsError::ControlFrameTooLarge(_)
            | WsError::InvalidClosePayload
            | WsError::TruncatedFrame(_)
            | WsError::UnmaskedClientFrame => close_code::PROTOCOL_ERROR,
            _ => close_code::ABNORMAL,
        }
    }

    /// 握手阶段的错误对应的 HTTP 状态码。
    pub fn http_status(&self) -> u16 {
        match self {
            WsError::UnsupportedVersion(_) => 426,
            WsError::RequestTooLarge { .. } => 431,
            _ => 400,
        }
    }
}
