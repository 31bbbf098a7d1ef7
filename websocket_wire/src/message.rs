// websocket_wire/src/message.rs

//! 定义连接与上层应用之间交换的消息结构。
//!
//! - `ConnectionEvent`：连接向上层发出的事件（`Data` 与 `Close`）。
//! - `SendPayload`：上层通过 `send` 交给连接的出站消息。
//! - `close_code`：RFC 6455 第 7.4 节中本库用到的关闭码。

use crate::frame::Opcode;

/// RFC 6455 关闭码。
pub mod close_code {
    /// 正常关闭。
    pub const NORMAL: u16 = 1000;
    /// 端点离开（例如所有连接句柄都已被丢弃）。
    pub const GOING_AWAY: u16 = 1001;
    /// 协议错误。
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 对端的 CLOSE 帧未携带状态码。不会出现在线上。
    pub const NO_STATUS: u16 = 1005;
    /// 传输层在没有 CLOSE 帧交换的情况下断开。不会出现在线上。
    pub const ABNORMAL: u16 = 1006;
    /// 消息过大。
    pub const MESSAGE_TOO_BIG: u16 = 1009;

    /// 该关闭码能否写入 CLOSE 帧的载荷。
    pub fn is_sendable(code: u16) -> bool {
        !matches!(code, NO_STATUS | ABNORMAL | 1015)
    }
}

/// 连接向上层应用发出的事件。
///
/// 对同一连接，`Data` 事件严格按帧到达线上的顺序发出；
/// `Close` 事件恰好发出一次，并且总是最后一个事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 收到一个完整的 TEXT 或 BINARY 帧，载荷已去掩码。
    Data { opcode: Opcode, payload: Vec<u8> },
    /// 连接已关闭。`code` 为 1006 表示传输层在没有关闭握手的情况下断开。
    Close { code: u16, reason: Option<String> },
}

impl ConnectionEvent {
    /// 若为 UTF-8 合法的 TEXT 数据事件，返回其文本内容。
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConnectionEvent::Data {
                opcode: Opcode::Text,
                payload,
            } => std::str::from_utf8(payload).ok(),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ConnectionEvent::Close { .. })
    }
}

/// 通过 `send` 发出的消息载荷：文本按 UTF-8 编码为 TEXT 帧，二进制数据原样作为 BINARY 帧。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl SendPayload {
    /// 该载荷对应的帧操作码。
    pub fn opcode(&self) -> Opcode {
        match self {
            SendPayload::Text(_) => Opcode::Text,
            SendPayload::Binary(_) => Opcode::Binary,
        }
    }

    /// 载荷在线上的字节表示。
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            SendPayload::Text(text) => text.into_bytes(),
            SendPayload::Binary(data) => data,
        }
    }
}

impl From<String> for SendPayload {
    fn from(text: String) -> Self {
        SendPayload::Text(text)
    }
}

impl From<&str> for SendPayload {
    fn from(text: &str) -> Self {
        SendPayload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for SendPayload {
    fn from(data: Vec<u8>) -> Self {
        SendPayload::Binary(data)
    }
}

impl From<&[u8]> for SendPayload {
    fn from(data: &[u8]) -> Self {
        SendPayload::Binary(data.to_vec())
    }
}
