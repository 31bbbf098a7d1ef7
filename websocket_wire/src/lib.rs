//! `websocket_wire` 实现 WebSocket 协议 (RFC 6455) 的服务端线协议部分：
//! 在原始 TCP 连接上完成 HTTP 升级握手、解析带掩码的入站帧，并把出站消息编码为帧。
//!
//! 主要模块包括：
//! - `frame`: 无状态的帧编解码（`try_decode_frame` / `encode_frame`）。
//! - `handshake`: 升级请求解析与 `Sec-WebSocket-Accept` 计算。
//! - `message`: 连接事件 `ConnectionEvent`、出站载荷 `SendPayload` 与关闭码。
//! - `error`: 库中使用的错误类型 `WsError`。
//! - `server`: 监听器 `ServerTransport` 与连接对象 `Connection`。
//!
//! 不在本库范围内：分片重组、心跳定时、压缩扩展、子协议协商、客户端编帧与 TLS。

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod server;

pub use error::WsError;
pub use frame::{Frame, Opcode};
pub use message::{ConnectionEvent, SendPayload};
pub use server::{Connection, ConnectionSender, ConnectionState, ServerTransport, TransportOptions};
