// websocket_wire/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! - `transport`：监听 TCP 地址、接受连接，并把每个升级成功的连接交给上层回调。
//! - `connection`：单个连接的握手、接收缓冲与帧处理循环、事件发送以及 `send`/`close`。
//!
//! 连接之间互不共享可变状态；连接注册表之类的全局状态由上层应用负责。

pub mod connection;
pub mod transport;

pub use connection::{Connection, ConnectionSender, ConnectionState};
pub use transport::{ServerTransport, TransportOptions};
