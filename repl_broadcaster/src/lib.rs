//! `repl_broadcaster` 控制台广播服务器核心库。
//!
//! 本 Crate 是 `websocket_wire` 的一个轻量使用者：它只通过连接的事件接口
//! (`Data` / `Close`) 和 `send` 方法与协议层交互，不包含任何协议逻辑。
//!
//! 主要模块包括：
//! - `config`: 管理应用的配置信息加载与访问。
//! - `error`: 定义应用特定的错误类型。
//! - `ws_server`: 连接注册表、连接事件处理与控制台广播。

pub mod config;
pub mod error;
pub mod ws_server;
