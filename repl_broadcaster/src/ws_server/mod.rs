// repl_broadcaster/src/ws_server/mod.rs

//! WebSocket 服务端逻辑模块。

pub mod client_session;
pub mod connection_manager;
pub mod repl;
pub mod service;
