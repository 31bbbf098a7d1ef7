use thiserror::Error;
use websocket_wire::WsError;

/// 广播服务器的错误类型。
///
/// 协议层错误原样包装为 `WebSocketService`；配置与控制台错误只在启动和读取标准输入时出现。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket 服务错误: {0}")]
    WebSocketService(#[from] WsError),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("控制台输入错误: {0}")]
    Console(#[from] std::io::Error),
}
