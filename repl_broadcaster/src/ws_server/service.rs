// repl_broadcaster/src/ws_server/service.rs

//! WebSocket 服务：启动监听，并为每个连接运行事件循环。

use std::sync::Arc;

use log::{debug, info, warn};
use websocket_wire::{Connection, ConnectionEvent, Opcode, ServerTransport};

use crate::config::WebSocketConfig;
use crate::error::AppError;
use crate::ws_server::connection_manager::ConnectionManager;

/// WebSocket 服务结构体，封装了配置和连接管理器。
pub struct WsService {
    config: WebSocketConfig,
    connection_manager: Arc<ConnectionManager>,
}

impl WsService {
    pub fn new(config: WebSocketConfig, connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connection_manager,
        }
    }

    /// 启动 WebSocket 服务端。绑定成功后不会返回。
    pub async fn start(&self) -> Result<(), AppError> {
        let addr = self.config.listen_addr()?;
        info!(
            "[WsService] 正在启动 WebSocket 服务: host={}, port={}, max_payload_size={}",
            self.config.host, self.config.port, self.config.max_payload_size
        );

        let conn_manager_for_cb = Arc::clone(&self.connection_manager);
        ServerTransport::start_with_options(addr, self.config.transport_options(), move |connection| {
            let manager = Arc::clone(&conn_manager_for_cb);
            async move { handle_connection(manager, connection).await }
        })
        .await?;
        Ok(())
    }
}

/// 单个连接的生命周期：登记、处理事件直到关闭、注销。
///
/// 收到的文本消息会记录日志并转发给其他所有客户端；二进制消息只记录大小。
pub async fn handle_connection(manager: Arc<ConnectionManager>, mut connection: Connection) {
    let session = match manager.add_client(&connection) {
        Ok(session) => session,
        Err(e) => {
            warn!("[WsService] 无法登记来自 {} 的连接: {}", connection.peer_addr(), e);
            return;
        }
    };
    let client_id = session.client_id;

    while let Some(event) = connection.next_event().await {
        match event {
            ConnectionEvent::Data {
                opcode: Opcode::Text,
                payload,
            } => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                info!("[{}] 收到文本消息: {}", client_id, text);
                let forwarded = manager.broadcast(text, Some(client_id));
                debug!("[{}] 消息已转发给 {} 个客户端", client_id, forwarded);
            }
            ConnectionEvent::Data { opcode, payload } => {
                info!("[{}] 收到 {:?} 消息，长度 {} 字节", client_id, opcode, payload.len());
            }
            ConnectionEvent::Close { code, reason } => {
                info!(
                    "[{}] 连接关闭: code={}, reason={}",
                    client_id,
                    code,
                    reason.as_deref().unwrap_or("")
                );
                break;
            }
        }
    }

    manager.remove_client(&client_id);
}
