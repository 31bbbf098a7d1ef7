// repl_broadcaster/src/ws_server/connection_manager.rs

//! WebSocket 连接注册表：连接建立时插入，关闭时移除。

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use uuid::Uuid;
use websocket_wire::{Connection, SendPayload, WsError};

use crate::ws_server::client_session::ClientSession;

/// 管理所有活动的 WebSocket 客户端会话
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    /// 存储所有活动的 ClientSession，使用 DashMap 实现线程安全
    /// Key: client_id (Uuid) - 由 ConnectionManager 生成的会话ID
    pub clients: Arc<DashMap<Uuid, Arc<ClientSession>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新连接分配 ID 并登记到注册表中。
    ///
    /// # Errors
    /// 连接已被其他协作者分配过 ID 时返回 `WsError::InvalidArgument`。
    pub fn add_client(&self, connection: &Connection) -> Result<Arc<ClientSession>, WsError> {
        let client_id = Uuid::new_v4();
        connection.set_id(client_id.to_string())?;
        let client_session = Arc::new(ClientSession::new(client_id, connection.sender()));

        self.clients.insert(client_id, Arc::clone(&client_session));
        info!("新客户端连接成功: id={}, addr={}", client_session.client_id, client_session.addr);
        debug!("当前活动客户端总数: {}", self.clients.len());

        Ok(client_session)
    }

    pub fn get_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    /// 从管理器中移除一个客户端会话。
    pub fn remove_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        match self.clients.remove(client_id) {
            Some((_id, session)) => {
                info!(
                    "客户端断开连接: id={}, addr={}, 在线时长={}s",
                    session.client_id,
                    session.addr,
                    (chrono::Utc::now() - session.creation_time).num_seconds()
                );
                debug!("移除后当前活动客户端总数: {}", self.clients.len());
                Some(session)
            }
            None => {
                warn!("尝试移除不存在的客户端: id={}", client_id);
                None
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 向所有（可选地排除某一个）客户端广播消息，返回成功投递的客户端数量。
    ///
    /// 已关闭但尚未移除的连接会被跳过。
    pub fn broadcast(&self, payload: impl Into<SendPayload>, except: Option<Uuid>) -> usize {
        let payload = payload.into();
        // 先收集会话再发送，发送期间不持有 DashMap 分片锁
        let targets: Vec<Arc<ClientSession>> = self
            .clients
            .iter()
            .filter(|entry| Some(*entry.key()) != except)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for session in targets {
            match session.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("向客户端 {} 广播失败: {}", session.client_id, e),
            }
        }
        delivered
    }
}
