use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use uuid::Uuid;
use websocket_wire::{ConnectionSender, SendPayload, WsError};

/// 代表一个已连接到服务器的 WebSocket 客户端的会话。
///
/// 每个成功升级的连接在注册表中对应一个 `ClientSession`。
/// 会话只持有连接的发送句柄；连接本身（事件接收端）由处理该连接的任务持有。
#[derive(Debug)]
pub struct ClientSession {
    /// 由服务端生成的全局唯一客户端标识符 (UUID 版本 4)，同时写入连接的 `id`。
    pub client_id: Uuid,

    /// 客户端的源网络地址，例如 `127.0.0.1:54321`。
    pub addr: SocketAddr,

    /// 会话创建时间 (UTC)。
    pub creation_time: DateTime<Utc>,

    /// 连接的发送句柄。
    pub sender: ConnectionSender,
}

impl ClientSession {
    pub fn new(client_id: Uuid, sender: ConnectionSender) -> Self {
        Self {
            client_id,
            addr: sender.peer_addr(),
            creation_time: Utc::now(),
            sender,
        }
    }

    /// 向该客户端发送一条消息。
    pub fn send(&self, payload: impl Into<SendPayload>) -> Result<(), WsError> {
        self.sender.send(payload)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
