// websocket_wire/src/server/transport.rs

//! 服务端监听与升级：接受 TCP 连接，完成 WebSocket 握手，并调用上层回调。

use crate::error::WsError;
use crate::frame::MAX_PAYLOAD_LEN;
use crate::server::connection::Connection;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// 连接级别的可调参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// 单帧载荷的最大字节数，超过时以 1009 关闭连接。不得超过 `u32::MAX`。
    pub max_payload_size: u64,
    /// 握手请求头的最大字节数，超过时以 HTTP 431 拒绝。
    pub max_handshake_size: usize,
}

impl TransportOptions {
    /// 默认单帧载荷上限：16 MiB。
    pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;
    /// 默认握手请求头上限：8 KiB。
    pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8 * 1024;
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            max_handshake_size: Self::DEFAULT_MAX_HANDSHAKE_SIZE,
        }
    }
}

/// `ServerTransport` 负责 WebSocket 服务端的监听和连接接受。
pub struct ServerTransport;

impl ServerTransport {
    /// 以默认参数启动 WebSocket 服务器并开始监听指定的地址。
    ///
    /// 对于每一个成功完成升级的连接，都会调用 `on_connect`。
    /// 此函数在监听器绑定成功后无限期运行。
    ///
    /// # Arguments
    /// * `addr`: 服务器监听的 `SocketAddr` (例如 "127.0.0.1:8080")。
    /// * `on_connect`: 新连接建立时调用的异步回调，接收该连接的 `Connection`。
    ///   回调在每个连接各自的 Tokio 任务中执行，因此必须是 `Send + Sync + Clone + 'static`。
    ///
    /// # Returns
    /// * `Err(WsError::IoError)`：TCP 监听器绑定失败。
    pub async fn start<F, Fut>(addr: SocketAddr, on_connect: F) -> Result<(), WsError>
    where
        F: Fn(Connection) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::start_with_options(addr, TransportOptions::default(), on_connect).await
    }

    /// 与 [`ServerTransport::start`] 相同，但使用给定的连接参数。
    pub async fn start_with_options<F, Fut>(
        addr: SocketAddr,
        options: TransportOptions,
        on_connect: F,
    ) -> Result<(), WsError>
    where
        F: Fn(Connection) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        info!("WebSocket 服务器正在监听地址: {}", addr);
        Self::serve(listener, options, on_connect).await
    }

    /// 在已绑定的监听器上接受连接。
    ///
    /// 接受失败与握手失败只会被记录，不会终止监听循环，也不会影响其他连接。
    pub async fn serve<F, Fut>(
        listener: TcpListener,
        options: TransportOptions,
        on_connect: F,
    ) -> Result<(), WsError>
    where
        F: Fn(Connection) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // 配置的载荷上限不能超过编解码支持的最大值
        if options.max_payload_size > MAX_PAYLOAD_LEN {
            return Err(WsError::InvalidArgument(format!(
                "max_payload_size {} 超过上限 {}",
                options.max_payload_size, MAX_PAYLOAD_LEN
            )));
        }

        loop {
            match listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("从 {} 接受了新的 TCP 连接", peer_addr);
                    // 为每个连接克隆回调，移入各自的任务
                    let on_connect_callback = on_connect.clone();

                    // 每个连接一个任务：握手失败只结束该连接
                    tokio::spawn(async move {
                        match Connection::accept(tcp_stream, peer_addr, &options).await {
                            Ok(connection) => {
                                info!("与 {} 的 WebSocket 握手成功", peer_addr);
                                on_connect_callback(connection).await;
                            }
                            Err(e) => {
                                warn!("与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("接受 TCP 连接失败: {}。服务器将继续运行。", e);
                }
            }
        }
    }
}
