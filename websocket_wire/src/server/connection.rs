// websocket_wire/src/server/connection.rs

//! 单个已升级 WebSocket 会话的连接对象。
//!
//! 每个连接由一个后台驱动任务（`ConnectionDriver`）独占套接字和接收缓冲区：
//! - 套接字可读时，把字节追加到缓冲区，然后反复调用帧解码，直到解码器报告"尚不完整"；
//! - 每个 TEXT/BINARY 帧转换为一个 `ConnectionEvent::Data` 事件，按线上顺序发给上层；
//! - PING 立即以 PONG 回应，CLOSE 会被回显后关闭套接字；
//! - 上层经 `ConnectionSender` 发出的命令由同一任务编码并写入套接字。
//!
//! 因为只有驱动任务接触套接字与缓冲区，连接内部状态无需加锁。
//! 关闭事件由驱动任务在退出前发出，且恰好一次。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Buf, BytesMut};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::WsError;
use crate::frame::{self, Opcode};
use crate::handshake::{self, HttpRequest};
use crate::message::{ConnectionEvent, SendPayload, close_code};
use crate::server::transport::TransportOptions;

/// 每次读取前为缓冲区预留的空间。
const READ_CHUNK: usize = 4096;

/// 连接的生命周期状态。
///
/// 握手在 [`Connection::accept`] 返回之前就已完成，因此通过 `Connection` 或
/// `ConnectionSender` 观察到的状态只会是 `Open` 或 `Closed`。
/// `Handshaking` 只出现在 `accept` 内部的日志中。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// 正在进行 HTTP 升级握手（仅在 `accept` 内部）。
    Handshaking = 0,
    Open = 1,
    /// 终态：不再接受发送，也不会再产生事件。
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// 句柄与驱动任务共享的连接状态。
#[derive(Debug)]
struct Shared {
    peer_addr: SocketAddr,
    /// 由上层分配的不透明标识，本库从不生成。
    id: OnceLock<String>,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// 置为 Closed，返回此前是否处于 Open。
    fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst)
            == ConnectionState::Open as u8
    }
}

/// 句柄发给驱动任务的命令。
#[derive(Debug)]
enum Command {
    Frame { opcode: Opcode, payload: Vec<u8> },
    Close { code: u16, reason: Option<String> },
}

/// 可克隆的连接发送句柄，供连接注册表等外部协作者寻址连接。
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionSender {
    /// 发送一条文本或二进制消息。
    ///
    /// # Errors
    /// 连接已关闭时返回 `WsError::ConnectionClosed`；消息不会被静默丢弃。
    pub fn send(&self, payload: impl Into<SendPayload>) -> Result<(), WsError> {
        let payload = payload.into();
        self.send_frame(payload.opcode(), payload.into_bytes())
    }

    /// 以指定操作码发送一帧数据。
    ///
    /// # Errors
    /// * `WsError::InvalidArgument`：操作码不是 TEXT 或 BINARY，或载荷超过支持的上限。
    /// * `WsError::ConnectionClosed`：连接已关闭。
    pub fn send_frame(&self, opcode: Opcode, payload: Vec<u8>) -> Result<(), WsError> {
        if opcode.is_control() {
            return Err(WsError::InvalidArgument(format!(
                "send 只接受 TEXT 或 BINARY 操作码，收到 {opcode:?}"
            )));
        }
        if payload.len() as u64 > frame::MAX_PAYLOAD_LEN {
            return Err(WsError::InvalidArgument(format!(
                "载荷长度 {} 超过上限 {}",
                payload.len(),
                frame::MAX_PAYLOAD_LEN
            )));
        }
        if self.is_closed() {
            return Err(WsError::ConnectionClosed);
        }
        self.commands
            .send(Command::Frame { opcode, payload })
            .map_err(|_| WsError::ConnectionClosed)
    }

    /// 本地发起关闭：发送 CLOSE 帧，关闭套接字，并发出关闭事件。
    ///
    /// # Errors
    /// 连接已关闭（无论由哪一方发起）时返回 `WsError::ConnectionClosed`。
    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<(), WsError> {
        if !self.shared.mark_closed() {
            return Err(WsError::ConnectionClosed);
        }
        // 驱动任务已退出时关闭事件已经发出，无需再做什么
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.map(str::to_owned),
        });
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state() == ConnectionState::Closed
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// 上层分配的标识；尚未分配时为 `None`。
    pub fn id(&self) -> Option<&str> {
        self.shared.id.get().map(String::as_str)
    }
}

/// 一个已接受并完成升级的 WebSocket 连接。
///
/// 事件通过 [`Connection::next_event`] 读取；发送与关闭既可以直接在连接上调用，
/// 也可以通过 [`Connection::sender`] 得到的句柄调用。
/// 所有句柄都被丢弃后，连接会以 1001 关闭。
#[derive(Debug)]
pub struct Connection {
    sender: ConnectionSender,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    /// 在刚接受的套接字上执行服务端握手，成功后启动驱动任务并返回连接。
    ///
    /// 握手失败时，会先向客户端写出 HTTP 拒绝响应并关闭套接字，再返回错误。
    pub async fn accept(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        options: &TransportOptions,
    ) -> Result<Self, WsError> {
        debug!("[Connection {}] 状态: {:?}", peer_addr, ConnectionState::Handshaking);
        let mut buffer = BytesMut::with_capacity(1024);

        // 读取并校验升级请求；失败时回复 HTTP 拒绝响应
        let accept_key = match read_upgrade_request(&mut stream, &mut buffer, options).await {
            Ok((head_len, request)) => match handshake::accept(&request) {
                Ok(key) => {
                    // 请求头之后的字节属于第一帧，保留在缓冲区中
                    buffer.advance(head_len);
                    key
                }
                Err(e) => return Err(reject(&mut stream, peer_addr, e).await),
            },
            // 连接在握手中途断开时没有对端可回复
            Err(e @ WsError::IoError(_)) => return Err(e),
            Err(e) => return Err(reject(&mut stream, peer_addr, e).await),
        };

        stream
            .write_all(&handshake::switching_protocols_response(&accept_key))
            .await?;
        debug!(
            "[Connection {}] 握手完成，状态: {:?}，缓冲区中已有 {} 字节帧数据",
            peer_addr,
            ConnectionState::Open,
            buffer.len()
        );

        Ok(Self::spawn(stream, peer_addr, buffer, options.max_payload_size))
    }

    fn spawn(stream: TcpStream, peer_addr: SocketAddr, buffer: BytesMut, max_payload_size: u64) -> Self {
        let shared = Arc::new(Shared {
            peer_addr,
            id: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Open as u8),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = ConnectionDriver {
            stream,
            buffer,
            shared: Arc::clone(&shared),
            commands: command_rx,
            events: Some(event_tx),
            max_payload_size,
        };
        tokio::spawn(driver.run());

        Self {
            sender: ConnectionSender {
                shared,
                commands: command_tx,
            },
            events: event_rx,
        }
    }

    /// 等待下一个事件。`Close` 事件之后返回 `None`。
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// 分配上层使用的不透明标识。只能分配一次。
    pub fn set_id(&self, id: impl Into<String>) -> Result<(), WsError> {
        self.sender
            .shared
            .id
            .set(id.into())
            .map_err(|id| WsError::InvalidArgument(format!("连接标识已分配，拒绝重新设置为 {id}")))
    }

    pub fn id(&self) -> Option<&str> {
        self.sender.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.sender.peer_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.sender.state()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// 见 [`ConnectionSender::send`]。
    pub fn send(&self, payload: impl Into<SendPayload>) -> Result<(), WsError> {
        self.sender.send(payload)
    }

    /// 见 [`ConnectionSender::send_frame`]。
    pub fn send_frame(&self, opcode: Opcode, payload: Vec<u8>) -> Result<(), WsError> {
        self.sender.send_frame(opcode, payload)
    }

    /// 见 [`ConnectionSender::close`]。
    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<(), WsError> {
        self.sender.close(code, reason)
    }

    /// 获取一个可克隆的发送句柄。
    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }
}

/// 读取完整的 HTTP 请求头并解析。返回请求头长度与解析结果。
async fn read_upgrade_request(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    options: &TransportOptions,
) -> Result<(usize, HttpRequest), WsError> {
    loop {
        // 先检查已读到的数据中是否已有完整请求头
        if let Some(head_len) = handshake::find_head_end(buffer) {
            if head_len > options.max_handshake_size {
                return Err(WsError::RequestTooLarge {
                    max: options.max_handshake_size,
                });
            }
            let request = HttpRequest::parse(&buffer[..head_len])?;
            return Ok((head_len, request));
        }
        // 尚未读到请求头结尾，但已超过上限
        if buffer.len() >= options.max_handshake_size {
            return Err(WsError::RequestTooLarge {
                max: options.max_handshake_size,
            });
        }
        buffer.reserve(READ_CHUNK);
        if stream.read_buf(buffer).await? == 0 {
            return Err(WsError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "握手完成前连接已关闭",
            )));
        }
    }
}

/// 写出拒绝响应并关闭套接字，返回原错误。
async fn reject(stream: &mut TcpStream, peer_addr: SocketAddr, err: WsError) -> WsError {
    warn!("[Connection {}] 拒绝升级请求 (HTTP {}): {}", peer_addr, err.http_status(), err);
    if let Err(e) = stream.write_all(&handshake::reject_response(&err)).await {
        debug!("[Connection {}] 写出拒绝响应失败: {}", peer_addr, e);
    }
    let _ = stream.shutdown().await;
    err
}

/// 驱动循环一次等待的结果。
enum Step {
    Read(std::io::Result<usize>),
    Command(Option<Command>),
}

/// 独占套接字与接收缓冲区的后台任务。
struct ConnectionDriver {
    stream: TcpStream,
    buffer: BytesMut,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// 发出关闭事件时取走，保证关闭事件最多一次且为最后一个事件。
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    max_payload_size: u64,
}

impl ConnectionDriver {
    async fn run(mut self) {
        let peer_addr = self.shared.peer_addr;

        // 客户端可能在握手请求之后紧接着发送了帧
        if !self.buffer.is_empty() && !self.process_buffer().await {
            return;
        }

        loop {
            // 保证每次读取至少有一块空闲空间
            self.buffer.reserve(READ_CHUNK);
            // 同时等待套接字可读与上层命令，哪个先到处理哪个
            let step = tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => Step::Read(read),
                command = self.commands.recv() => Step::Command(command),
            };

            match step {
                Step::Read(Ok(0)) if !self.buffer.is_empty() => {
                    // 缓冲区中还有半帧：帧被 EOF 截断，属于协议错误
                    let e = WsError::TruncatedFrame(self.buffer.len());
                    warn!("[Connection {}] 协议错误: {}", peer_addr, e);
                    self.finish(e.close_code(), Some(e.to_string()));
                    break;
                }
                Step::Read(Ok(0)) => {
                    info!("[Connection {}] 对端在关闭握手前断开了连接", peer_addr);
                    self.finish(close_code::ABNORMAL, None);
                    break;
                }
                Step::Read(Ok(n)) => {
                    // 新数据到达后，解码出缓冲区中所有完整的帧
                    trace!("[Connection {}] 读取 {} 字节，缓冲区共 {} 字节", peer_addr, n, self.buffer.len());
                    if !self.process_buffer().await {
                        break;
                    }
                }
                Step::Read(Err(e)) => {
                    warn!("[Connection {}] 读取套接字失败: {}", peer_addr, e);
                    self.finish(close_code::ABNORMAL, Some(e.to_string()));
                    break;
                }
                Step::Command(Some(Command::Frame { opcode, payload })) => {
                    // 出站消息在驱动任务内编码并写出，与入站处理串行
                    if let Err(e) = self.write_frame(opcode, &payload).await {
                        warn!("[Connection {}] 写入套接字失败: {}", peer_addr, e);
                        self.finish(close_code::ABNORMAL, Some(e.to_string()));
                        break;
                    }
                }
                Step::Command(Some(Command::Close { code, reason })) => {
                    info!("[Connection {}] 本地发起关闭 (code={})", peer_addr, code);
                    self.close_with(code, reason).await;
                    break;
                }
                Step::Command(None) => {
                    // 所有句柄都已丢弃
                    debug!("[Connection {}] 已无连接句柄，关闭连接", peer_addr);
                    self.close_with(close_code::GOING_AWAY, None).await;
                    break;
                }
            }
        }
    }

    /// 从缓冲区中解码所有完整帧并逐一处理。返回 `false` 表示连接已关闭。
    async fn process_buffer(&mut self) -> bool {
        let peer_addr = self.shared.peer_addr;
        loop {
            let (frame, consumed) =
                match frame::try_decode_frame_with_limit(&self.buffer, self.max_payload_size) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => return true,
                    Err(e) => {
                        warn!("[Connection {}] 协议错误: {}", peer_addr, e);
                        self.close_with(e.close_code(), Some(e.to_string())).await;
                        return false;
                    }
                };
            // 只跳过本帧占用的字节，后续帧留在缓冲区继续解码
            self.buffer.advance(consumed);

            // 客户端帧必须加掩码
            if !frame.masked {
                let e = WsError::UnmaskedClientFrame;
                warn!("[Connection {}] 协议错误: {}", peer_addr, e);
                self.close_with(e.close_code(), Some(e.to_string())).await;
                return false;
            }

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    trace!(
                        "[Connection {}] 收到 {:?} 帧，{} 字节",
                        peer_addr,
                        frame.opcode,
                        frame.payload.len()
                    );
                    self.emit(ConnectionEvent::Data {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    });
                }
                Opcode::Ping => {
                    debug!("[Connection {}] 收到 PING，回复 PONG", peer_addr);
                    if let Err(e) = self.write_frame(Opcode::Pong, &frame.payload).await {
                        warn!("[Connection {}] 回复 PONG 失败: {}", peer_addr, e);
                        self.finish(close_code::ABNORMAL, Some(e.to_string()));
                        return false;
                    }
                }
                Opcode::Pong => {
                    debug!("[Connection {}] 收到 PONG，忽略", peer_addr);
                }
                Opcode::Close => {
                    let (code, reason) = match frame::parse_close_payload(&frame.payload) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!("[Connection {}] 协议错误: {}", peer_addr, e);
                            self.close_with(e.close_code(), Some(e.to_string())).await;
                            return false;
                        }
                    };
                    info!(
                        "[Connection {}] 收到 CLOSE 帧 (code={}, reason={:?})",
                        peer_addr, code, reason
                    );
                    // 先置为 Closed，拒绝后续发送，再回显 CLOSE 帧
                    self.shared.mark_closed();
                    self.close_with(code, reason).await;
                    return false;
                }
            }
        }
    }

    async fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        let bytes = frame::encode_frame(opcode, payload)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// 发送 CLOSE 帧并关闭套接字，然后发出关闭事件。写入失败不影响关闭流程。
    async fn close_with(&mut self, code: u16, reason: Option<String>) {
        let peer_addr = self.shared.peer_addr;
        match frame::encode_close_frame(code, reason.as_deref()) {
            Ok(bytes) => {
                if let Err(e) = self.stream.write_all(&bytes).await {
                    debug!("[Connection {}] 写出 CLOSE 帧失败: {}", peer_addr, e);
                }
            }
            Err(e) => debug!("[Connection {}] 编码 CLOSE 帧失败: {}", peer_addr, e),
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("[Connection {}] 关闭套接字失败: {}", peer_addr, e);
        }
        self.finish(code, reason);
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            // 上层丢弃了事件接收端时静默忽略
            let _ = events.send(event);
        }
    }

    /// 进入 Closed 并发出唯一的关闭事件。
    fn finish(&mut self, code: u16, reason: Option<String>) {
        self.shared.mark_closed();
        if let Some(events) = self.events.take() {
            info!(
                "[Connection {}] 连接已关闭 (code={}, reason={:?})",
                self.shared.peer_addr, code, reason
            );
            let _ = events.send(ConnectionEvent::Close { code, reason });
        }
    }
}
