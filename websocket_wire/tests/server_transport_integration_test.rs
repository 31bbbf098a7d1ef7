// websocket_wire/tests/server_transport_integration_test.rs

use futures_util::{SinkExt, StreamExt};
use log::{error, info, LevelFilter};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as TungsteniteMessage};
use websocket_wire::frame::{apply_mask, encode_close_frame, encode_frame, parse_close_payload, try_decode_frame};
use websocket_wire::message::close_code;
use websocket_wire::{Connection, ConnectionEvent, ConnectionState, Opcode, ServerTransport, TransportOptions, WsError};

const MASK_KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

// 辅助函数：初始化日志，仅用于测试，避免多次初始化
fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::Info).is_test(true).try_init();
}

/// 为异步操作加上统一的超时，避免测试在失败时挂起。
async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut).await.expect("测试操作超时")
}

/// 在随机端口上启动服务器，每个升级成功的连接都通过通道交给测试。
async fn start_test_server(options: TransportOptions) -> (SocketAddr, mpsc::UnboundedReceiver<Connection>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = listener.local_addr().expect("无法获取本地监听地址");
    let (tx, rx) = mpsc::unbounded_channel::<Connection>();

    let server_handle = tokio::spawn(async move {
        let on_connect = move |connection: Connection| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(connection);
            }
        };
        if let Err(e) = ServerTransport::serve(listener, options, on_connect).await {
            error!("[Test Server] ServerTransport::serve 失败: {:?}", e);
        }
    });
    (addr, rx, server_handle)
}

fn upgrade_request(addr: SocketAddr) -> String {
    format!(
        "GET /repl HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// 模拟客户端编帧：服务端帧格式 + MASK 位 + 掩码密钥 + 加掩码的载荷。
fn masked_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let encoded = encode_frame(opcode, payload).expect("编码失败");
    let header_len = encoded.len() - payload.len();
    let mut out = encoded[..header_len].to_vec();
    out[1] |= 0x80;
    out.extend_from_slice(&MASK_KEY);
    let mut body = payload.to_vec();
    apply_mask(&mut body, MASK_KEY);
    out.extend_from_slice(&body);
    out
}

/// 逐字节读取响应头，避免吞掉紧随其后的帧。
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("读取响应头失败");
        assert_ne!(n, 0, "服务器在响应头结束前关闭了连接");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("响应头不是 UTF-8")
}

/// 以原始套接字完成握手，并取得服务器一侧的连接对象。
async fn open_raw(addr: SocketAddr, connections: &mut mpsc::UnboundedReceiver<Connection>) -> (TcpStream, Connection) {
    let mut stream = TcpStream::connect(addr).await.expect("连接服务器失败");
    stream.write_all(upgrade_request(addr).as_bytes()).await.expect("发送握手请求失败");
    let head = within(read_response_head(&mut stream)).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "意外的响应: {head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    let connection = within(connections.recv()).await.expect("服务器未交出连接");
    (stream, connection)
}

/// 发送原始请求并读到服务器关闭连接为止。
async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("连接服务器失败");
    stream.write_all(request.as_bytes()).await.expect("发送请求失败");
    let mut response = Vec::new();
    // 服务器写完拒绝响应后立即关闭，连接复位时保留已读到的部分
    if let Err(e) = within(stream.read_to_end(&mut response)).await {
        info!("[Test Client] 读取响应时连接被对端关闭: {}", e);
    }
    String::from_utf8_lossy(&response).into_owned()
}

/// 从服务器读取下一帧（服务端帧不加掩码）。
async fn read_server_frame(stream: &mut TcpStream) -> (Opcode, Vec<u8>) {
    let mut buffer = Vec::new();
    loop {
        if let Some((frame, _)) = try_decode_frame(&buffer).expect("服务器发出了非法帧") {
            assert!(!frame.masked, "服务端帧不得加掩码");
            return (frame.opcode, frame.payload);
        }
        let mut chunk = [0u8; 1024];
        let n = within(stream.read(&mut chunk)).await.expect("读取帧失败");
        assert_ne!(n, 0, "服务器在帧完整之前关闭了连接");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tungstenite_client_round_trip() {
    init_test_logger();
    let (addr, mut connections, server_handle) = start_test_server(TransportOptions::default()).await;

    let url_string = format!("ws://{}", addr);
    info!("[Test Main] 客户端尝试连接到: {}", url_string);
    let (mut client_ws_stream, response) = within(connect_async(&url_string)).await.expect("客户端连接失败");
    assert_eq!(response.status().as_u16(), 101);

    let mut connection = within(connections.recv()).await.expect("服务器未交出连接");
    assert_eq!(connection.state(), ConnectionState::Open);

    // 文本消息：收到后回显
    let client_message = "Hello from client!";
    client_ws_stream
        .send(TungsteniteMessage::Text(client_message.to_string()))
        .await
        .expect("客户端发送消息失败");
    let event = within(connection.next_event()).await.expect("未收到数据事件");
    assert_eq!(event.as_text(), Some(client_message));
    connection
        .send(format!("Server received: {}", client_message))
        .expect("服务器发送回显失败");
    match within(client_ws_stream.next()).await {
        Some(Ok(TungsteniteMessage::Text(text))) => assert_eq!(text, "Server received: Hello from client!"),
        other => panic!("客户端未收到文本回显: {:?}", other),
    }

    // 二进制消息
    client_ws_stream
        .send(TungsteniteMessage::Binary(vec![0, 1, 2, 255]))
        .await
        .expect("客户端发送二进制消息失败");
    let event = within(connection.next_event()).await.expect("未收到数据事件");
    assert_eq!(
        event,
        ConnectionEvent::Data {
            opcode: Opcode::Binary,
            payload: vec![0, 1, 2, 255]
        }
    );
    connection.send(vec![9u8, 8, 7]).expect("服务器发送二进制失败");
    match within(client_ws_stream.next()).await {
        Some(Ok(TungsteniteMessage::Binary(data))) => assert_eq!(data, vec![9, 8, 7]),
        other => panic!("客户端未收到二进制回显: {:?}", other),
    }

    // PING 由连接自动回复 PONG，不会作为数据事件出现
    client_ws_stream
        .send(TungsteniteMessage::Ping(b"heartbeat".to_vec()))
        .await
        .expect("客户端发送 PING 失败");
    match within(client_ws_stream.next()).await {
        Some(Ok(TungsteniteMessage::Pong(data))) => assert_eq!(data, b"heartbeat"),
        other => panic!("客户端未收到 PONG: {:?}", other),
    }

    // 客户端发起关闭握手
    let _ = client_ws_stream.close(None).await;
    let event = within(connection.next_event()).await.expect("未收到关闭事件");
    assert_eq!(
        event,
        ConnectionEvent::Close {
            code: close_code::NO_STATUS,
            reason: None
        }
    );
    assert!(within(connection.next_event()).await.is_none(), "关闭事件之后不应再有事件");
    assert!(matches!(connection.send("late"), Err(WsError::ConnectionClosed)));

    server_handle.abort();
    let _ = server_handle.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_messages_use_extended_lengths() {
    init_test_logger();
    let (addr, mut connections, server_handle) = start_test_server(TransportOptions::default()).await;
    let (mut client_ws_stream, _) = within(connect_async(format!("ws://{}", addr))).await.expect("客户端连接失败");
    let mut connection = within(connections.recv()).await.expect("服务器未交出连接");

    for len in [126usize, 65535, 65536, 200_000] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        client_ws_stream
            .send(TungsteniteMessage::Binary(payload.clone()))
            .await
            .expect("客户端发送失败");
        match within(connection.next_event()).await {
            Some(ConnectionEvent::Data { opcode: Opcode::Binary, payload: received }) => {
                assert_eq!(received, payload, "长度 {len} 的载荷不一致")
            }
            other => panic!("长度 {len}: 意外的事件 {:?}", other),
        }
        connection.send(payload.clone()).expect("服务器发送失败");
        match within(client_ws_stream.next()).await {
            Some(Ok(TungsteniteMessage::Binary(data))) => assert_eq!(data, payload),
            other => panic!("长度 {len}: 客户端收到意外消息 {:?}", other),
        }
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_rejects_upgrade_without_key() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    let response = raw_exchange(addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "意外的响应: {response}");
    assert!(response.contains("Sec-WebSocket-Key"));
    assert!(connections.try_recv().is_err(), "握手失败时不应调用连接回调");
}

#[tokio::test]
async fn test_rejects_plain_http_request() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;

    let response = raw_exchange(addr, "GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "意外的响应: {response}");
    assert!(connections.try_recv().is_err());
}

#[tokio::test]
async fn test_rejects_unsupported_version() {
    init_test_logger();
    let (addr, _connections, _server) = start_test_server(TransportOptions::default()).await;

    let request = upgrade_request(addr).replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
    let response = raw_exchange(addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "意外的响应: {response}");
    assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));
}

#[tokio::test]
async fn test_rejects_oversized_handshake() {
    init_test_logger();
    let options = TransportOptions {
        max_handshake_size: 256,
        ..TransportOptions::default()
    };
    let (addr, _connections, _server) = start_test_server(options).await;

    let request = upgrade_request(addr).replace("\r\n\r\n", &format!("\r\nX-Padding: {}\r\n\r\n", "a".repeat(512)));
    let response = raw_exchange(addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 431 "), "意外的响应: {response}");
}

#[tokio::test]
async fn test_server_survives_failed_handshake() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;

    let _ = raw_exchange(addr, "garbage\r\n\r\n").await;
    let (_stream, connection) = open_raw(addr, &mut connections).await;
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_frames_pipelined_with_handshake_are_delivered_in_order() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;

    let mut bytes = upgrade_request(addr).into_bytes();
    bytes.extend_from_slice(&masked_frame(Opcode::Text, b"one"));
    bytes.extend_from_slice(&masked_frame(Opcode::Text, b"two"));
    let mut stream = TcpStream::connect(addr).await.expect("连接服务器失败");
    stream.write_all(&bytes).await.expect("发送失败");
    let head = within(read_response_head(&mut stream)).await;
    assert!(head.starts_with("HTTP/1.1 101 "));

    let mut connection = within(connections.recv()).await.expect("服务器未交出连接");
    assert_eq!(within(connection.next_event()).await.unwrap().as_text(), Some("one"));
    assert_eq!(within(connection.next_event()).await.unwrap().as_text(), Some("two"));
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    let frame = masked_frame(Opcode::Text, "分两次写入的消息".as_bytes());
    let (first, rest) = frame.split_at(3);
    stream.write_all(first).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(rest).await.unwrap();

    let event = within(connection.next_event()).await.expect("未收到数据事件");
    assert_eq!(event.as_text(), Some("分两次写入的消息"));
}

#[tokio::test]
async fn test_ping_is_answered_and_not_delivered() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    stream.write_all(&masked_frame(Opcode::Ping, b"abc")).await.unwrap();
    stream.write_all(&masked_frame(Opcode::Pong, b"ignored")).await.unwrap();
    stream.write_all(&masked_frame(Opcode::Text, b"after")).await.unwrap();

    assert_eq!(read_server_frame(&mut stream).await, (Opcode::Pong, b"abc".to_vec()));
    let event = within(connection.next_event()).await.expect("未收到数据事件");
    assert_eq!(event.as_text(), Some("after"));
}

#[tokio::test]
async fn test_unmasked_frame_closes_with_protocol_error() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    stream.write_all(&encode_frame(Opcode::Text, b"oops").unwrap()).await.unwrap();

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap().0, close_code::PROTOCOL_ERROR);
    match within(connection.next_event()).await {
        Some(ConnectionEvent::Close { code, .. }) => assert_eq!(code, close_code::PROTOCOL_ERROR),
        other => panic!("预期关闭事件，实际为 {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_opcode_closes_with_protocol_error() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    let mut bytes = vec![0x83, 0x80];
    bytes.extend_from_slice(&MASK_KEY);
    stream.write_all(&bytes).await.unwrap();

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap().0, close_code::PROTOCOL_ERROR);
    assert!(matches!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close { code: close_code::PROTOCOL_ERROR, .. })
    ));
    assert!(within(connection.next_event()).await.is_none());
}

#[tokio::test]
async fn test_oversized_frame_closes_with_1009() {
    init_test_logger();
    let options = TransportOptions {
        max_payload_size: 16,
        ..TransportOptions::default()
    };
    let (addr, mut connections, _server) = start_test_server(options).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    stream.write_all(&masked_frame(Opcode::Binary, &[0u8; 17])).await.unwrap();

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap().0, close_code::MESSAGE_TOO_BIG);
    assert!(matches!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close { code: close_code::MESSAGE_TOO_BIG, .. })
    ));
}

#[tokio::test]
async fn test_remote_close_frame_is_echoed() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    let close = encode_close_frame(close_code::NORMAL, Some("done")).unwrap();
    let payload = &close[2..];
    stream.write_all(&masked_frame(Opcode::Close, payload)).await.unwrap();

    let (opcode, echoed) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&echoed).unwrap().0, close_code::NORMAL);
    assert_eq!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close {
            code: close_code::NORMAL,
            reason: Some("done".to_string())
        })
    );
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_abrupt_disconnect_reports_abnormal_closure() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (stream, mut connection) = open_raw(addr, &mut connections).await;

    drop(stream);

    assert_eq!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close {
            code: close_code::ABNORMAL,
            reason: None
        })
    );
    assert!(within(connection.next_event()).await.is_none());
    assert!(matches!(connection.send("anyone?"), Err(WsError::ConnectionClosed)));
}

#[tokio::test]
async fn test_frame_truncated_by_eof_closes_with_protocol_error() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    // 17 字节的帧只发出前 12 字节，随后关闭写方向
    let frame = masked_frame(Opcode::Text, b"hello world");
    assert_eq!(frame.len(), 17);
    stream.write_all(&frame[..12]).await.unwrap();
    stream.shutdown().await.unwrap();

    match within(connection.next_event()).await {
        Some(ConnectionEvent::Close { code, reason }) => {
            assert_eq!(code, close_code::PROTOCOL_ERROR);
            assert!(reason.is_some(), "截断帧的关闭事件应携带原因");
        }
        other => panic!("预期关闭事件，实际为 {:?}", other),
    }
    assert!(within(connection.next_event()).await.is_none());
}

#[tokio::test]
async fn test_one_byte_close_payload_closes_with_protocol_error() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    stream.write_all(&masked_frame(Opcode::Close, &[0x03])).await.unwrap();

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap().0, close_code::PROTOCOL_ERROR);
    assert!(matches!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close { code: close_code::PROTOCOL_ERROR, .. })
    ));
}

#[tokio::test]
async fn test_local_and_remote_close_emit_single_event() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, mut connection) = open_raw(addr, &mut connections).await;

    connection.close(close_code::NORMAL, Some("bye")).expect("首次关闭应成功");
    assert!(matches!(
        connection.close(close_code::NORMAL, None),
        Err(WsError::ConnectionClosed)
    ));
    assert!(matches!(connection.send("after close"), Err(WsError::ConnectionClosed)));

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap(), (close_code::NORMAL, Some("bye".to_string())));

    // 对端随后也发起关闭并断开
    let _ = stream.write_all(&masked_frame(Opcode::Close, &[0x03, 0xE8])).await;
    drop(stream);

    assert_eq!(
        within(connection.next_event()).await,
        Some(ConnectionEvent::Close {
            code: close_code::NORMAL,
            reason: Some("bye".to_string())
        })
    );
    assert!(within(connection.next_event()).await.is_none(), "关闭事件只能出现一次");
}

#[tokio::test]
async fn test_send_rejects_control_opcodes() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (_stream, connection) = open_raw(addr, &mut connections).await;

    for opcode in [Opcode::Close, Opcode::Ping, Opcode::Pong] {
        assert!(matches!(
            connection.send_frame(opcode, Vec::new()),
            Err(WsError::InvalidArgument(_))
        ));
    }
    assert!(connection.send_frame(Opcode::Text, b"ok".to_vec()).is_ok());
}

#[tokio::test]
async fn test_connection_id_is_assigned_once() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (_stream, connection) = open_raw(addr, &mut connections).await;

    assert_eq!(connection.id(), None);
    connection.set_id("client-1").unwrap();
    assert_eq!(connection.id(), Some("client-1"));
    assert_eq!(connection.sender().id(), Some("client-1"));
    assert!(matches!(connection.set_id("client-2"), Err(WsError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_dropping_all_handles_closes_with_going_away() {
    init_test_logger();
    let (addr, mut connections, _server) = start_test_server(TransportOptions::default()).await;
    let (mut stream, connection) = open_raw(addr, &mut connections).await;

    drop(connection);

    let (opcode, payload) = read_server_frame(&mut stream).await;
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&payload).unwrap().0, close_code::GOING_AWAY);
}
