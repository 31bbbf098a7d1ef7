// websocket_wire/src/handshake.rs

//! RFC 6455 第 4.2 节的服务端握手。
//!
//! 本模块只处理字节：解析 HTTP 请求头、校验升级请求、计算 `Sec-WebSocket-Accept`，
//! 并生成 101 响应或拒绝响应。读写套接字由 `server::connection` 负责。

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::error::WsError;

/// 计算 `Sec-WebSocket-Accept` 时拼接在客户端密钥后的固定 GUID。
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// 服务端支持的唯一协议版本。
pub const WS_VERSION: &str = "13";

/// 由客户端的 `Sec-WebSocket-Key` 计算 `Sec-WebSocket-Accept`：
/// `base64(sha1(key + GUID))`。
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// 返回请求头结束标记 `\r\n\r\n` 之后的位置，即请求头的总长度。
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// 握手所需的最小 HTTP 请求表示。
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// 请求头，名称统一为小写。重复的请求头保留多份。
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// 解析完整的 HTTP 请求头（不含请求体）。
    pub fn parse(head: &[u8]) -> Result<Self, WsError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| WsError::InvalidRequest("请求头不是合法的 UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| WsError::InvalidRequest("空请求".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| WsError::InvalidRequest("缺少请求方法".into()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| WsError::InvalidRequest("缺少请求路径".into()))?
            .to_string();
        match parts.next() {
            Some(version) if version.starts_with("HTTP/1.") => {}
            _ => return Err(WsError::InvalidRequest(format!("无效的请求行: {request_line}"))),
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WsError::InvalidRequest(format!("无效的请求头行: {line}")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    /// 按名称（不区分大小写）获取第一个同名请求头。
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// 某请求头的逗号分隔取值中是否包含 `token`（不区分大小写）。
    fn header_has_token(&self, name: &str, token: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(key, _)| *key == name)
            .flat_map(|(_, value)| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// 是否为 WebSocket 升级请求：`Upgrade: websocket` 且 `Connection` 含 `Upgrade`。
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header_has_token("upgrade", "websocket")
            && self.header_has_token("connection", "upgrade")
    }
}

/// 校验升级请求并返回应答中的 `Sec-WebSocket-Accept` 值。
pub fn accept(request: &HttpRequest) -> Result<String, WsError> {
    if !request.method.eq_ignore_ascii_case("GET") || !request.is_websocket_upgrade() {
        return Err(WsError::NotUpgrade);
    }

    let version = request
        .header("sec-websocket-version")
        .ok_or(WsError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != WS_VERSION {
        return Err(WsError::UnsupportedVersion(version.to_string()));
    }

    let client_key = request
        .header("sec-websocket-key")
        .ok_or(WsError::MissingHeader("Sec-WebSocket-Key"))?;
    // 密钥必须是 16 字节随机数的 base64 编码
    match BASE64.decode(client_key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(WsError::InvalidKey),
    }

    Ok(compute_accept_key(client_key))
}

/// 生成 `101 Switching Protocols` 响应。
pub fn switching_protocols_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// 根据握手错误生成 HTTP 拒绝响应。
pub fn reject_response(err: &WsError) -> Vec<u8> {
    let status = err.http_status();
    let reason = match status {
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        _ => "Bad Request",
    };
    let body = err.to_string();
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    if status == 426 {
        response.push_str(&format!("Sec-WebSocket-Version: {WS_VERSION}\r\n"));
    }
    response.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    response.push_str("Connection: close\r\n\r\n");
    response.push_str(&body);
    response.into_bytes()
}
