// websocket_wire/src/frame.rs

//! RFC 6455 第 5.2 节的帧编解码。
//!
//! 本模块不做任何 I/O，也不持有状态：
//! - `try_decode_frame` 作用于缓冲区快照，返回"尚不完整"或"一帧 + 消耗的字节数"；
//! - `encode_frame` 生成服务端发出的帧（FIN=1，不加掩码）。
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::WsError;

/// 控制帧载荷的最大长度。
pub const MAX_CONTROL_PAYLOAD_LEN: usize = 125;

/// 编解码支持的最大载荷长度（32 位无符号整数范围）。
///
/// 64 位扩展长度会被完整解析；超过此值的长度以 `PayloadTooLarge` 拒绝。
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;

/// 帧操作码（4 位）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// 从帧头的低 4 位解析操作码。不认识的值属于协议错误。
    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// CLOSE、PING、PONG 为控制帧。
    pub const fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::from_u8(value)
    }
}

/// 一个解码完成的帧。载荷已经去掩码。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN 位。本库不做分片重组，只解析不解释。
    pub fin: bool,
    pub opcode: Opcode,
    /// 帧头中的 MASK 位。
    pub masked: bool,
    /// 掩码密钥，仅当 `masked` 为真时存在。
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

/// 按 `data[i] ^= key[i % 4]` 就地加/去掩码。对同一密钥执行两次即还原。
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// 以默认上限 [`MAX_PAYLOAD_LEN`] 尝试从缓冲区开头解码一帧。
///
/// # Returns
/// * `Ok(None)`：缓冲区中的字节还不足一帧，调用方应等待更多数据，没有字节被消耗。
/// * `Ok(Some((frame, consumed)))`：解码出一帧，`consumed` 为该帧在缓冲区中占用的确切字节数。
/// * `Err(_)`：协议错误，连接应以 [`WsError::close_code`] 关闭。
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, WsError> {
    try_decode_frame_with_limit(buf, MAX_PAYLOAD_LEN)
}

/// 与 [`try_decode_frame`] 相同，但载荷长度不得超过 `max_payload_len`
/// （该值本身被限制在 [`MAX_PAYLOAD_LEN`] 以内）。
pub fn try_decode_frame_with_limit(
    buf: &[u8],
    max_payload_len: u64,
) -> Result<Option<(Frame, usize)>, WsError> {
    // 至少需要 2 字节的基本帧头
    if buf.len() < 2 {
        return Ok(None);
    }

    // 第 1 字节：FIN、RSV1-3 与操作码；第 2 字节：MASK 与 7 位长度
    let first_byte = buf[0];
    let second_byte = buf[1];

    let fin = first_byte & 0x80 != 0;
    // 未协商扩展，RSV 位必须为 0
    if first_byte & 0x70 != 0 {
        return Err(WsError::ReservedBitsSet);
    }
    let opcode = Opcode::from_u8(first_byte & 0x0F)?;
    let masked = second_byte & 0x80 != 0;
    let length_field = second_byte & 0x7F;

    if opcode.is_control() && !fin {
        return Err(WsError::FragmentedControlFrame);
    }

    // 负载长度：7 位内联，或 16/64 位大端扩展长度
    let (payload_len, mut offset) = match length_field {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        inline => (u64::from(inline), 2),
    };

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD_LEN as u64 {
        return Err(WsError::ControlFrameTooLarge(payload_len));
    }
    // 先按上限检查，再转换为 usize，长度从不截断
    let max = max_payload_len.min(MAX_PAYLOAD_LEN);
    if payload_len > max {
        return Err(WsError::PayloadTooLarge {
            size: payload_len,
            max,
        });
    }
    let payload_len = usize::try_from(payload_len).map_err(|_| WsError::PayloadTooLarge {
        size: payload_len,
        max,
    })?;

    // 掩码密钥紧跟在长度字段之后
    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    // 载荷尚未全部到达
    let end = offset + payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let mut payload = buf[offset..end].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            masked,
            mask_key,
            payload,
        },
        end,
    )))
}

/// 将一条消息编码为服务端帧：FIN=1，MASK=0，长度按 7/16/64 位形式编码。
///
/// 载荷超过 [`MAX_PAYLOAD_LEN`]，或控制帧载荷超过 125 字节时返回错误。
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<BytesMut, WsError> {
    let len = payload.len();
    if len as u64 > MAX_PAYLOAD_LEN {
        return Err(WsError::PayloadTooLarge {
            size: len as u64,
            max: MAX_PAYLOAD_LEN,
        });
    }
    if opcode.is_control() && len > MAX_CONTROL_PAYLOAD_LEN {
        return Err(WsError::ControlFrameTooLarge(len as u64));
    }

    let mut buf = BytesMut::with_capacity(len + 10);
    buf.put_u8(0x80 | opcode.as_u8());
    if len < 126 {
        buf.put_u8(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(126);
        buf.put_u16(len as u16);
    } else {
        // 高 4 字节恒为 0
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }
    buf.put_slice(payload);
    Ok(buf)
}

/// 编码一个 CLOSE 帧：2 字节大端关闭码 + UTF-8 原因。
///
/// 原因会在字符边界处截断，保证控制帧载荷不超过 125 字节。
/// 1005/1006 等不能出现在线上的关闭码会生成空载荷的 CLOSE 帧。
pub fn encode_close_frame(code: u16, reason: Option<&str>) -> Result<BytesMut, WsError> {
    if !crate::message::close_code::is_sendable(code) {
        return encode_frame(Opcode::Close, &[]);
    }

    let mut payload = Vec::with_capacity(MAX_CONTROL_PAYLOAD_LEN);
    payload.extend_from_slice(&code.to_be_bytes());
    if let Some(reason) = reason {
        let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD_LEN - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..cut]);
    }
    encode_frame(Opcode::Close, &payload)
}

/// 解析 CLOSE 帧载荷。空载荷返回 1005（未携带状态码）。
///
/// # Errors
/// 载荷恰好 1 字节，或原因不是合法 UTF-8 时返回 `WsError::InvalidClosePayload`。
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, Option<String>), WsError> {
    match payload.len() {
        0 => Ok((crate::message::close_code::NO_STATUS, None)),
        // 状态码需要完整的 2 字节
        1 => Err(WsError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = if payload.len() > 2 {
                let text = std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidClosePayload)?;
                Some(text.to_string())
            } else {
                None
            };
            Ok((code, reason))
        }
    }
}
