use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

/// NSQ协议常量
pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

/// 非消息帧的大小上限
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
/// 消息帧的大小上限
pub const MAX_MESSAGE_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// 消息载荷头部长度: 8字节时间戳 + 2字节尝试次数 + 16字节ID
pub const MESSAGE_HEADER_SIZE: usize = 26;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
    #[error("Frame of {size} bytes exceeds cap of {cap} bytes")]
    FrameTooLarge { size: usize, cap: usize },
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(i32),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Protocol error: {0}")]
    Other(String),
}

/// 命令类型枚举
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 标识客户端身份并协商服务器特性
    Identify(IdentifyConfig),
    /// 认证
    Auth(String),
    /// 订阅主题和频道
    Subscribe(String, String),
    /// 更新RDY额度(可接收的在途消息数)
    Ready(u64),
    /// 完成处理消息
    Finish(String),
    /// 重新入队消息, 延迟毫秒数
    Requeue(String, u64),
    /// 重置消息的超时时间
    Touch(String),
    /// 清理并关闭连接
    Cls,
    /// 心跳应答
    Nop,
    /// 发布消息到主题
    Publish(String, Vec<u8>),
    /// 延迟发布消息到主题
    DelayedPublish(String, Vec<u8>, u64),
    /// 批量发布消息到主题
    Mpublish(String, Vec<Vec<u8>>),
}

impl Command {
    /// 将命令转换为字节以便发送
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Command::Identify(config) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                let json = serde_json::to_string(config)?;
                buf.write_u32::<BigEndian>(json.len() as u32)
                    .map_err(ProtocolError::Io)?;
                buf.extend_from_slice(json.as_bytes());
            }
            Command::Auth(secret) => {
                buf.extend_from_slice(b"AUTH\n");
                buf.write_u32::<BigEndian>(secret.len() as u32)
                    .map_err(ProtocolError::Io)?;
                buf.extend_from_slice(secret.as_bytes());
            }
            Command::Subscribe(topic, channel) => {
                let cmd = format!("SUB {} {}\n", topic, channel);
                buf.extend_from_slice(cmd.as_bytes());
            }
            Command::Ready(count) => {
                let cmd = format!("RDY {}\n", count);
                buf.extend_from_slice(cmd.as_bytes());
            }
            Command::Finish(id) => {
                let cmd = format!("FIN {}\n", id);
                buf.extend_from_slice(cmd.as_bytes());
            }
            Command::Requeue(id, delay) => {
                let cmd = format!("REQ {} {}\n", id, delay);
                buf.extend_from_slice(cmd.as_bytes());
            }
            Command::Touch(id) => {
                let cmd = format!("TOUCH {}\n", id);
                buf.extend_from_slice(cmd.as_bytes());
            }
            Command::Cls => {
                buf.extend_from_slice(b"CLS\n");
            }
            Command::Nop => {
                buf.extend_from_slice(b"NOP\n");
            }
            Command::Publish(topic, body) => {
                let cmd = format!("PUB {}\n", topic);
                buf.extend_from_slice(cmd.as_bytes());
                buf.write_u32::<BigEndian>(body.len() as u32)
                    .map_err(ProtocolError::Io)?;
                buf.extend_from_slice(body.as_slice());
            }
            Command::DelayedPublish(topic, body, delay) => {
                let cmd = format!("DPUB {} {}\n", topic, delay);
                buf.extend_from_slice(cmd.as_bytes());
                buf.write_u32::<BigEndian>(body.len() as u32)
                    .map_err(ProtocolError::Io)?;
                buf.extend_from_slice(body.as_slice());
            }
            Command::Mpublish(topic, bodies) => {
                let cmd = format!("MPUB {}\n", topic);
                buf.extend_from_slice(cmd.as_bytes());

                // 总大小: 4字节(消息数量) + 每个消息的(4字节大小 + 内容)
                let mut total_size = 4;
                for body in bodies {
                    total_size += 4 + body.len();
                }

                buf.write_u32::<BigEndian>(total_size as u32)
                    .map_err(ProtocolError::Io)?;
                buf.write_u32::<BigEndian>(bodies.len() as u32)
                    .map_err(ProtocolError::Io)?;

                for body in bodies {
                    buf.write_u32::<BigEndian>(body.len() as u32)
                        .map_err(ProtocolError::Io)?;
                    buf.extend_from_slice(body);
                }
            }
        }

        Ok(buf)
    }

    /// 是否期待服务器回复。
    ///
    /// nsqd只对IDENTIFY/AUTH/SUB/CLS以及PUB系列命令给出回复;
    /// NOP/RDY/FIN/REQ/TOUCH为即发即弃, 不得为其入队待决槽位,
    /// 否则FIFO应答关联会被卡死。
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            Command::Identify(_)
                | Command::Auth(_)
                | Command::Subscribe(..)
                | Command::Cls
                | Command::Publish(..)
                | Command::DelayedPublish(..)
                | Command::Mpublish(..)
        )
    }

    /// 命令动词, 用于日志
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Subscribe(..) => "SUB",
            Command::Ready(_) => "RDY",
            Command::Finish(_) => "FIN",
            Command::Requeue(..) => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
            Command::Publish(..) => "PUB",
            Command::DelayedPublish(..) => "DPUB",
            Command::Mpublish(..) => "MPUB",
        }
    }
}

/// 校验主题/频道名: 1-64个字符, 允许字母数字与 . _ - , 可带#ephemeral后缀
pub fn is_valid_name(name: &str) -> bool {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    if base.is_empty() || base.len() > 64 {
        return false;
    }
    base.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// 解码后的原始消息载荷
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// 消息时间戳(纳秒)
    pub timestamp: i64,
    /// 消息尝试次数
    pub attempts: u16,
    /// 16个ASCII字符的消息ID
    pub id: String,
    /// 消息体
    pub body: Vec<u8>,
}

impl RawMessage {
    /// 从MESSAGE帧载荷解析消息
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Other(format!(
                "message payload of {} bytes is too short",
                payload.len()
            ))
            .into());
        }

        let timestamp = BigEndian::read_i64(&payload[0..8]);
        let attempts = BigEndian::read_u16(&payload[8..10]);
        let id = std::str::from_utf8(&payload[10..26])
            .map_err(|_| ProtocolError::Other("message id is not ASCII".to_string()))?
            .to_string();
        let body = payload[26..].to_vec();

        Ok(Self {
            timestamp,
            attempts,
            id,
            body,
        })
    }
}

/// 帧类型
#[derive(Debug)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(RawMessage),
}

/// 流式帧解码器。
///
/// 按NSQ线上格式(4字节大端总长S + 4字节大端帧类型 + S-4字节载荷)
/// 从字节块中切出帧; 不完整的帧留在缓冲区等待后续数据。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    payload_size: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入从连接读到的原始数据块
    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// 尝试解出下一帧; 数据不足时返回None
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.payload_size.is_none() && self.buffer.len() >= 4 {
            let size = BigEndian::read_u32(&self.buffer[..4]) as usize;
            // 帧长至少要容纳4字节帧类型
            if size < 4 {
                return Err(ProtocolError::InvalidFrameSize(size).into());
            }
            self.payload_size = Some(size);
        }

        let size = match self.payload_size {
            Some(size) => size,
            None => return Ok(None),
        };

        if self.buffer.len() < 8 {
            return Ok(None);
        }

        let frame_type = BigEndian::read_i32(&self.buffer[4..8]);
        let cap = match frame_type {
            FRAME_TYPE_MESSAGE => MAX_MESSAGE_FRAME_SIZE,
            FRAME_TYPE_RESPONSE | FRAME_TYPE_ERROR => MAX_FRAME_SIZE,
            other => return Err(ProtocolError::InvalidFrameType(other).into()),
        };
        if size > cap {
            return Err(ProtocolError::FrameTooLarge { size, cap }.into());
        }

        if self.buffer.len() < 4 + size {
            return Ok(None);
        }

        let payload = &self.buffer[8..4 + size];
        let frame = match frame_type {
            FRAME_TYPE_RESPONSE => Frame::Response(payload.to_vec()),
            FRAME_TYPE_ERROR => Frame::Error(payload.to_vec()),
            _ => Frame::Message(RawMessage::from_payload(payload)?),
        };

        self.buffer.drain(..4 + size);
        self.payload_size = None;

        Ok(Some(frame))
    }
}

/// IDENTIFY命令的配置
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IdentifyConfig {
    /// 客户端标识, 默认为hostname
    pub client_id: String,

    /// 客户端主机名
    pub hostname: String,

    /// 用户代理
    pub user_agent: String,

    /// 开启特性协商(始终为true)
    pub feature_negotiation: bool,

    /// 心跳间隔(毫秒), -1表示禁用
    pub heartbeat_interval: i64,

    /// 输出缓冲大小
    pub output_buffer_size: i64,

    /// 输出缓冲超时(毫秒)
    pub output_buffer_timeout: i64,

    /// 投递采样率(0-99)
    pub sample_rate: i32,

    /// 消息超时(毫秒)
    pub msg_timeout: i64,

    /// TLS开关, 本实现不支持, 始终声明为false
    pub tls_v1: bool,

    /// snappy压缩开关, 始终声明为false
    pub snappy: bool,

    /// deflate压缩开关, 始终声明为false
    pub deflate: bool,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            client_id: hostname.clone(),
            hostname,
            user_agent: format!("nsq-client-rs/{}", env!("CARGO_PKG_VERSION")),
            feature_negotiation: true,
            heartbeat_interval: 30000,
            output_buffer_size: 16384,
            output_buffer_timeout: 250,
            sample_rate: 0,
            msg_timeout: 60000,
            tls_v1: false,
            snappy: false,
            deflate: false,
        }
    }
}

/// IDENTIFY响应(特性协商结果), 未知键忽略
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    pub max_msg_timeout: i64,
    pub msg_timeout: i64,
    pub heartbeat_interval: i64,
    pub auth_required: bool,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
}
