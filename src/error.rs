use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::protocol::ProtocolError;

/// NSQ客户端库错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),

    /// 连接错误(拨号失败或传输中断)
    #[error("连接错误: {0}")]
    Connection(String),

    /// 针对已关闭连接发起的操作
    #[error("连接已关闭")]
    ConnectionClosed,

    /// 协议错误(坏帧、超限帧或服务器ERROR回复)
    #[error("协议错误: {0}")]
    Protocol(#[from] ProtocolError),

    /// 操作超时
    #[error("操作超时")]
    Timeout(#[from] Elapsed),

    /// 服务器要求认证但未配置auth_secret
    #[error("服务器要求认证但未配置auth_secret")]
    AuthRequired,

    /// 认证失败
    #[error("认证失败: {0}")]
    AuthFailed(String),

    /// nsqlookupd查询错误
    #[error("lookupd查询错误: {0}")]
    Lookup(String),

    /// 消息所属的连接已不存在
    #[error("消息所属的连接已关闭")]
    MessageGone,

    /// 消息已被FIN或REQ确认
    #[error("消息已处理, 不能重复确认")]
    MessageAlreadyProcessed,

    /// 消息超过msg_timeout, 服务器侧已重新入队
    #[error("消息已超时")]
    MessageTimedOut,

    /// 一轮扫描内所有候选nsqd均不可用
    #[error("没有可用的NSQ连接")]
    NoConnections,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Lookup(err.to_string())
    }
}

/// Result类型别名, 用于NSQ客户端库
pub type Result<T> = std::result::Result<T, Error>;
