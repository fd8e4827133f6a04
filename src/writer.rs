use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::{Error, Result};
use crate::protocol::{self, Command};

/// 生产者配置
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// nsqd地址列表, 发布时按轮转顺序选择
    pub nsqd_addresses: Vec<String>,
    /// 底层连接配置
    pub connection: ConnectionOptions,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            nsqd_addresses: vec![],
            connection: ConnectionOptions::default(),
        }
    }
}

/// 生产者。
///
/// 按地址维护连接, 首次使用某地址时才拨号。发布命令从轮转位置
/// 开始尝试, 连接失败时换下一个地址; 一轮扫描内全部失败才报
/// NoConnections。服务器的ERROR回复(如E_BAD_TOPIC)直接上抛。
pub struct Writer {
    config: WriterConfig,
    connections: DashMap<String, Connection>,
    next: AtomicUsize,
    closed: AtomicBool,
}

/// 创建生产者, 连接按需惰性建立
pub fn create_writer(config: WriterConfig) -> Result<Writer> {
    if config.nsqd_addresses.is_empty() {
        return Err(Error::Config("nsqd_addresses不能为空".to_string()));
    }
    Ok(Writer {
        config,
        connections: DashMap::new(),
        next: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    })
}

impl Writer {
    /// 发布一条消息到主题
    pub async fn publish<T: AsRef<[u8]>>(&self, topic: &str, message: T) -> Result<()> {
        self.ensure_topic(topic)?;
        self.execute_with_fallback(Command::Publish(
            topic.to_string(),
            message.as_ref().to_vec(),
        ))
        .await
        .map(|_| ())
    }

    /// 批量发布消息到主题
    pub async fn publish_multi<T: AsRef<[u8]>>(&self, topic: &str, messages: Vec<T>) -> Result<()> {
        self.ensure_topic(topic)?;
        if messages.is_empty() {
            debug!("忽略空消息列表");
            return Ok(());
        }
        let bodies = messages.iter().map(|m| m.as_ref().to_vec()).collect();
        self.execute_with_fallback(Command::Mpublish(topic.to_string(), bodies))
            .await
            .map(|_| ())
    }

    /// 延迟发布消息到主题
    pub async fn publish_delayed<T: AsRef<[u8]>>(
        &self,
        topic: &str,
        message: T,
        delay: Duration,
    ) -> Result<()> {
        self.ensure_topic(topic)?;
        self.execute_with_fallback(Command::DelayedPublish(
            topic.to_string(),
            message.as_ref().to_vec(),
            delay.as_millis() as u64,
        ))
        .await
        .map(|_| ())
    }

    /// 当前已建立的连接数
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 关闭生产者与全部连接
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns: Vec<(String, Connection)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.connections.clear();
        for (addr, conn) in conns {
            if let Err(e) = conn.close().await {
                warn!("关闭到 {} 的连接失败: {}", addr, e);
            }
        }
        info!("生产者已关闭");
    }

    fn ensure_topic(&self, topic: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if !protocol::is_valid_name(topic) {
            return Err(Error::Config(format!("非法主题名: {}", topic)));
        }
        Ok(())
    }

    /// 取出某地址的连接, 没有或已死则重新拨号
    async fn get_or_connect(&self, addr: &str) -> Result<Connection> {
        let existing = self.connections.get(addr).map(|entry| entry.value().clone());
        if let Some(conn) = existing {
            if !conn.status().is_closed() {
                return Ok(conn);
            }
            self.connections.remove(addr);
        }

        debug!("为地址 {} 建立新连接", addr);
        let conn = Connection::open(addr, self.config.connection.clone()).await?;
        self.connections.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// 从轮转位置开始逐个地址尝试执行命令
    async fn execute_with_fallback(&self, command: Command) -> Result<Vec<u8>> {
        let addrs = &self.config.nsqd_addresses;
        let start = self.next.fetch_add(1, Ordering::Relaxed) % addrs.len();

        for i in 0..addrs.len() {
            let addr = &addrs[(start + i) % addrs.len()];
            let conn = match self.get_or_connect(addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("连接 {} 失败: {}, 尝试下一个地址", addr, e);
                    continue;
                }
            };

            match conn.execute(command.clone()).await {
                Ok(body) => return Ok(body),
                // 服务器明确拒绝, 换地址重试没有意义
                Err(Error::Protocol(e)) => return Err(Error::Protocol(e)),
                Err(e) => {
                    warn!("在 {} 上执行 {} 失败: {}, 尝试下一个地址", addr, command.name(), e);
                    self.connections.remove(addr);
                }
            }
        }

        Err(Error::NoConnections)
    }
}
