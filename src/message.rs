use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::protocol::{Command, RawMessage};

/// 一条入站消息的句柄, 携带路由回所属连接的确认操作。
///
/// 对连接只持弱引用: 消息不会延长连接的生命周期, 连接关闭后
/// 确认操作快速失败而不是复活套接字。
pub struct Message {
    id: String,
    body: Vec<u8>,
    attempts: u16,
    timestamp: i64,
    msg_timeout: Duration,
    initialized_at: StdMutex<Instant>,
    processed: AtomicBool,
    connection: Weak<ConnectionInner>,
}

impl Message {
    pub(crate) fn new(
        raw: RawMessage,
        connection: Weak<ConnectionInner>,
        msg_timeout: Duration,
    ) -> Self {
        Self {
            id: raw.id,
            body: raw.body,
            attempts: raw.attempts,
            timestamp: raw.timestamp,
            msg_timeout,
            initialized_at: StdMutex::new(Instant::now()),
            processed: AtomicBool::new(false),
            connection,
        }
    }

    /// 16个ASCII字符的消息ID
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 将消息体按UTF-8解码
    pub fn body_as_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// 服务器侧时间戳(纳秒)
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// 消息是否已被FIN或REQ确认
    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// 是否已超过协商的msg_timeout(服务器会自行重新入队)
    pub fn is_timed_out(&self) -> bool {
        let initialized_at = *self.initialized_at.lock().unwrap();
        initialized_at.elapsed() > self.msg_timeout
    }

    /// 既未确认也未超时
    pub fn can_be_processed(&self) -> bool {
        !self.is_processed() && !self.is_timed_out()
    }

    /// 完成消息(成功处理)。FIN与REQ至多一个成功, 之后的确认都会失败。
    pub async fn fin(&self) -> Result<()> {
        self.settle(Command::Finish(self.id.clone())).await
    }

    /// 重新入队消息(处理失败), timeout_ms为0时立即重新投递
    pub async fn req(&self, timeout_ms: u64) -> Result<()> {
        self.settle(Command::Requeue(self.id.clone(), timeout_ms))
            .await
    }

    /// 重置消息的超时时间, 仅在未确认且未超时的情况下有效
    pub async fn touch(&self) -> Result<()> {
        self.ensure_can_be_processed()?;
        let connection = self.connection.upgrade().ok_or(Error::MessageGone)?;
        connection.send_ack(Command::Touch(self.id.clone())).await?;
        *self.initialized_at.lock().unwrap() = Instant::now();
        Ok(())
    }

    fn ensure_can_be_processed(&self) -> Result<()> {
        if self.is_processed() {
            return Err(Error::MessageAlreadyProcessed);
        }
        if self.is_timed_out() {
            return Err(Error::MessageTimedOut);
        }
        Ok(())
    }

    async fn settle(&self, command: Command) -> Result<()> {
        if self.is_timed_out() && !self.is_processed() {
            return Err(Error::MessageTimedOut);
        }
        // 先占住processed标志, 确保FIN/REQ至多一个成功
        if self
            .processed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::MessageAlreadyProcessed);
        }

        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => {
                self.processed.store(false, Ordering::Release);
                return Err(Error::MessageGone);
            }
        };
        if let Err(e) = connection.send_ack(command).await {
            // 未触网成功, 允许之后重试
            self.processed.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .field("is_processed", &self.is_processed())
            .field("is_timed_out", &self.is_timed_out())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, body: &[u8]) -> RawMessage {
        RawMessage {
            timestamp: 1700000000000000000,
            attempts: 1,
            id: id.to_string(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_fin_fails_when_connection_gone() {
        let message = Message::new(
            raw("0123456789abcdef", b"hello"),
            Weak::new(),
            Duration::from_secs(60),
        );

        assert!(message.can_be_processed());
        assert!(matches!(message.fin().await, Err(Error::MessageGone)));
        // 未触网, 不应标记为已处理
        assert!(!message.is_processed());
    }

    #[tokio::test]
    async fn test_ack_fails_after_timeout() {
        let message = Message::new(
            raw("0123456789abcdef", b"hello"),
            Weak::new(),
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));

        assert!(message.is_timed_out());
        assert!(!message.can_be_processed());
        assert!(matches!(message.fin().await, Err(Error::MessageTimedOut)));
        assert!(matches!(message.req(0).await, Err(Error::MessageTimedOut)));
        assert!(matches!(message.touch().await, Err(Error::MessageTimedOut)));
    }

    #[test]
    fn test_accessors() {
        let message = Message::new(
            raw("0123456789abcdef", b"hello"),
            Weak::new(),
            Duration::from_secs(60),
        );

        assert_eq!(message.id(), "0123456789abcdef");
        assert_eq!(message.body(), b"hello");
        assert_eq!(message.body_as_str().unwrap(), "hello");
        assert_eq!(message.attempts(), 1);
        assert_eq!(message.timestamp(), 1700000000000000000);
        assert!(!message.is_processed());
    }
}
