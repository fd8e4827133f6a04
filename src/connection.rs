use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{
    self, Command, Frame, FrameDecoder, IdentifyConfig, IdentifyResponse, ProtocolError, MAGIC_V2,
};

/// 每次从套接字读取的最大字节数
const READ_CHUNK_SIZE: usize = 64 * 1024;
/// 消息通道在RDY额度之外的余量
const MESSAGE_CHANNEL_SLACK: usize = 16;

/// 连接状态机。
///
/// 除Connected/Subscribed可经Reconnecting重入外, 状态单调前进;
/// Closed为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Init,
    Connecting,
    Connected,
    Subscribed,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Subscribed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionStatus::Closing | ConnectionStatus::Closed)
    }
}

/// 连接配置
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// IDENTIFY握手参数
    pub identify: IdentifyConfig,
    /// 认证密钥, 服务器要求认证时必须提供
    pub auth_secret: Option<String>,
    /// 传输中断后是否自动重连并重放订阅状态
    pub auto_reconnect: bool,
    /// 拨号超时
    pub dial_timeout: Duration,
    /// IDENTIFY/AUTH握手超时
    pub identify_timeout: Duration,
    /// CLS后等待CLOSE_WAIT的时间
    pub close_timeout: Duration,
    /// 重连初始延迟
    pub reconnect_initial_delay: Duration,
    /// 重连最大延迟
    pub reconnect_max_delay: Duration,
    /// 消息通道按此RDY上限定容; None时取订阅时的RDY。
    /// 之后会通过rdy()提升额度的一方(如消费者)应在此给出可达到的上限
    pub message_channel_bound: Option<u64>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            identify: IdentifyConfig::default(),
            auth_secret: None,
            auto_reconnect: true,
            dial_timeout: Duration::from_secs(5),
            identify_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            message_channel_bound: None,
        }
    }
}

/// 订阅状态, 重连时按此重放SUB与RDY
#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    channel: String,
    rdy: u64,
}

/// 写半部与待决命令队列。
///
/// 两者共用一把锁: 槽位入队与命令写出在同一临界区内完成,
/// 保证队列顺序与线上命令顺序一致, 这是FIFO应答关联的前提。
struct WriteState {
    writer: Option<OwnedWriteHalf>,
    pending: VecDeque<oneshot::Sender<Result<Vec<u8>>>>,
}

pub(crate) struct ConnectionInner {
    addr: String,
    options: ConnectionOptions,
    status_tx: watch::Sender<ConnectionStatus>,
    write_state: Mutex<WriteState>,
    subscription: StdMutex<Option<Subscription>>,
    negotiated: StdMutex<IdentifyResponse>,
    dispatch_tx: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    message_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    read_task: StdMutex<Option<JoinHandle<()>>>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    in_flight: AtomicU64,
}

/// 到单个nsqd的TCP连接。
///
/// 一条连接上同时承载命令/应答流与异步消息流: 读循环将收到的帧
/// 分发到待决命令队列或有界消息通道, 心跳由连接自行应答。
/// 克隆只复制句柄, 仍指向同一条底层连接。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// 消息惰性序列。丢弃它只会停止本方的消费, 不会关闭连接。
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// 建立到nsqd的连接并完成IDENTIFY握手
pub async fn open_connection(
    host: &str,
    port: u16,
    options: ConnectionOptions,
) -> Result<Connection> {
    Connection::open(&format!("{}:{}", host, port), options).await
}

impl Connection {
    /// 建立连接: 拨号、发送魔术字、IDENTIFY握手(以及必要的AUTH)
    pub async fn open(addr: &str, options: ConnectionOptions) -> Result<Connection> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Init);
        let negotiated = IdentifyResponse {
            heartbeat_interval: options.identify.heartbeat_interval,
            msg_timeout: options.identify.msg_timeout,
            ..IdentifyResponse::default()
        };

        let inner = Arc::new(ConnectionInner {
            addr: addr.to_string(),
            options,
            status_tx,
            write_state: Mutex::new(WriteState {
                writer: None,
                pending: VecDeque::new(),
            }),
            subscription: StdMutex::new(None),
            negotiated: StdMutex::new(negotiated),
            dispatch_tx: StdMutex::new(None),
            message_rx: Mutex::new(None),
            read_task: StdMutex::new(None),
            dispatch_task: StdMutex::new(None),
            reconnect_task: StdMutex::new(None),
            in_flight: AtomicU64::new(0),
        });

        inner.status_tx.send_replace(ConnectionStatus::Connecting);
        match inner.attach_transport().await {
            Ok(()) => {
                inner.status_tx.send_replace(ConnectionStatus::Connected);
                debug!("已连接到 {}", addr);
                Ok(Connection { inner })
            }
            Err(e) => {
                inner.do_close(None).await;
                Err(e)
            }
        }
    }

    /// 执行命令并等待应答。
    ///
    /// 应答按命令下发顺序(FIFO)关联; 服务器回ERROR帧时返回协议错误,
    /// 应答前传输中断时返回ConnectionClosed。即发即弃命令写出后立即返回。
    pub async fn execute(&self, command: Command) -> Result<Vec<u8>> {
        self.inner.wait_until_writable(&command).await?;
        self.inner.execute_inner(command).await
    }

    /// 订阅主题和频道: 发送SUB等待OK, 建立消息通道, 再下发RDY额度
    pub async fn subscribe(&self, topic: &str, channel: &str, rdy: u64) -> Result<()> {
        if !protocol::is_valid_name(topic) {
            return Err(Error::Config(format!("非法主题名: {}", topic)));
        }
        if !protocol::is_valid_name(channel) {
            return Err(Error::Config(format!("非法频道名: {}", channel)));
        }
        if self.inner.subscription.lock().unwrap().is_some() {
            // 每条连接同一时间只允许一个订阅
            return Err(Error::Config("连接已存在订阅".to_string()));
        }

        self.execute(Command::Subscribe(topic.to_string(), channel.to_string()))
            .await?;

        // 有界通道按可被提升到的RDY上限定容, 而非初始RDY;
        // 背压由分发任务承受, 读循环的心跳应答与FIFO分发不受下游拖慢
        let bound = self
            .inner
            .options
            .message_channel_bound
            .unwrap_or(rdy)
            .max(rdy);
        let capacity = bound.max(1) as usize + MESSAGE_CHANNEL_SLACK;
        let (tx, rx) = mpsc::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        *self.inner.dispatch_tx.lock().unwrap() = Some(relay_tx);
        *self.inner.message_rx.lock().await = Some(rx);
        let handle = tokio::spawn(dispatch_loop(relay_rx, tx));
        *self.inner.dispatch_task.lock().unwrap() = Some(handle);
        *self.inner.subscription.lock().unwrap() = Some(Subscription {
            topic: topic.to_string(),
            channel: channel.to_string(),
            rdy,
        });
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Subscribed);

        self.execute(Command::Ready(rdy)).await?;
        info!("已订阅 {} 的主题 {} 频道 {}", self.inner.addr, topic, channel);
        Ok(())
    }

    /// 更新RDY额度, 重连重放时使用最新值
    pub async fn rdy(&self, count: u64) -> Result<()> {
        {
            let mut subscription = self.inner.subscription.lock().unwrap();
            match subscription.as_mut() {
                Some(sub) => sub.rdy = count,
                None => return Err(Error::Config("未订阅的连接不能设置RDY".to_string())),
            }
        }
        self.execute(Command::Ready(count)).await.map(|_| ())
    }

    /// 完成消息(即发即弃, 服务器只在出错时异步回复)
    pub async fn fin(&self, id: &str) -> Result<()> {
        self.inner.send_ack(Command::Finish(id.to_string())).await
    }

    /// 重新入队消息, 延迟毫秒数
    pub async fn req(&self, id: &str, timeout_ms: u64) -> Result<()> {
        self.inner
            .send_ack(Command::Requeue(id.to_string(), timeout_ms))
            .await
    }

    /// 重置消息超时
    pub async fn touch(&self, id: &str) -> Result<()> {
        self.inner.send_ack(Command::Touch(id.to_string())).await
    }

    /// 返回本连接的消息惰性序列。
    ///
    /// 连接关闭后序列终止; 需先调用subscribe, 否则序列立即结束。
    pub fn messages(&self) -> MessageStream {
        let inner = Arc::clone(&self.inner);
        Box::pin(stream::unfold(inner, |inner| async move {
            let message = {
                let mut rx = inner.message_rx.lock().await;
                match rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            };
            message.map(|message| (message, inner))
        }))
    }

    /// 等待下一条消息; 连接关闭时返回None
    pub async fn wait_for_message(&self) -> Option<Message> {
        let mut rx = self.inner.message_rx.lock().await;
        match rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// 优雅关闭: 发送CLS并等待CLOSE_WAIT(最多close_timeout),
    /// 随后断开套接字、以ConnectionClosed清空在途命令、关闭消息通道
    pub async fn close(&self) -> Result<()> {
        if self.status().is_closed() {
            return Ok(());
        }
        self.inner.status_tx.send_replace(ConnectionStatus::Closing);

        match timeout(
            self.inner.options.close_timeout,
            self.inner.execute_inner(Command::Cls),
        )
        .await
        {
            Ok(Err(e)) => debug!("{} 的CLS命令失败: {}", self.inner.addr, e),
            Err(_) => debug!("{} 等待CLOSE_WAIT超时", self.inner.addr),
            Ok(Ok(_)) => {}
        }

        self.inner.do_close(None).await;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_subscribed(&self) -> bool {
        self.status() == ConnectionStatus::Subscribed
    }

    pub fn subscribed_topic(&self) -> Option<String> {
        self.inner
            .subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.topic.clone())
    }

    pub fn subscribed_channel(&self) -> Option<String> {
        self.inner
            .subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.channel.clone())
    }

    /// 已接收但尚未FIN/REQ的消息数
    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// IDENTIFY协商结果
    pub fn negotiated(&self) -> IdentifyResponse {
        self.inner.negotiated.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionInner {
    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// 拨号并安装新的套接字、读循环, 完成魔术字与IDENTIFY握手
    fn attach_transport(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let stream = timeout(self.options.dial_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| Error::Connection(format!("连接 {} 超时", self.addr)))?
                .map_err(|e| Error::Connection(format!("无法连接到 {}: {}", self.addr, e)))?;

            let (read_half, write_half) = stream.into_split();
            {
                let mut ws = self.write_state.lock().await;
                ws.writer = Some(write_half);
            }
            let handle = tokio::spawn(read_loop(Arc::downgrade(self), read_half));
            *self.read_task.lock().unwrap() = Some(handle);

            self.write_raw(MAGIC_V2).await?;
            self.identify().await
        })
    }

    /// 发送IDENTIFY并应用服务器协商结果, 必要时执行AUTH
    async fn identify(&self) -> Result<()> {
        let config = self.options.identify.clone();
        let body = timeout(
            self.options.identify_timeout,
            self.execute_inner(Command::Identify(config)),
        )
        .await??;

        // feature_negotiation开启时服务器返回JSON, 容忍裸OK
        let response: IdentifyResponse = if body.as_slice() == protocol::OK {
            IdentifyResponse::default()
        } else {
            serde_json::from_slice(&body).map_err(|e| {
                Error::Protocol(ProtocolError::Other(format!(
                    "IDENTIFY响应无法解析: {}",
                    e
                )))
            })?
        };

        if response.tls_v1 || response.snappy || response.deflate {
            return Err(Error::Protocol(ProtocolError::Other(
                "服务器要求未实现的传输升级(tls/snappy/deflate)".to_string(),
            )));
        }

        {
            let mut negotiated = self.negotiated.lock().unwrap();
            if response.heartbeat_interval != 0 {
                negotiated.heartbeat_interval = response.heartbeat_interval;
            }
            if response.msg_timeout != 0 {
                negotiated.msg_timeout = response.msg_timeout;
            }
            negotiated.max_rdy_count = response.max_rdy_count;
            negotiated.max_msg_timeout = response.max_msg_timeout;
            negotiated.auth_required = response.auth_required;
        }

        if response.auth_required {
            let secret = match &self.options.auth_secret {
                Some(secret) => secret.clone(),
                None => return Err(Error::AuthRequired),
            };
            let result = timeout(
                self.options.identify_timeout,
                self.execute_inner(Command::Auth(secret)),
            )
            .await?;
            match result {
                Ok(_) => {
                    debug!("{} 认证通过", self.addr);
                }
                Err(Error::Protocol(ProtocolError::Server(code))) => {
                    return Err(Error::AuthFailed(code));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// 仅在连接可写(或重连完成)后放行命令
    async fn wait_until_writable(&self, command: &Command) -> Result<()> {
        match self.status() {
            ConnectionStatus::Connected | ConnectionStatus::Subscribed => Ok(()),
            ConnectionStatus::Init | ConnectionStatus::Connecting => Ok(()),
            ConnectionStatus::Reconnecting => {
                // 故障后到达的命令等待重放完成, 在新套接字上发出
                let mut rx = self.status_tx.subscribe();
                let result = match rx
                    .wait_for(|status| status.is_connected() || status.is_closed())
                    .await
                {
                    Ok(status) if status.is_connected() => Ok(()),
                    _ => Err(Error::ConnectionClosed),
                };
                result
            }
            ConnectionStatus::Closing => {
                if matches!(command, Command::Cls) {
                    Ok(())
                } else {
                    Err(Error::ConnectionClosed)
                }
            }
            ConnectionStatus::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// 序列化命令并写出; 期待应答的命令在同一临界区内入队oneshot槽位
    async fn execute_inner(&self, command: Command) -> Result<Vec<u8>> {
        let bytes = command.to_bytes()?;
        if !matches!(command, Command::Nop) {
            debug!("{} 执行命令 {}", self.addr, command.name());
        }

        let receiver = {
            let mut ws = self.write_state.lock().await;
            let state = &mut *ws;
            let writer = state.writer.as_mut().ok_or(Error::ConnectionClosed)?;

            let receiver = if command.expects_response() {
                let (tx, rx) = oneshot::channel();
                state.pending.push_back(tx);
                Some(rx)
            } else {
                None
            };

            let write_result = match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = write_result {
                // 写失败时撤回刚入队的槽位
                if receiver.is_some() {
                    state.pending.pop_back();
                }
                return Err(Error::Connection(format!("写入 {} 失败: {}", self.addr, e)));
            }
            receiver
        };

        match receiver {
            None => Ok(Vec::new()),
            Some(rx) => match rx.await {
                Ok(result) => result,
                // 槽位被连接清理丢弃
                Err(_) => Err(Error::ConnectionClosed),
            },
        }
    }

    /// 不入队的裸写, 仅用于魔术字
    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut ws = self.write_state.lock().await;
        let writer = ws.writer.as_mut().ok_or(Error::ConnectionClosed)?;
        let write_result = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        write_result.map_err(|e| Error::Connection(format!("写入 {} 失败: {}", self.addr, e)))
    }

    /// 消息确认的即发即弃写路径
    pub(crate) async fn send_ack(&self, command: Command) -> Result<()> {
        if !self.status().is_connected() {
            return Err(Error::MessageGone);
        }
        let settles = matches!(command, Command::Finish(_) | Command::Requeue(..));
        self.execute_inner(command).await?;
        if settles {
            let _ = self
                .in_flight
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(1))
                });
        }
        Ok(())
    }

    fn heartbeat_deadline(&self) -> Option<Duration> {
        let interval = self.negotiated.lock().unwrap().heartbeat_interval;
        if interval <= 0 {
            // 心跳被禁用时不设读超时, 只依赖TCP错误发现断连
            None
        } else {
            Some(Duration::from_millis(interval as u64 * 2))
        }
    }

    /// 将收到的帧分发到对应的汇: 心跳应答、待决命令队列、消息通道。
    /// 返回Err表示致命协议违规, 读循环随即退出。
    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Response(body) => {
                if body.as_slice() == protocol::HEARTBEAT {
                    debug!("{} 收到心跳, 回复NOP", self.addr);
                    return self.execute_inner(Command::Nop).await.map(|_| ());
                }
                let slot = self.write_state.lock().await.pending.pop_front();
                match slot {
                    Some(tx) => {
                        // 调用方可能已取消execute: 槽位照常按FIFO弹出,
                        // 应答送往已丢弃的接收端而被舍弃, 不会错配给后续命令
                        let _ = tx.send(Ok(body));
                        Ok(())
                    }
                    None => Err(Error::Protocol(ProtocolError::Other(
                        "response frame with no pending command".to_string(),
                    ))),
                }
            }
            Frame::Error(body) => {
                let text = String::from_utf8_lossy(&body).to_string();
                let slot = self.write_state.lock().await.pending.pop_front();
                match slot {
                    Some(tx) => {
                        let _ = tx.send(Err(Error::Protocol(ProtocolError::Server(text))));
                    }
                    None => {
                        // 无在途命令时的异步服务器错误(如E_FIN_FAILED), 不断开
                        warn!("{} 收到服务器异步错误: {}", self.addr, text);
                    }
                }
                Ok(())
            }
            Frame::Message(raw) => {
                let tx = self.dispatch_tx.lock().unwrap().clone();
                match tx {
                    Some(tx) => {
                        self.in_flight.fetch_add(1, Ordering::Relaxed);
                        let msg_timeout = {
                            let negotiated = self.negotiated.lock().unwrap();
                            Duration::from_millis(negotiated.msg_timeout.max(0) as u64)
                        };
                        let message = Message::new(raw, Arc::downgrade(self), msg_timeout);
                        // 经无界中继交给分发任务, 读循环不在此阻塞;
                        // 有界通道的背压落在分发任务上, 在途量由RDY额度约束
                        if tx.send(message).is_err() {
                            debug!("{} 的消息通道已关闭, 丢弃消息", self.addr);
                        }
                    }
                    None => {
                        // RDY为0(未订阅)时送达的消息属协议违规, 记录但不断开
                        warn!("{} 在无订阅状态下收到消息, 已忽略", self.addr);
                    }
                }
                Ok(())
            }
        }
    }

    /// 读循环退出后的处置: 主动关闭时静默返回, 否则视配置重连或关闭
    async fn on_transport_lost(self: &Arc<Self>, err: Error) {
        let status = self.status();
        if status.is_closed() {
            return;
        }

        // 当前任务即读循环本身, 取出句柄避免稍后自我中止
        self.read_task.lock().unwrap().take();
        self.fail_transport().await;

        match status {
            // 握手尚未完成: 在途的IDENTIFY/AUTH已随fail_transport失败,
            // 收尾交给open()或replay()的错误路径
            ConnectionStatus::Init | ConnectionStatus::Connecting => {}
            // 重放期间再次断开: 已有重连任务在运行, 由它继续重试
            ConnectionStatus::Reconnecting => {}
            _ if self.options.auto_reconnect => {
                warn!("与 {} 的连接中断: {}, 准备重连", self.addr, err);
                self.status_tx.send_replace(ConnectionStatus::Reconnecting);
                let handle = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
                *self.reconnect_task.lock().unwrap() = Some(handle);
            }
            _ => {
                self.do_close(Some(&err)).await;
            }
        }
    }

    /// 丢弃写半部并让所有在途命令以ConnectionClosed失败
    async fn fail_transport(&self) {
        let mut ws = self.write_state.lock().await;
        if let Some(mut writer) = ws.writer.take() {
            let _ = writer.shutdown().await;
        }
        for slot in ws.pending.drain(..) {
            let _ = slot.send(Err(Error::ConnectionClosed));
        }
    }

    /// 中止读循环并清理传输层
    async fn detach_transport(&self) {
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
        self.fail_transport().await;
    }

    /// 重建传输层并重放握手与订阅状态
    async fn replay(self: &Arc<Self>) -> Result<()> {
        self.detach_transport().await;
        self.attach_transport().await?;

        let subscription = self.subscription.lock().unwrap().clone();
        match subscription {
            Some(sub) => {
                self.execute_inner(Command::Subscribe(sub.topic.clone(), sub.channel.clone()))
                    .await?;
                self.execute_inner(Command::Ready(sub.rdy)).await?;
                self.status_tx.send_replace(ConnectionStatus::Subscribed);
            }
            None => {
                self.status_tx.send_replace(ConnectionStatus::Connected);
            }
        }
        Ok(())
    }

    async fn do_close(&self, err: Option<&Error>) {
        {
            let current = self.status();
            if current == ConnectionStatus::Closed {
                return;
            }
            if current != ConnectionStatus::Closing {
                self.status_tx.send_replace(ConnectionStatus::Closing);
            }
        }

        match err {
            Some(e) => error!("连接 {} 因错误关闭: {}", self.addr, e),
            None => debug!("连接 {} 正在关闭", self.addr),
        }

        if let Some(handle) = self.reconnect_task.lock().unwrap().take() {
            handle.abort();
        }
        self.detach_transport().await;
        // 停掉分发链路, 消息序列在消费完已送达的消息后终止
        *self.dispatch_tx.lock().unwrap() = None;
        if let Some(handle) = self.dispatch_task.lock().unwrap().take() {
            handle.abort();
        }

        self.status_tx.send_replace(ConnectionStatus::Closed);
        debug!("连接 {} 已关闭", self.addr);
    }
}

/// 消息分发任务: 把读循环中继来的消息送入有界通道。
/// 通道满时只有本任务挂起, 读循环仍可应答心跳、完成在途命令。
async fn dispatch_loop(
    mut relay_rx: mpsc::UnboundedReceiver<Message>,
    message_tx: mpsc::Sender<Message>,
) {
    while let Some(message) = relay_rx.recv().await {
        if message_tx.send(message).await.is_err() {
            return;
        }
    }
}

/// 读循环: 解码入站帧并分发。
/// 看门狗: 两倍心跳间隔内未收到任何帧即认定连接死亡。
async fn read_loop(inner: Weak<ConnectionInner>, mut read_half: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let error = 'outer: loop {
        let Some(conn) = inner.upgrade() else { return };

        let read = match conn.heartbeat_deadline() {
            Some(deadline) => match timeout(deadline, read_half.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break 'outer Error::Connection(format!("{} 心跳超时", conn.addr)),
            },
            None => read_half.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => break 'outer Error::Connection(format!("{} 对端关闭连接", conn.addr)),
            Ok(n) => n,
            Err(e) => break 'outer Error::Io(e),
        };

        decoder.feed(&buf[..n]);
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => {
                    if let Err(e) = conn.handle_frame(frame).await {
                        break 'outer e;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'outer e,
            }
        }
    };

    if let Some(conn) = inner.upgrade() {
        conn.on_transport_lost(error).await;
    }
}

/// 重连监督任务: 指数退避(带±20%抖动)重试, 直到重放成功或连接被关闭
async fn reconnect_loop(inner: Weak<ConnectionInner>) {
    let (initial, max) = match inner.upgrade() {
        Some(conn) => (
            conn.options.reconnect_initial_delay,
            conn.options.reconnect_max_delay,
        ),
        None => return,
    };

    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_multiplier(2.0)
        .with_randomization_factor(0.2)
        .with_max_elapsed_time(None)
        .build();

    loop {
        let delay = backoff.next_backoff().unwrap_or(max);
        tokio::time::sleep(delay).await;

        let Some(conn) = inner.upgrade() else { return };
        if conn.status().is_closed() {
            return;
        }

        match conn.replay().await {
            Ok(()) => {
                info!("重连到 {} 成功", conn.addr);
                conn.reconnect_task.lock().unwrap().take();
                return;
            }
            Err(e) => {
                warn!("重连到 {} 失败: {}", conn.addr, e);
            }
        }
    }
}
