use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use log::{error, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionOptions, MessageStream};
use crate::error::{Error, Result};
use crate::lookup::{self, DEFAULT_LOOKUP_TIMEOUT};
use crate::message::Message;
use crate::protocol;

/// 合并消息通道在max_in_flight之外的余量
const MERGE_CHANNEL_SLACK: usize = 16;

/// 消费者配置
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// 静态nsqd地址列表, 与lookupd_addresses二选一
    pub nsqd_addresses: Vec<String>,
    /// nsqlookupd地址列表, 开启周期性生产者发现
    pub lookupd_addresses: Vec<String>,
    /// 全局在途消息上限, RDY额度在所有连接间分配
    pub max_in_flight: u64,
    /// lookupd轮询间隔
    pub lookupd_poll_interval: Duration,
    /// 轮询间隔抖动系数(0-1)
    pub lookupd_poll_jitter: f64,
    /// 单次lookupd查询超时
    pub lookup_timeout: Duration,
    /// 低RDY轮转间隔(连接数超过max_in_flight时生效)
    pub low_rdy_idle_timeout: Duration,
    /// Handler处理失败时的默认重新入队延迟
    pub default_requeue_delay: Duration,
    /// 底层连接配置
    pub connection: ConnectionOptions,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            nsqd_addresses: vec![],
            lookupd_addresses: vec![],
            max_in_flight: 1,
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            low_rdy_idle_timeout: Duration::from_secs(10),
            default_requeue_delay: Duration::from_secs(90),
            connection: ConnectionOptions::default(),
        }
    }
}

/// 消息处理器, 供`Reader::run`驱动的消费循环使用
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_message(&self, message: &Message) -> Result<()>;
}

/// 消费者统计信息
#[derive(Debug, Clone, Default)]
pub struct ReaderStats {
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: usize,
}

struct ReaderConnection {
    conn: Connection,
    forwarder: JoinHandle<()>,
    /// 连续多少轮lookupd未报告该地址
    missed_polls: u32,
}

struct ReaderInner {
    topic: String,
    channel: String,
    config: ReaderConfig,
    connections: Mutex<HashMap<String, ReaderConnection>>,
    message_tx: StdMutex<Option<mpsc::Sender<Message>>>,
    message_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    rotation_offset: AtomicUsize,
    closed: AtomicBool,
    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
}

/// (topic, channel)的消费者。
///
/// 为每个发现的nsqd维护一条已订阅的连接, 将RDY额度分配到各连接,
/// 并把所有连接的消息公平合并为一个惰性序列。
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

/// 创建消费者并建立初始连接。
///
/// 配置了lookupd时, 启动时立即查询一次并开启周期性发现;
/// 配置静态nsqd列表时, 任一地址连接失败都会使创建失败。
pub async fn create_reader(topic: &str, channel: &str, config: ReaderConfig) -> Result<Reader> {
    if !protocol::is_valid_name(topic) {
        return Err(Error::Config(format!("非法主题名: {}", topic)));
    }
    if !protocol::is_valid_name(channel) {
        return Err(Error::Config(format!("非法频道名: {}", channel)));
    }
    if config.max_in_flight == 0 {
        return Err(Error::Config("max_in_flight至少为1".to_string()));
    }
    let has_nsqd = !config.nsqd_addresses.is_empty();
    let has_lookupd = !config.lookupd_addresses.is_empty();
    if has_nsqd == has_lookupd {
        return Err(Error::Config(
            "必须且只能配置nsqd_addresses或lookupd_addresses其中之一".to_string(),
        ));
    }

    let capacity = config.max_in_flight as usize + MERGE_CHANNEL_SLACK;
    let (tx, rx) = mpsc::channel(capacity);

    let inner = Arc::new(ReaderInner {
        topic: topic.to_string(),
        channel: channel.to_string(),
        config,
        connections: Mutex::new(HashMap::new()),
        message_tx: StdMutex::new(Some(tx)),
        message_rx: Mutex::new(Some(rx)),
        tasks: StdMutex::new(Vec::new()),
        rotation_offset: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        messages_received: AtomicU64::new(0),
        messages_finished: AtomicU64::new(0),
        messages_requeued: AtomicU64::new(0),
    });

    if has_nsqd {
        let addrs = inner.config.nsqd_addresses.clone();
        for addr in &addrs {
            if let Err(e) = inner.connect_to_nsqd(addr).await {
                // 静态列表要求全部可达, 失败时回收已建立的连接
                let mut connections = inner.connections.lock().await;
                for (_, rc) in connections.drain() {
                    rc.forwarder.abort();
                    let _ = rc.conn.close().await;
                }
                return Err(e);
            }
        }
        inner.redistribute_rdy().await;
    } else {
        inner.poll_lookupd_once().await;
        let handle = tokio::spawn(discovery_loop(Arc::downgrade(&inner)));
        inner.tasks.lock().unwrap().push(handle);
    }

    let handle = tokio::spawn(rotation_loop(Arc::downgrade(&inner)));
    inner.tasks.lock().unwrap().push(handle);

    Ok(Reader { inner })
}

impl Reader {
    /// 所有连接的消息公平合并后的惰性序列, Reader关闭后终止
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

    /// 等待下一条消息; Reader关闭后返回None
    pub async fn wait_for_message(&self) -> Option<Message> {
        let mut rx = self.inner.message_rx.lock().await;
        match rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Handler驱动的消费循环: 处理成功FIN, 失败则按默认延迟REQ
    pub async fn run<H: Handler>(&self, handler: H) -> Result<()> {
        let requeue_delay = self.inner.config.default_requeue_delay.as_millis() as u64;
        while let Some(message) = self.wait_for_message().await {
            match handler.handle_message(&message).await {
                Ok(()) => match message.fin().await {
                    Ok(()) => {
                        self.inner.messages_finished.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("FIN消息 {} 失败: {}", message.id(), e),
                },
                Err(e) => {
                    warn!("处理消息 {} 失败: {}", message.id(), e);
                    match message.req(requeue_delay).await {
                        Ok(()) => {
                            self.inner.messages_requeued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!("REQ消息 {} 失败: {}", message.id(), e),
                    }
                }
            }
        }
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// 当前生产者集合(按地址排序)
    pub async fn connection_addresses(&self) -> Vec<String> {
        let connections = self.inner.connections.lock().await;
        let mut addrs: Vec<String> = connections.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn stats(&self) -> ReaderStats {
        ReaderStats {
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            messages_finished: self.inner.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.inner.messages_requeued.load(Ordering::Relaxed),
            connections: self.inner.connections.lock().await.len(),
        }
    }

    /// 关闭消费者: 停止发现与轮转任务, 关闭全部连接, 终止消息序列
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.inner.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }

        let mut connections = self.inner.connections.lock().await;
        for (addr, rc) in connections.drain() {
            rc.forwarder.abort();
            if let Err(e) = rc.conn.close().await {
                warn!("关闭到 {} 的连接失败: {}", addr, e);
            }
        }
        drop(connections);

        *self.inner.message_tx.lock().unwrap() = None;
        info!("消费者已关闭 (topic={}, channel={})", self.inner.topic, self.inner.channel);
    }
}

impl ReaderInner {
    /// 连接到nsqd、订阅并启动消息转发任务
    async fn connect_to_nsqd(self: &Arc<Self>, addr: &str) -> Result<()> {
        {
            let connections = self.connections.lock().await;
            if connections.contains_key(addr) {
                return Ok(());
            }
        }

        // 订阅以RDY 0起步, 额度由redistribute_rdy统一分配;
        // 通道边界必须跟随之后可能被提升到的max_in_flight, 而非初始RDY
        let mut options = self.config.connection.clone();
        options.message_channel_bound = Some(self.config.max_in_flight);
        let conn = Connection::open(addr, options).await?;
        conn.subscribe(&self.topic, &self.channel, 0).await?;

        // 转发任务: 把该连接的消息汇入共享通道, 实现公平合并
        let forwarder = {
            let conn = conn.clone();
            let tx = self.message_tx.lock().unwrap().clone();
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let Some(tx) = tx else { return };
                loop {
                    match conn.wait_for_message().await {
                        Some(message) => {
                            if let Some(inner) = weak.upgrade() {
                                inner.messages_received.fetch_add(1, Ordering::Relaxed);
                            }
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            })
        };

        let mut connections = self.connections.lock().await;
        connections.insert(
            addr.to_string(),
            ReaderConnection {
                conn,
                forwarder,
                missed_polls: 0,
            },
        );
        info!("已连接到nsqd {}", addr);
        Ok(())
    }

    /// 查询全部lookupd一次并收敛生产者集合
    async fn poll_lookupd_once(self: &Arc<Self>) {
        let mut discovered: BTreeSet<String> = BTreeSet::new();
        let mut any_ok = false;
        for lookupd in &self.config.lookupd_addresses {
            match lookup::lookup_topic(lookupd, &self.topic, self.config.lookup_timeout).await {
                Ok(addrs) => {
                    any_ok = true;
                    discovered.extend(addrs);
                }
                Err(e) => warn!("查询lookupd {} 失败: {}", lookupd, e),
            }
        }
        if !any_ok {
            // 全部lookupd失败时保留现有生产者集合, 不终止消费
            warn!("本轮所有lookupd查询均失败, 保留现有生产者集合");
            return;
        }

        for addr in &discovered {
            let known = self.connections.lock().await.contains_key(addr);
            if !known {
                if let Err(e) = self.connect_to_nsqd(addr).await {
                    error!("连接新发现的nsqd {} 失败: {}", addr, e);
                }
            }
        }

        // 消失的生产者先标记, 连续第二轮缺席才关闭,
        // 避免lookupd瞬时故障造成连接抖动
        let mut removed = Vec::new();
        {
            let mut connections = self.connections.lock().await;
            let mut to_close = Vec::new();
            for (addr, rc) in connections.iter_mut() {
                if discovered.contains(addr) {
                    rc.missed_polls = 0;
                } else {
                    rc.missed_polls += 1;
                    if rc.missed_polls > 1 {
                        to_close.push(addr.clone());
                    }
                }
            }
            for addr in to_close {
                if let Some(rc) = connections.remove(&addr) {
                    removed.push((addr, rc));
                }
            }
        }
        for (addr, rc) in removed {
            info!("生产者 {} 已从lookupd消失, 关闭连接", addr);
            rc.forwarder.abort();
            if let Err(e) = rc.conn.close().await {
                warn!("关闭到 {} 的连接失败: {}", addr, e);
            }
        }

        self.redistribute_rdy().await;
    }

    /// 将max_in_flight的RDY额度分配到当前所有连接
    async fn redistribute_rdy(&self) {
        let connections = self.connections.lock().await;
        let n = connections.len();
        if n == 0 {
            return;
        }

        let mut addrs: Vec<&String> = connections.keys().collect();
        addrs.sort();
        let offset = self.rotation_offset.load(Ordering::Relaxed);
        let assignments = distribute_rdy(self.config.max_in_flight, n, offset);

        for (addr, rdy) in addrs.iter().zip(assignments) {
            if let Some(rc) = connections.get(*addr) {
                if let Err(e) = rc.conn.rdy(rdy).await {
                    warn!("设置 {} 的RDY失败: {}", addr, e);
                }
            }
        }
    }

    /// 带抖动的轮询间隔: interval * (1 ± jitter)
    fn jittered_poll_interval(&self) -> Duration {
        let base = self.config.lookupd_poll_interval.as_secs_f64();
        let jitter = self.config.lookupd_poll_jitter;
        let factor = 1.0 + jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((base * factor).max(0.01))
    }
}

/// RDY分配: N不超过max_in_flight时按floor均分、余数给前几个;
/// N超过max_in_flight时采用低RDY轮转, 大小为max_in_flight的子集
/// 持有RDY=1, 其余为0, offset推进使所有生产者轮流获得投递机会。
fn distribute_rdy(max_in_flight: u64, n: usize, offset: usize) -> Vec<u64> {
    if n as u64 <= max_in_flight {
        let base = max_in_flight / n as u64;
        let remainder = max_in_flight % n as u64;
        (0..n as u64)
            .map(|i| base + u64::from(i < remainder))
            .collect()
    } else {
        (0..n)
            .map(|i| {
                let position = (i + n - offset % n) % n;
                u64::from((position as u64) < max_in_flight)
            })
            .collect()
    }
}

/// 周期性生产者发现任务
async fn discovery_loop(inner: Weak<ReaderInner>) {
    loop {
        let interval = {
            let Some(inner) = inner.upgrade() else { return };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            inner.jittered_poll_interval()
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = inner.upgrade() else { return };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.poll_lookupd_once().await;
    }
}

/// 低RDY轮转任务: 连接数超过max_in_flight时周期性推进轮转偏移
async fn rotation_loop(inner: Weak<ReaderInner>) {
    loop {
        let interval = {
            let Some(inner) = inner.upgrade() else { return };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            inner.config.low_rdy_idle_timeout
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = inner.upgrade() else { return };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let n = inner.connections.lock().await.len();
        if n > 0 && (n as u64) > inner.config.max_in_flight {
            inner.rotation_offset.fetch_add(1, Ordering::Relaxed);
            inner.redistribute_rdy().await;
        }
    }
}
