mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use nsq_client_rs::{create_reader, ConnectionOptions, Handler, Message, ReaderConfig, Result};
use tokio::time::timeout;

fn reader_connection_options() -> ConnectionOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    ConnectionOptions {
        auto_reconnect: false,
        ..ConnectionOptions::default()
    }
}

/// 脚本化nsqd: 等待SUB与非零RDY后投递两条消息, 再收取两条FIN
fn spawn_two_message_nsqd(
    listener: tokio::net::TcpListener,
    topic: &'static str,
    channel: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = common::accept_and_handshake(&listener).await;
        let (line, _) = common::read_command(&mut stream).await;
        assert_eq!(line, format!("SUB {} {}", topic, channel));
        common::send_response(&mut stream, b"OK").await;

        // 订阅时的RDY 0与重分配的RDY更新都可能先到, 等到非零额度再投递
        loop {
            let (line, _) = common::read_command(&mut stream).await;
            if let Some(count) = line.strip_prefix("RDY ") {
                if count.parse::<u64>().unwrap() > 0 {
                    break;
                }
            }
        }

        common::send_message(&mut stream, 1700000000000000000, 1, "aaaaaaaaaaaaaaaa", b"m1").await;
        common::send_message(&mut stream, 1700000000000000001, 1, "bbbbbbbbbbbbbbbb", b"m2").await;

        let mut fins = Vec::new();
        while fins.len() < 2 {
            let Some((line, _)) = common::try_read_command(&mut stream).await else {
                panic!("连接在收到全部FIN前断开");
            };
            if let Some(id) = line.strip_prefix("FIN ") {
                fins.push(id.to_string());
            }
            // RDY更新可能穿插到达, 忽略
        }
        fins.sort();
        assert_eq!(fins, vec!["aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb"]);
    })
}

#[tokio::test]
async fn test_static_reader_receives_and_fins() {
    let (listener, addr) = common::bind().await;
    let server = spawn_two_message_nsqd(listener, "orders", "work");

    let config = ReaderConfig {
        nsqd_addresses: vec![addr],
        max_in_flight: 2,
        connection: reader_connection_options(),
        ..ReaderConfig::default()
    };
    let reader = create_reader("orders", "work", config).await.unwrap();

    let mut messages = reader.messages();
    let first = timeout(Duration::from_secs(2), messages.next())
        .await
        .unwrap()
        .expect("应收到第一条消息");
    let second = timeout(Duration::from_secs(2), messages.next())
        .await
        .unwrap()
        .expect("应收到第二条消息");

    // 同一连接上的消息保持服务器投递顺序
    assert_eq!(first.body(), b"m1");
    assert_eq!(second.body(), b"m2");

    first.fin().await.unwrap();
    second.fin().await.unwrap();
    server.await.unwrap();

    let stats = reader.stats().await;
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.connections, 1);

    reader.close().await;
    // 关闭后消息序列终止
    assert!(timeout(Duration::from_secs(1), messages.next())
        .await
        .unwrap()
        .is_none());
}

struct CollectingHandler {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl Handler for CollectingHandler {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        self.bodies.lock().unwrap().push(message.body().to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_run_loop_fins_messages() {
    let (listener, addr) = common::bind().await;
    let server = spawn_two_message_nsqd(listener, "orders", "work");

    let config = ReaderConfig {
        nsqd_addresses: vec![addr],
        max_in_flight: 2,
        connection: reader_connection_options(),
        ..ReaderConfig::default()
    };
    let reader = create_reader("orders", "work", config).await.unwrap();

    let bodies = Arc::new(Mutex::new(Vec::new()));
    let run_task = {
        let reader = reader.clone();
        let bodies = Arc::clone(&bodies);
        tokio::spawn(async move { reader.run(CollectingHandler { bodies }).await })
    };

    // 服务器收到两条FIN即说明Handler循环完成了确认
    server.await.unwrap();
    reader.close().await;
    run_task.await.unwrap().unwrap();

    let bodies = bodies.lock().unwrap();
    assert_eq!(*bodies, vec![b"m1".to_vec(), b"m2".to_vec()]);
    let stats = reader.stats().await;
    assert_eq!(stats.messages_finished, 2);
}

#[tokio::test]
async fn test_large_max_in_flight_flows_through() {
    let (listener, addr) = common::bind().await;

    let server = tokio::spawn(async move {
        let mut stream = common::accept_and_handshake(&listener).await;
        let (line, _) = common::read_command(&mut stream).await;
        assert_eq!(line, "SUB orders work");
        common::send_response(&mut stream, b"OK").await;

        // RDY额度应被提升到完整的max_in_flight
        loop {
            let (line, _) = common::read_command(&mut stream).await;
            if let Some(count) = line.strip_prefix("RDY ") {
                let count: u64 = count.parse().unwrap();
                if count > 0 {
                    assert_eq!(count, 100);
                    break;
                }
            }
        }

        for i in 0..100u32 {
            let id = format!("{:016x}", i);
            common::send_message(&mut stream, 1700000000000000000 + i as i64, 1, &id, b"bulk")
                .await;
        }
        // 整批投递后读循环仍需及时应答心跳
        common::send_heartbeat(&mut stream).await;
        let (line, _) = timeout(Duration::from_millis(500), common::read_command(&mut stream))
            .await
            .expect("批量投递后NOP未及时到达");
        assert_eq!(line, "NOP");
        stream
    });

    let config = ReaderConfig {
        nsqd_addresses: vec![addr],
        max_in_flight: 100,
        connection: reader_connection_options(),
        ..ReaderConfig::default()
    };
    let reader = create_reader("orders", "work", config).await.unwrap();

    let mut messages = reader.messages();
    for _ in 0..100 {
        let message = timeout(Duration::from_secs(2), messages.next())
            .await
            .unwrap()
            .expect("大额度下全部消息都应可消费");
        assert_eq!(message.body(), b"bulk");
    }

    server.await.unwrap();
    reader.close().await;
}

#[tokio::test]
async fn test_lookupd_discovery_and_retirement_grace() {
    // nsqd A与B
    let (listener_a, addr_a) = common::bind().await;
    let (listener_b, addr_b) = common::bind().await;
    let _nsqd_a = common::spawn_quiet_nsqd(listener_a);
    let _nsqd_b = common::spawn_quiet_nsqd(listener_b);

    // 两个lookupd: 并集为{A, B}
    let producers_1 = Arc::new(Mutex::new(vec![addr_a.clone()]));
    let producers_2 = Arc::new(Mutex::new(vec![addr_a.clone(), addr_b.clone()]));
    let (lookupd_1, lookupd_addr_1) = common::bind().await;
    let (lookupd_2, lookupd_addr_2) = common::bind().await;
    let _lookupd_a = common::spawn_mock_lookupd(lookupd_1, Arc::clone(&producers_1));
    let _lookupd_b = common::spawn_mock_lookupd(lookupd_2, Arc::clone(&producers_2));

    let config = ReaderConfig {
        lookupd_addresses: vec![lookupd_addr_1, lookupd_addr_2],
        max_in_flight: 2,
        lookupd_poll_interval: Duration::from_millis(400),
        lookupd_poll_jitter: 0.0,
        connection: reader_connection_options(),
        ..ReaderConfig::default()
    };
    let reader = create_reader("orders", "work", config).await.unwrap();

    let mut expected: Vec<String> = vec![addr_a.clone(), addr_b.clone()];
    expected.sort();
    assert_eq!(reader.connection_addresses().await, expected);

    // B从所有lookupd消失: 第一轮缺席只标记(宽限), 第二轮才关闭
    *producers_2.lock().unwrap() = vec![addr_a.clone()];
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        reader.connection_addresses().await,
        expected,
        "消失后的第一轮轮询内不应关闭连接"
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let addrs = reader.connection_addresses().await;
        if addrs == vec![addr_a.clone()] {
            break;
        }
        assert!(Instant::now() < deadline, "宽限期后连接B仍未关闭: {:?}", addrs);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    reader.close().await;
}

#[tokio::test]
async fn test_reader_config_validation() {
    // nsqd与lookupd地址不能同时为空
    let result = create_reader("t", "c", ReaderConfig::default()).await;
    assert!(result.is_err());

    // 也不能同时配置
    let config = ReaderConfig {
        nsqd_addresses: vec!["127.0.0.1:4150".to_string()],
        lookupd_addresses: vec!["127.0.0.1:4161".to_string()],
        ..ReaderConfig::default()
    };
    assert!(create_reader("t", "c", config).await.is_err());

    // 非法主题名
    let config = ReaderConfig {
        nsqd_addresses: vec!["127.0.0.1:4150".to_string()],
        ..ReaderConfig::default()
    };
    assert!(create_reader("bad topic", "c", config).await.is_err());
}
