mod common;

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use nsq_client_rs::{create_writer, ConnectionOptions, Error, ProtocolError, WriterConfig};

/// 返回一个必然拒绝连接的地址
async fn refused_addr() -> String {
    let (listener, addr) = common::bind().await;
    drop(listener);
    addr
}

fn writer_config(addrs: Vec<String>) -> WriterConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    WriterConfig {
        nsqd_addresses: addrs,
        connection: ConnectionOptions {
            auto_reconnect: false,
            dial_timeout: Duration::from_secs(1),
            ..ConnectionOptions::default()
        },
    }
}

#[tokio::test]
async fn test_publish_falls_back_to_next_address() {
    let bad = refused_addr().await;
    let (listener, good) = common::bind().await;

    let server = tokio::spawn(async move {
        let mut stream = common::accept_and_handshake(&listener).await;
        let (line, body) = common::read_command(&mut stream).await;
        assert_eq!(line, "PUB test_topic");
        assert_eq!(body.unwrap(), b"hello");
        common::send_response(&mut stream, b"OK").await;
        stream
    });

    // 第一个地址拒绝连接, 发布应落到第二个地址且不报错
    let writer = create_writer(writer_config(vec![bad, good])).unwrap();
    writer.publish("test_topic", "hello").await.unwrap();
    assert_eq!(writer.connection_count(), 1);

    server.await.unwrap();
    writer.close().await;
}

#[tokio::test]
async fn test_all_addresses_failing_reports_no_connections() {
    let writer = create_writer(writer_config(vec![
        refused_addr().await,
        refused_addr().await,
    ]))
    .unwrap();

    let result = writer.publish("test_topic", "hello").await;
    assert!(matches!(result, Err(Error::NoConnections)));
}

#[tokio::test]
async fn test_server_error_propagates_to_publisher() {
    let (listener, addr) = common::bind().await;

    let server = tokio::spawn(async move {
        let mut stream = common::accept_and_handshake(&listener).await;
        let (line, _) = common::read_command(&mut stream).await;
        assert_eq!(line, "PUB test_topic");
        common::send_error(&mut stream, b"E_BAD_TOPIC PUB failed").await;
        stream
    });

    let writer = create_writer(writer_config(vec![addr])).unwrap();
    match writer.publish("test_topic", "hello").await {
        Err(Error::Protocol(ProtocolError::Server(text))) => {
            assert!(text.contains("E_BAD_TOPIC"));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_mpub_and_dpub_encoding() {
    let (listener, addr) = common::bind().await;

    let server = tokio::spawn(async move {
        let mut stream = common::accept_and_handshake(&listener).await;

        let (line, body) = common::read_command(&mut stream).await;
        assert_eq!(line, "MPUB test_topic");
        let body = body.unwrap();
        // MPUB体: 4字节消息数, 之后每条消息带4字节长度前缀
        let count = BigEndian::read_u32(&body[0..4]);
        assert_eq!(count, 2);
        let first_len = BigEndian::read_u32(&body[4..8]) as usize;
        assert_eq!(&body[8..8 + first_len], b"one");
        common::send_response(&mut stream, b"OK").await;

        let (line, body) = common::read_command(&mut stream).await;
        assert_eq!(line, "DPUB test_topic 1500");
        assert_eq!(body.unwrap(), b"later");
        common::send_response(&mut stream, b"OK").await;
        stream
    });

    let writer = create_writer(writer_config(vec![addr])).unwrap();
    writer
        .publish_multi("test_topic", vec!["one", "two"])
        .await
        .unwrap();
    writer
        .publish_delayed("test_topic", "later", Duration::from_millis(1500))
        .await
        .unwrap();

    server.await.unwrap();
    writer.close().await;
}

#[tokio::test]
async fn test_empty_batch_is_ignored() {
    let writer = create_writer(writer_config(vec![refused_addr().await])).unwrap();
    // 空批量不触网, 直接成功
    writer
        .publish_multi("test_topic", Vec::<&[u8]>::new())
        .await
        .unwrap();
    assert_eq!(writer.connection_count(), 0);
}

#[tokio::test]
async fn test_writer_rejects_empty_address_list() {
    assert!(create_writer(WriterConfig::default()).is_err());
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let (listener, addr) = common::bind().await;
    let _server = common::spawn_quiet_nsqd(listener);

    let writer = create_writer(writer_config(vec![addr])).unwrap();
    writer.close().await;
    assert!(matches!(
        writer.publish("test_topic", "x").await,
        Err(Error::ConnectionClosed)
    ));
}
