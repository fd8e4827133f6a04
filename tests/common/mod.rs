//! 测试用的nsqd/nsqlookupd模拟服务器
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const IDENTIFY_RESPONSE: &[u8] = br#"{"max_rdy_count":2500,"max_msg_timeout":900000,"msg_timeout":60000,"heartbeat_interval":30000,"auth_required":false}"#;

/// 绑定一个临时端口
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// 接受一条连接并完成服务器侧握手
pub async fn accept_and_handshake(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    handshake(&mut stream).await;
    stream
}

/// 服务器侧握手: 校验魔术字, 读取IDENTIFY, 回复协商结果
pub async fn handshake(stream: &mut TcpStream) {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await.unwrap();
    assert_eq!(&magic, b"  V2");

    let (line, body) = read_command(stream).await;
    assert_eq!(line, "IDENTIFY");
    assert!(body.is_some());
    send_response(stream, IDENTIFY_RESPONSE).await;
}

/// 读取一条客户端命令: 动词行, 以及带长度前缀的消息体(若有)
pub async fn read_command(stream: &mut TcpStream) -> (String, Option<Vec<u8>>) {
    try_read_command(stream).await.expect("连接意外关闭")
}

/// 容错版本: 客户端断开时返回None
pub async fn try_read_command(stream: &mut TcpStream) -> Option<(String, Option<Vec<u8>>)> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).await.is_err() {
            return None;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    let line = String::from_utf8(line).unwrap();
    let verb = line.split(' ').next().unwrap_or("").to_string();

    let body = match verb.as_str() {
        "IDENTIFY" | "PUB" | "DPUB" | "MPUB" | "AUTH" => {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return None;
            }
            let len = BigEndian::read_u32(&len_buf) as usize;
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).await.is_err() {
                return None;
            }
            Some(body)
        }
        _ => None,
    };
    Some((line, body))
}

pub async fn send_frame(stream: &mut TcpStream, frame_type: i32, payload: &[u8]) {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32 + 4).to_be_bytes());
    buf.extend_from_slice(&frame_type.to_be_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

pub async fn send_response(stream: &mut TcpStream, body: &[u8]) {
    send_frame(stream, 0, body).await;
}

pub async fn send_error(stream: &mut TcpStream, body: &[u8]) {
    send_frame(stream, 1, body).await;
}

pub async fn send_heartbeat(stream: &mut TcpStream) {
    send_frame(stream, 0, b"_heartbeat_").await;
}

pub async fn send_message(
    stream: &mut TcpStream,
    timestamp: i64,
    attempts: u16,
    id: &str,
    body: &[u8],
) {
    assert_eq!(id.len(), 16);
    let mut payload = Vec::new();
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&attempts.to_be_bytes());
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(body);
    send_frame(stream, 2, &payload).await;
}

/// 运行一个最小nsqd: 接受任意数量的连接, SUB回OK, CLS回CLOSE_WAIT, 其余命令忽略
pub fn spawn_quiet_nsqd(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut magic = [0u8; 4];
                if stream.read_exact(&mut magic).await.is_err() {
                    return;
                }
                match try_read_command(&mut stream).await {
                    Some((line, _)) if line == "IDENTIFY" => {
                        send_response(&mut stream, IDENTIFY_RESPONSE).await;
                    }
                    _ => return,
                }
                while let Some((line, _)) = try_read_command(&mut stream).await {
                    if line.starts_with("SUB ") {
                        send_response(&mut stream, b"OK").await;
                    } else if line == "CLS" {
                        send_response(&mut stream, b"CLOSE_WAIT").await;
                        return;
                    }
                }
            });
        }
    })
}

/// 运行一个最小nsqlookupd: 对每个HTTP请求返回当前producers列表
pub fn spawn_mock_lookupd(
    listener: TcpListener,
    producers: Arc<Mutex<Vec<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let snapshot = producers.lock().unwrap().clone();
            let body = lookupd_body(&snapshot);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    })
}

fn lookupd_body(producers: &[String]) -> String {
    let items: Vec<String> = producers
        .iter()
        .map(|addr| {
            let (host, port) = addr.rsplit_once(':').unwrap();
            format!(
                r#"{{"broadcast_address":"{}","tcp_port":{},"http_port":0}}"#,
                host, port
            )
        })
        .collect();
    format!(r#"{{"producers":[{}]}}"#, items.join(","))
}
