use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// lookupd查询的默认超时
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// 向单个nsqlookupd查询主题的生产者列表。
///
/// 返回`host:port`形式的nsqd TCP地址集合; 404(主题不存在)视作正常,
/// 返回空集合。任何失败只影响本次查询, 不应污染调用方已有的生产者集合。
pub async fn lookup_topic(
    lookupd_addr: &str,
    topic: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let base = if lookupd_addr.starts_with("http://") || lookupd_addr.starts_with("https://") {
        lookupd_addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", lookupd_addr.trim_end_matches('/'))
    };
    let url = format!("{}/lookup?topic={}", base, topic);

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(&url).send().await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        // TOPIC_NOT_FOUND: 主题还没有生产者, 属正常情况
        debug!("lookupd {} 未找到主题 {}", lookupd_addr, topic);
        return Ok(Vec::new());
    }
    if !response.status().is_success() {
        return Err(Error::Lookup(format!(
            "lookupd {} 返回状态 {}",
            lookupd_addr,
            response.status()
        )));
    }

    let data: LookupResponse = response
        .json()
        .await
        .map_err(|e| Error::Lookup(format!("lookupd响应解析失败: {}", e)))?;

    Ok(data
        .producers
        .into_iter()
        .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
        .collect())
}
