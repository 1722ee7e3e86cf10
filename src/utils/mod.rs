//! 工具函数模块

use std::collections::HashSet;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{MeshError, Result};

/// 探测本机对外地址
///
/// 通过 UDP "连接" 一个公网地址让内核选路，不会真正发包。失败时回落到回环地址。
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// 集合差异：`(新增, 移除)`
///
/// 新增保持 `next` 中的顺序，移除保持 `prev` 中的顺序
pub fn diff<T>(prev: &[T], next: &[T]) -> (Vec<T>, Vec<T>)
where
    T: Eq + Hash + Clone,
{
    let prev_set: HashSet<&T> = prev.iter().collect();
    let next_set: HashSet<&T> = next.iter().collect();
    let added = next
        .iter()
        .filter(|item| !prev_set.contains(item))
        .cloned()
        .collect();
    let removed = prev
        .iter()
        .filter(|item| !next_set.contains(item))
        .cloned()
        .collect();
    (added, removed)
}

/// 等待服务启动就绪（通过 TCP 连接重试）
///
/// 使用指数退避策略重试连接，直到服务真正可以接受连接，
/// 注册到注册中心之前调用，避免把尚未监听的地址暴露给调用方。
pub async fn wait_for_server_ready(address: SocketAddr) -> Result<()> {
    const MAX_RETRIES: u32 = 30;
    const INITIAL_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 500;

    let start = std::time::Instant::now();
    let mut delay_ms = INITIAL_DELAY_MS;

    for attempt in 1..=MAX_RETRIES {
        match timeout(Duration::from_millis(100), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address = %address, attempt, error = %e, "Connection attempt failed, retrying...");
            }
            Err(_) => {
                debug!(address = %address, attempt, "Connection attempt timed out, retrying...");
            }
        }

        sleep(Duration::from_millis(delay_ms)).await;
        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }

    Err(MeshError::unavailable(format!(
        "server {} not ready after {} attempts",
        address, MAX_RETRIES
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff() {
        let prev = vec!["a", "b", "c"];
        let next = vec!["b", "c", "d", "e"];
        let (added, removed) = diff(&prev, &next);
        assert_eq!(added, vec!["d", "e"]);
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let set = vec![1, 2, 3];
        let (added, removed) = diff(&set, &set);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_local_ip_never_unspecified() {
        assert!(!local_ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_wait_for_listening_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio_test::assert_ok!(wait_for_server_ready(addr).await);
    }

    #[test]
    fn test_wait_for_closed_port_fails() {
        let addr = tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        });
        // 监听器已释放，端口不可连接
        let result = tokio_test::block_on(wait_for_server_ready(addr));
        tokio_test::assert_err!(result);
    }
}
