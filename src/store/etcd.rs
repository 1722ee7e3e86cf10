//! etcd 协调存储

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tracing::{debug, info};

use super::{CoordinationStore, EventType, KeyValue, WatchEvent, WatchStream};
use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};

/// etcd v3 协调存储
///
/// `Client` 内部是共享的 gRPC 通道，每次调用克隆一份即可
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// 按注册中心配置连接 etcd
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let endpoints = config.endpoints()?;

        let mut options = ConnectOptions::new().with_connect_timeout(config.call_timeout());
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(|e| MeshError::config(format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()> {
        let mut client = self.client.clone();
        let opts = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, opts).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?;
        Ok(lease.id())
    }

    async fn lease_keep_alive_once(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        // 建立流时已经发出第一次续约请求，只需读取一次响应
        let (_keeper, mut stream) = client.lease_keep_alive(lease).await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                debug!(lease_id = lease, ttl = resp.ttl(), "Lease keep-alive successful");
                Ok(())
            }
            Some(_) => Err(MeshError::unavailable(format!("lease {:x} expired", lease))),
            None => Err(MeshError::unavailable("lease keep-alive stream closed")),
        }
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        // watcher 必须与流一起存活，否则服务端会取消订阅
        let events = futures::stream::unfold(
            (watcher, stream),
            |(watcher, mut stream)| async move {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        let batch: Vec<WatchEvent> = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let key = String::from_utf8_lossy(kv.key()).to_string();
                                Some(match event.event_type() {
                                    etcd_client::EventType::Put => WatchEvent {
                                        event_type: EventType::Put,
                                        key,
                                        value: kv.value().to_vec(),
                                    },
                                    etcd_client::EventType::Delete => WatchEvent::delete(key),
                                })
                            })
                            .collect();
                        Some((Ok(batch), (watcher, stream)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(MeshError::from(e)), (watcher, stream))),
                }
            },
        );

        Ok(Box::pin(events))
    }
}
