//! 拓扑快照
//!
//! 服务名到 [`Service`] 的映射，既可以由全量扫描重建，也可以增量应用变更事件。
//! 两种方式对同一份最终存储状态得到相同结果。

use std::collections::HashMap;
use tracing::{debug, warn};

use super::node::{Node, Service, parse_node_key};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    services: HashMap<String, Service>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从前缀扫描结果重建
    ///
    /// 服务名取自 key，value 无法解析的记录直接跳过
    pub fn from_scan<'a, I>(kvs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut topology = Self::new();
        for (key, value) in kvs {
            let Some((service_name, _)) = parse_node_key(key) else {
                debug!(key, "Skip key outside service layout");
                continue;
            };
            match serde_json::from_slice::<Node>(value) {
                Ok(node) => topology.upsert(service_name, node),
                Err(e) => warn!(key, error = %e, "Skip undecodable node record"),
            }
        }
        topology
    }

    /// 应用一条 PUT 事件
    pub fn apply_put(&mut self, key: &str, value: &[u8]) -> bool {
        let Some((service_name, _)) = parse_node_key(key) else {
            return false;
        };
        match serde_json::from_slice::<Node>(value) {
            Ok(node) => {
                self.upsert(service_name, node);
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Ignore undecodable put event");
                false
            }
        }
    }

    /// 应用一条 DELETE 事件，节点清空的服务整体移除
    pub fn apply_delete(&mut self, key: &str) -> bool {
        let Some((service_name, node_id)) = parse_node_key(key) else {
            return false;
        };
        let Some(service) = self.services.get_mut(service_name) else {
            return false;
        };
        let before = service.nodes.len();
        service.nodes.retain(|n| n.id != node_id);
        let removed = service.nodes.len() != before;
        if service.is_empty() {
            self.services.remove(service_name);
        }
        removed
    }

    /// 同一个 ID 原位替换，否则追加
    fn upsert(&mut self, service_name: &str, node: Node) {
        let service = self
            .services
            .entry(service_name.to_string())
            .or_insert_with(|| Service::new(service_name));
        match service.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => service.nodes.push(node),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// 以节点集合比较，忽略节点顺序
    pub fn same_members(&self, other: &Topology) -> bool {
        if self.names() != other.names() {
            return false;
        }
        self.services.iter().all(|(name, service)| {
            let Some(theirs) = other.services.get(name) else {
                return false;
            };
            let mut a: Vec<&Node> = service.nodes.iter().collect();
            let mut b: Vec<&Node> = theirs.nodes.iter().collect();
            a.sort_by(|x, y| x.id.cmp(&y.id));
            b.sort_by(|x, y| x.id.cmp(&y.id));
            a == b
        })
    }
}
