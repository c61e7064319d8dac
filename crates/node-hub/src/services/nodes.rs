use async_trait::async_trait;

use crate::persistence::{self as db, nodes as node_store, NodeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl NodeAddresses {
    pub fn get(&self, family: IpFamily) -> Option<&str> {
        match family {
            IpFamily::V4 => self.ipv4.as_deref(),
            IpFamily::V6 => self.ipv6.as_deref(),
        }
    }

    pub fn set(&mut self, family: IpFamily, value: String) {
        match family {
            IpFamily::V4 => self.ipv4 = Some(value),
            IpFamily::V6 => self.ipv6 = Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAgentInfo {
    pub node_id: i64,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
}

impl From<&NodeRecord> for NodeAgentInfo {
    fn from(record: &NodeRecord) -> Self {
        Self {
            node_id: record.id,
            version: record.agent_version.clone(),
            platform: record.platform.clone(),
            arch: record.arch.clone(),
        }
    }
}

/// Node records as seen by the address and update coordinators.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn addresses(&self, node_id: i64) -> anyhow::Result<Option<NodeAddresses>>;
    async fn update_address(&self, node_id: i64, family: IpFamily, value: &str)
        -> anyhow::Result<()>;
    async fn agent_info(&self, node_id: i64) -> anyhow::Result<Option<NodeAgentInfo>>;
    /// Missing ids are omitted.
    async fn agent_infos(&self, node_ids: &[i64]) -> anyhow::Result<Vec<NodeAgentInfo>>;
    /// At most `limit` ids in ascending order.
    async fn list_node_ids(&self, limit: usize) -> anyhow::Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct SqliteNodeRepository {
    db: db::Db,
}

impl SqliteNodeRepository {
    pub fn new(db: db::Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn addresses(&self, node_id: i64) -> anyhow::Result<Option<NodeAddresses>> {
        Ok(node_store::get_node(&self.db, node_id)
            .await?
            .map(|record| NodeAddresses {
                ipv4: record.ipv4,
                ipv6: record.ipv6,
            }))
    }

    async fn update_address(
        &self,
        node_id: i64,
        family: IpFamily,
        value: &str,
    ) -> anyhow::Result<()> {
        let updated = match family {
            IpFamily::V4 => node_store::update_ipv4(&self.db, node_id, value).await?,
            IpFamily::V6 => node_store::update_ipv6(&self.db, node_id, value).await?,
        };
        if !updated {
            anyhow::bail!("node {node_id} not found");
        }
        Ok(())
    }

    async fn agent_info(&self, node_id: i64) -> anyhow::Result<Option<NodeAgentInfo>> {
        Ok(node_store::get_node(&self.db, node_id)
            .await?
            .as_ref()
            .map(NodeAgentInfo::from))
    }

    async fn agent_infos(&self, node_ids: &[i64]) -> anyhow::Result<Vec<NodeAgentInfo>> {
        let records = node_store::list_nodes_by_ids(&self.db, node_ids).await?;
        Ok(records.iter().map(NodeAgentInfo::from).collect())
    }

    async fn list_node_ids(&self, limit: usize) -> anyhow::Result<Vec<i64>> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let records = node_store::list_nodes(&self.db, limit).await?;
        Ok(records.into_iter().map(|record| record.id).collect())
    }
}
