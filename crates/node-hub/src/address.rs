use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use common::api::{AddressChangedPayload, CommandAction, NodeCommand};
use tracing::{debug, info, warn};

use crate::{
    registry::ConnectionRegistry,
    services::nodes::{IpFamily, NodeAddresses, NodeRepository},
    supervisor::BackgroundTasks,
};

/// Told about a node's new public address after it has been persisted.
#[async_trait]
pub trait AddressNotifier: Send + Sync {
    async fn address_changed(&self, node_id: i64, addresses: NodeAddresses) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressOutcome {
    Unchanged,
    Updated {
        family: IpFamily,
        previous: Option<String>,
        current: String,
    },
    /// Unspecified addresses carry no information.
    Ignored,
    NodeNotFound,
    Failed,
}

pub struct AddressChangeCoordinator {
    nodes: Arc<dyn NodeRepository>,
    notifier: Arc<dyn AddressNotifier>,
    tasks: BackgroundTasks,
}

impl AddressChangeCoordinator {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        notifier: Arc<dyn AddressNotifier>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            nodes,
            notifier,
            tasks,
        }
    }

    /// Compare the observed peer address with the stored one for its family.
    ///
    /// A change is written to the repository before the notification task is
    /// spawned; a failed notification leaves the stored address in place.
    pub async fn observe(&self, node_id: i64, observed: IpAddr) -> AddressOutcome {
        let ip = observed.to_canonical();
        if ip.is_unspecified() {
            return AddressOutcome::Ignored;
        }
        let family = if ip.is_ipv4() {
            IpFamily::V4
        } else {
            IpFamily::V6
        };
        let current = ip.to_string();

        let mut addresses = match self.nodes.addresses(node_id).await {
            Ok(Some(addresses)) => addresses,
            Ok(None) => {
                warn!(node_id, "address check for unknown node");
                return AddressOutcome::NodeNotFound;
            }
            Err(err) => {
                warn!(node_id, error = ?err, "failed to read stored node addresses");
                return AddressOutcome::Failed;
            }
        };

        let previous = addresses.get(family).map(str::to_string);
        if previous.as_deref() == Some(current.as_str()) {
            debug!(node_id, family = family.as_str(), "node address unchanged");
            return AddressOutcome::Unchanged;
        }

        if let Err(err) = self.nodes.update_address(node_id, family, &current).await {
            warn!(node_id, family = family.as_str(), error = ?err, "failed to persist node address");
            return AddressOutcome::Failed;
        }
        info!(
            node_id,
            family = family.as_str(),
            previous = previous.as_deref().unwrap_or("<unset>"),
            current = %current,
            "node public address changed"
        );

        addresses.set(family, current.clone());
        let notifier = self.notifier.clone();
        self.tasks.spawn("address_notify", async move {
            notifier.address_changed(node_id, addresses).await
        });

        AddressOutcome::Updated {
            family,
            previous,
            current,
        }
    }
}

/// Pushes `address_changed` commands to every other online node.
pub struct BroadcastAddressNotifier {
    registry: ConnectionRegistry,
}

impl BroadcastAddressNotifier {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl AddressNotifier for BroadcastAddressNotifier {
    async fn address_changed(&self, node_id: i64, addresses: NodeAddresses) -> anyhow::Result<()> {
        let command = NodeCommand::new(CommandAction::AddressChanged(AddressChangedPayload {
            node_id,
            ipv4: addresses.ipv4,
            ipv6: addresses.ipv6,
        }));
        let outcome = self
            .registry
            .broadcast_command(&command, |candidate| candidate != node_id)
            .await?;
        debug!(
            node_id,
            notified = outcome.notified,
            online = outcome.online,
            "address change broadcast"
        );
        Ok(())
    }
}
