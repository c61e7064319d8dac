//! Shared API DTOs used by the node hub and the node agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `type` value of an agent status frame.
pub const FRAME_STATUS: &str = "status";
/// `type` value of an agent heartbeat frame.
pub const FRAME_HEARTBEAT: &str = "heartbeat";
/// `type` value of an agent event frame.
pub const FRAME_EVENT: &str = "event";
/// `event_type` value of a traffic usage event.
pub const EVENT_TRAFFIC: &str = "traffic";

/// Per-subscription traffic counters reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    /// Public subscription identifier (SID). Absent means empty, which is skipped.
    #[serde(default)]
    pub subscription_id: String,
    /// Uploaded bytes since the previous report.
    #[serde(default)]
    pub upload: i64,
    /// Downloaded bytes since the previous report.
    #[serde(default)]
    pub download: i64,
}

/// Outbound control message pushed from the hub to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommand {
    /// Correlation id the agent uses to drop duplicate deliveries.
    pub command_id: Uuid,
    /// Action and its payload.
    #[serde(flatten)]
    pub action: CommandAction,
}

impl NodeCommand {
    /// Wrap an action with a fresh command id.
    pub fn new(action: CommandAction) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            action,
        }
    }
}

/// Actions an agent understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum CommandAction {
    /// Download and install a newer agent build.
    Update(UpdatePayload),
    /// Switch the agent to a new control-plane API URL.
    ApiUrlChange(ApiUrlPayload),
    /// A peer node's public address changed.
    AddressChanged(AddressChangedPayload),
}

impl CommandAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Update(_) => "update",
            CommandAction::ApiUrlChange(_) => "api_url_change",
            CommandAction::AddressChanged(_) => "address_changed",
        }
    }
}

/// Payload of an `update` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Target agent version.
    pub version: String,
    /// Platform-specific artifact URL.
    pub download_url: String,
    /// Optional SHA-256 of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Payload of an `api_url_change` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUrlPayload {
    /// New base URL of the control-plane API.
    pub api_url: String,
}

/// Payload of an `address_changed` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressChangedPayload {
    /// Node whose address changed.
    pub node_id: i64,
    /// Current IPv4 address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    /// Current IPv6 address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

/// Request body for the API URL broadcast endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastApiUrlRequest {
    /// New API base URL.
    pub api_url: String,
    /// Restrict the broadcast to these nodes; all online nodes when absent.
    #[serde(default)]
    pub node_ids: Option<Vec<i64>>,
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// Sessions that accepted the frame.
    pub notified: usize,
    /// Sessions online when the broadcast ran.
    pub online: usize,
}

/// Response of a single-node update trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeResponse {
    /// Target node.
    pub node_id: i64,
    /// Dispatched command id.
    pub command_id: Uuid,
    /// Version the agent reported at connect time.
    #[serde(default)]
    pub current_version: Option<String>,
    /// Version the agent was asked to install.
    pub target_version: String,
}

/// Request body for the batch update endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchUpdateRequest {
    /// Explicit node ids; mutually exclusive with `all`.
    #[serde(default)]
    pub node_ids: Option<Vec<i64>>,
    /// Target every known node; mutually exclusive with `node_ids`.
    #[serde(default)]
    pub all: bool,
}

/// Per-node result of a batch update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateItem {
    /// Node the entry refers to.
    pub node_id: i64,
    /// Human-readable reason or dispatched version.
    pub reason: String,
}

/// Response of the batch update endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateResponse {
    /// Number of distinct nodes evaluated.
    pub total: usize,
    /// Release version the batch targeted, when one was found.
    #[serde(default)]
    pub target_version: Option<String>,
    /// Set when the node list was capped.
    pub truncated: bool,
    /// Nodes that received an update command.
    pub succeeded: Vec<BatchUpdateItem>,
    /// Nodes where dispatch was attempted or required and failed.
    pub failed: Vec<BatchUpdateItem>,
    /// Nodes that were not eligible.
    pub skipped: Vec<BatchUpdateItem>,
}

/// One live session as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineNodeSummary {
    /// Node id.
    pub node_id: i64,
    /// Remote socket address of the session.
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// When the session registered.
    pub connected_at: DateTime<Utc>,
    /// Seconds since the last pong or heartbeat.
    pub last_pong_secs: u64,
}

/// Latest status payload an agent reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    /// Node id.
    pub node_id: i64,
    /// When the hub received the payload.
    pub received_at: DateTime<Utc>,
    /// Opaque agent status document.
    pub status: serde_json::Value,
}
