use std::sync::Arc;

use common::api::{TrafficReport, EVENT_TRAFFIC, FRAME_EVENT, FRAME_HEARTBEAT, FRAME_STATUS};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::{
    status::StatusSink,
    telemetry,
    traffic::{IngestSummary, TrafficPipeline},
};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    event_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    extra: Option<Box<RawValue>>,
}

/// One inbound frame, decoded exactly once into its variant.
#[derive(Debug)]
pub enum InboundMessage {
    Status(Box<RawValue>),
    Heartbeat,
    /// Reports that decoded, plus a count of array elements that did not.
    Traffic {
        reports: Vec<TrafficReport>,
        undecodable: usize,
    },
    OtherEvent { event_type: String, message: String },
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} frame carries no data")]
    MissingData(&'static str),
}

pub fn decode(text: &str) -> Result<InboundMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.kind.as_str() {
        FRAME_STATUS => envelope
            .data
            .map(InboundMessage::Status)
            .ok_or(DecodeError::MissingData("status")),
        FRAME_HEARTBEAT => Ok(InboundMessage::Heartbeat),
        FRAME_EVENT => {
            let data = envelope.data.ok_or(DecodeError::MissingData("event"))?;
            let event: EventData = serde_json::from_str(data.get())?;
            if event.event_type != EVENT_TRAFFIC {
                return Ok(InboundMessage::OtherEvent {
                    event_type: event.event_type,
                    message: event.message,
                });
            }
            let extra = event.extra.ok_or(DecodeError::MissingData("traffic event"))?;
            let elements: Vec<Box<RawValue>> = serde_json::from_str(extra.get())?;
            let mut reports = Vec::with_capacity(elements.len());
            let mut undecodable = 0;
            for element in elements {
                match serde_json::from_str::<TrafficReport>(element.get()) {
                    Ok(report) => reports.push(report),
                    Err(err) => {
                        debug!(error = %err, "skipping undecodable traffic report");
                        undecodable += 1;
                    }
                }
            }
            Ok(InboundMessage::Traffic {
                reports,
                undecodable,
            })
        }
        _ => Ok(InboundMessage::Unknown(envelope.kind)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Status,
    /// Message-level keepalive; refreshes the read deadline like a pong.
    Heartbeat,
    Traffic(IngestSummary),
    IgnoredEvent,
    UnknownType,
    Malformed,
}

pub struct MessageRouter {
    status: Arc<dyn StatusSink>,
    traffic: Arc<TrafficPipeline>,
}

impl MessageRouter {
    pub fn new(status: Arc<dyn StatusSink>, traffic: Arc<TrafficPipeline>) -> Self {
        Self { status, traffic }
    }

    pub async fn route(&self, node_id: i64, text: &str) -> RouteOutcome {
        let message = match decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(node_id, error = %err, "skipping malformed frame");
                return RouteOutcome::Malformed;
            }
        };

        match message {
            InboundMessage::Status(payload) => {
                self.status.record(node_id, payload);
                RouteOutcome::Status
            }
            InboundMessage::Heartbeat => RouteOutcome::Heartbeat,
            InboundMessage::Traffic {
                reports,
                undecodable,
            } => {
                let mut summary = self.traffic.ingest(node_id, reports).await;
                if undecodable > 0 {
                    warn!(node_id, undecodable, "rejected undecodable traffic reports");
                    for _ in 0..undecodable {
                        telemetry::record_traffic_report("rejected");
                    }
                    summary.received += undecodable;
                    summary.rejected += undecodable;
                }
                debug!(node_id, ?summary, "ingested traffic event");
                RouteOutcome::Traffic(summary)
            }
            InboundMessage::OtherEvent {
                event_type,
                message,
            } => {
                debug!(node_id, %event_type, %message, "ignoring unhandled event type");
                RouteOutcome::IgnoredEvent
            }
            InboundMessage::Unknown(kind) => {
                debug!(node_id, kind = %kind, "ignoring unknown message type");
                RouteOutcome::UnknownType
            }
        }
    }
}
