use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use common::api::TrafficReport;
use tracing::{debug, warn};

use crate::{quota::QuotaEngine, telemetry};

/// Maps public subscription identifiers (SIDs) to internal ids.
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// Unknown SIDs are simply absent from the result.
    async fn resolve(&self, sids: &[String]) -> anyhow::Result<HashMap<String, i64>>;
}

/// Destination for accepted byte counters.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    async fn add(
        &self,
        node_id: i64,
        subscription_id: i64,
        upload: i64,
        download: i64,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReportRejection {
    #[error("byte counts must not be negative")]
    Negative,
    #[error("byte count exceeds the per-report ceiling of {0} bytes")]
    TooLarge(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportVerdict {
    Accept,
    /// Nothing to record.
    Skip,
    Reject(ReportRejection),
}

pub fn validate_report(upload: i64, download: i64, ceiling: i64) -> ReportVerdict {
    if upload < 0 || download < 0 {
        return ReportVerdict::Reject(ReportRejection::Negative);
    }
    if upload > ceiling || download > ceiling {
        return ReportVerdict::Reject(ReportRejection::TooLarge(ceiling));
    }
    if upload == 0 && download == 0 {
        return ReportVerdict::Skip;
    }
    ReportVerdict::Accept
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: usize,
    pub unresolved: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub accepted: usize,
    pub buffer_failed: usize,
}

pub struct TrafficPipeline {
    resolver: Arc<dyn SubscriptionResolver>,
    sink: Arc<dyn TrafficSink>,
    quota: Arc<QuotaEngine>,
    max_report_bytes: i64,
}

impl TrafficPipeline {
    pub fn new(
        resolver: Arc<dyn SubscriptionResolver>,
        sink: Arc<dyn TrafficSink>,
        quota: Arc<QuotaEngine>,
        max_report_bytes: i64,
    ) -> Self {
        Self {
            resolver,
            sink,
            quota,
            max_report_bytes,
        }
    }

    /// Ingest one traffic event from `node_id`. Bad reports never fail the batch.
    pub async fn ingest(&self, node_id: i64, reports: Vec<TrafficReport>) -> IngestSummary {
        let mut summary = IngestSummary {
            received: reports.len(),
            ..IngestSummary::default()
        };

        let mut seen = HashSet::new();
        let sids: Vec<String> = reports
            .iter()
            .map(|r| r.subscription_id.as_str())
            .filter(|sid| !sid.is_empty() && seen.insert(*sid))
            .map(str::to_string)
            .collect();

        let resolved = if sids.is_empty() {
            HashMap::new()
        } else {
            match self.resolver.resolve(&sids).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(node_id, error = ?err, "subscription resolution failed; dropping traffic batch");
                    summary.unresolved = reports.len();
                    telemetry::record_traffic_report("unresolved");
                    return summary;
                }
            }
        };

        let mut to_check: Vec<i64> = Vec::new();
        for report in reports {
            let Some(&subscription_id) = resolved.get(&report.subscription_id) else {
                debug!(node_id, sid = %report.subscription_id, "dropping report for unknown subscription");
                summary.unresolved += 1;
                telemetry::record_traffic_report("unresolved");
                continue;
            };

            match validate_report(report.upload, report.download, self.max_report_bytes) {
                ReportVerdict::Accept => {}
                ReportVerdict::Skip => {
                    summary.skipped += 1;
                    telemetry::record_traffic_report("skipped");
                    continue;
                }
                ReportVerdict::Reject(reason) => {
                    warn!(
                        node_id,
                        subscription_id,
                        upload = report.upload,
                        download = report.download,
                        %reason,
                        "rejected traffic report"
                    );
                    summary.rejected += 1;
                    telemetry::record_traffic_report("rejected");
                    continue;
                }
            }

            if let Err(err) = self
                .sink
                .add(node_id, subscription_id, report.upload, report.download)
                .await
            {
                warn!(node_id, subscription_id, error = ?err, "traffic buffer write failed");
                summary.buffer_failed += 1;
                telemetry::record_traffic_report("buffer_failed");
                continue;
            }
            summary.accepted += 1;
            telemetry::record_traffic_report("accepted");
            if !to_check.contains(&subscription_id) {
                to_check.push(subscription_id);
            }
        }

        for subscription_id in to_check {
            self.quota.check(subscription_id).await;
        }
        summary
    }
}
