use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{supervisor::BackgroundTasks, telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Node,
    Forward,
    Hybrid,
}

impl PlanType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "node" => Some(PlanType::Node),
            "forward" => Some(PlanType::Forward),
            "hybrid" => Some(PlanType::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Node => "node",
            PlanType::Forward => "forward",
            PlanType::Hybrid => "hybrid",
        }
    }

    /// Forward-only plans are billed elsewhere.
    pub fn enforces_node_quota(&self) -> bool {
        matches!(self, PlanType::Node | PlanType::Hybrid)
    }
}

/// Cache projection of a subscription's quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuotaInfo {
    /// Bytes allowed per period; 0 means unlimited.
    pub traffic_limit: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub plan_type: PlanType,
    pub suspended: bool,
    /// Confirmed absent, as opposed to not cached.
    pub not_found: bool,
}

impl CachedQuotaInfo {
    pub fn not_found_marker() -> Self {
        Self {
            traffic_limit: 0,
            period_start: DateTime::<Utc>::UNIX_EPOCH,
            period_end: DateTime::<Utc>::UNIX_EPOCH,
            plan_type: PlanType::Node,
            suspended: false,
            not_found: true,
        }
    }
}

#[async_trait]
pub trait QuotaCache: Send + Sync {
    /// `Ok(None)` is a miss; a not-found marker is returned as an entry.
    async fn get(&self, subscription_id: i64) -> anyhow::Result<Option<CachedQuotaInfo>>;
    async fn mark_suspended(&self, subscription_id: i64) -> anyhow::Result<()>;
}

/// Cache-miss path; responsible for populating the cache, including markers.
#[async_trait]
pub trait QuotaLoader: Send + Sync {
    async fn load(&self, subscription_id: i64) -> anyhow::Result<Option<CachedQuotaInfo>>;
}

#[async_trait]
pub trait UsageReader: Send + Sync {
    async fn period_usage(
        &self,
        subscription_id: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait SuspensionEnforcer: Send + Sync {
    async fn suspend(&self, subscription_id: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    NotFound,
    AlreadySuspended,
    PlanNotEnforced,
    Unlimited,
    WithinLimit,
    Suspended,
    /// A collaborator failed; the check was abandoned.
    Error,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::NotFound => "not_found",
            CheckOutcome::AlreadySuspended => "already_suspended",
            CheckOutcome::PlanNotEnforced => "plan_not_enforced",
            CheckOutcome::Unlimited => "unlimited",
            CheckOutcome::WithinLimit => "within_limit",
            CheckOutcome::Suspended => "suspended",
            CheckOutcome::Error => "error",
        }
    }
}

/// Cache-first quota check with detached enforcement.
pub struct QuotaEngine {
    cache: Arc<dyn QuotaCache>,
    loader: Arc<dyn QuotaLoader>,
    usage: Arc<dyn UsageReader>,
    enforcer: Arc<dyn SuspensionEnforcer>,
    tasks: BackgroundTasks,
}

impl QuotaEngine {
    pub fn new(
        cache: Arc<dyn QuotaCache>,
        loader: Arc<dyn QuotaLoader>,
        usage: Arc<dyn UsageReader>,
        enforcer: Arc<dyn SuspensionEnforcer>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            cache,
            loader,
            usage,
            enforcer,
            tasks,
        }
    }

    /// Never fails from the caller's point of view; problems are logged.
    ///
    /// Marking the cached entry suspended happens inline: it is an in-process
    /// write, and the next check must see it even while the enforcer is
    /// still running. Only the enforcer call is detached.
    pub async fn check(&self, subscription_id: i64) -> CheckOutcome {
        let outcome = self.evaluate(subscription_id).await;
        telemetry::record_quota_check(outcome.as_str());
        outcome
    }

    async fn evaluate(&self, subscription_id: i64) -> CheckOutcome {
        let quota = match self.cache.get(subscription_id).await {
            Ok(Some(quota)) => quota,
            Ok(None) => match self.loader.load(subscription_id).await {
                Ok(Some(quota)) => quota,
                Ok(None) => return CheckOutcome::NotFound,
                Err(err) => {
                    warn!(subscription_id, error = ?err, "quota load failed");
                    return CheckOutcome::Error;
                }
            },
            Err(err) => {
                warn!(subscription_id, error = ?err, "quota cache read failed");
                return CheckOutcome::Error;
            }
        };

        if quota.not_found {
            return CheckOutcome::NotFound;
        }
        if quota.suspended {
            return CheckOutcome::AlreadySuspended;
        }
        if !quota.plan_type.enforces_node_quota() {
            return CheckOutcome::PlanNotEnforced;
        }
        if quota.traffic_limit <= 0 {
            return CheckOutcome::Unlimited;
        }

        let used = match self
            .usage
            .period_usage(subscription_id, quota.period_start, quota.period_end)
            .await
        {
            Ok(used) => used,
            Err(err) => {
                warn!(subscription_id, error = ?err, "period usage read failed");
                return CheckOutcome::Error;
            }
        };
        if used < quota.traffic_limit {
            debug!(subscription_id, used, limit = quota.traffic_limit, "quota within limit");
            return CheckOutcome::WithinLimit;
        }

        info!(
            subscription_id,
            used,
            limit = quota.traffic_limit,
            "traffic quota exceeded; suspending subscription"
        );
        if let Err(err) = self.cache.mark_suspended(subscription_id).await {
            warn!(subscription_id, error = ?err, "failed to mark cached quota suspended");
        }
        let enforcer = self.enforcer.clone();
        self.tasks.spawn("quota_enforcement", async move {
            enforcer.suspend(subscription_id).await
        });
        CheckOutcome::Suspended
    }
}
