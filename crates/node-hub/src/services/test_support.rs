use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::value::RawValue;

use crate::{
    address::AddressNotifier,
    app_state::AppState,
    cache::QuotaTtlCache,
    config::AppConfig,
    quota::{CachedQuotaInfo, PlanType, QuotaEngine, QuotaLoader, SuspensionEnforcer, UsageReader},
    router::MessageRouter,
    services::nodes::{IpFamily, NodeAddresses, NodeAgentInfo, NodeRepository},
    status::StatusSink,
    supervisor::BackgroundTasks,
    traffic::{SubscriptionResolver, TrafficPipeline, TrafficSink},
    updates::{ReleaseInfo, ReleaseSource},
};

const TIB: i64 = 1 << 40;

/// Poll `done` until it holds; fails the test after about two seconds.
async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn active_quota(plan_type: PlanType, traffic_limit: i64) -> CachedQuotaInfo {
    let now = Utc::now();
    CachedQuotaInfo {
        traffic_limit,
        period_start: now - ChronoDuration::days(1),
        period_end: now + ChronoDuration::days(29),
        plan_type,
        suspended: false,
        not_found: false,
    }
}

/// Loader that populates the cache like the SQLite one and counts calls.
pub(crate) struct CountingLoader {
    cache: Arc<QuotaTtlCache>,
    info: Option<CachedQuotaInfo>,
    calls: AtomicUsize,
}

impl CountingLoader {
    pub(crate) fn new(cache: Arc<QuotaTtlCache>, info: Option<CachedQuotaInfo>) -> Self {
        Self {
            cache,
            info,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuotaLoader for CountingLoader {
    async fn load(&self, subscription_id: i64) -> anyhow::Result<Option<CachedQuotaInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.info {
            Some(info) => {
                self.cache.insert(subscription_id, info.clone());
                Ok(Some(info.clone()))
            }
            None => {
                self.cache.insert_not_found(subscription_id);
                Ok(None)
            }
        }
    }
}

pub(crate) struct FixedUsage(pub i64);

#[async_trait]
impl UsageReader for FixedUsage {
    async fn period_usage(
        &self,
        _subscription_id: i64,
        _period_start: chrono::DateTime<Utc>,
        _period_end: chrono::DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub(crate) struct RecordingEnforcer {
    suspended: Mutex<Vec<i64>>,
}

impl RecordingEnforcer {
    pub(crate) fn suspended(&self) -> Vec<i64> {
        self.suspended.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for(&self, count: usize) {
        eventually(|| self.suspended.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl SuspensionEnforcer for RecordingEnforcer {
    async fn suspend(&self, subscription_id: i64) -> anyhow::Result<()> {
        self.suspended.lock().unwrap().push(subscription_id);
        Ok(())
    }
}

pub(crate) struct StaticResolver {
    known: HashMap<String, i64>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl StaticResolver {
    pub(crate) fn new(entries: &[(&str, i64)]) -> Self {
        Self {
            known: entries
                .iter()
                .map(|(sid, id)| (sid.to_string(), *id))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionResolver for StaticResolver {
    async fn resolve(&self, sids: &[String]) -> anyhow::Result<HashMap<String, i64>> {
        self.calls.lock().unwrap().push(sids.to_vec());
        Ok(sids
            .iter()
            .filter_map(|sid| self.known.get(sid).map(|id| (sid.clone(), *id)))
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    writes: Mutex<Vec<(i64, i64, i64, i64)>>,
}

impl RecordingSink {
    pub(crate) fn writes(&self) -> Vec<(i64, i64, i64, i64)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrafficSink for RecordingSink {
    async fn add(
        &self,
        node_id: i64,
        subscription_id: i64,
        upload: i64,
        download: i64,
    ) -> anyhow::Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((node_id, subscription_id, upload, download));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingStatus {
    recorded: Mutex<Vec<(i64, String)>>,
}

impl RecordingStatus {
    pub(crate) fn recorded(&self) -> Vec<(i64, String)> {
        self.recorded.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingStatus {
    fn record(&self, node_id: i64, payload: Box<RawValue>) {
        self.recorded
            .lock()
            .unwrap()
            .push((node_id, payload.get().to_string()));
    }
}

/// Quota engine over a fresh cache with zero usage.
pub(crate) fn quota_engine_with(
    loaded: Option<CachedQuotaInfo>,
) -> (QuotaEngine, Arc<RecordingEnforcer>) {
    let cache = Arc::new(QuotaTtlCache::new(
        Duration::from_secs(300),
        Duration::from_secs(60),
    ));
    let enforcer = Arc::new(RecordingEnforcer::default());
    let engine = QuotaEngine::new(
        cache.clone(),
        Arc::new(CountingLoader::new(cache, loaded)),
        Arc::new(FixedUsage(0)),
        enforcer.clone(),
        BackgroundTasks::new(Duration::from_secs(5)),
    );
    (engine, enforcer)
}

/// Router resolving `sid-a` to 1 and `sid-b` to 2.
pub(crate) fn test_router(
    status: Arc<RecordingStatus>,
    sink: Arc<RecordingSink>,
) -> MessageRouter {
    let (quota, _) = quota_engine_with(None);
    let pipeline = TrafficPipeline::new(
        Arc::new(StaticResolver::new(&[("sid-a", 1), ("sid-b", 2)])),
        sink,
        Arc::new(quota),
        TIB,
    );
    MessageRouter::new(status, Arc::new(pipeline))
}

/// Shared, ordered record of side effects across fakes.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
struct FakeNode {
    addresses: NodeAddresses,
    version: Option<String>,
    platform: Option<String>,
    arch: Option<String>,
}

#[derive(Default)]
pub(crate) struct FakeNodeRepository {
    nodes: Mutex<HashMap<i64, FakeNode>>,
    log: EventLog,
    fail_updates: AtomicBool,
}

impl FakeNodeRepository {
    pub(crate) fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// `agent` is `(version, platform, arch)`.
    pub(crate) fn insert_node(
        &self,
        node_id: i64,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
        agent: Option<(&str, &str, &str)>,
    ) {
        let node = FakeNode {
            addresses: NodeAddresses {
                ipv4: ipv4.map(str::to_string),
                ipv6: ipv6.map(str::to_string),
            },
            version: agent.map(|(v, _, _)| v.to_string()),
            platform: agent.map(|(_, p, _)| p.to_string()),
            arch: agent.map(|(_, _, a)| a.to_string()),
        };
        self.nodes.lock().unwrap().insert(node_id, node);
    }

    pub(crate) fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    fn info(node_id: i64, node: &FakeNode) -> NodeAgentInfo {
        NodeAgentInfo {
            node_id,
            version: node.version.clone(),
            platform: node.platform.clone(),
            arch: node.arch.clone(),
        }
    }
}

#[async_trait]
impl NodeRepository for FakeNodeRepository {
    async fn addresses(&self, node_id: i64) -> anyhow::Result<Option<NodeAddresses>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|node| node.addresses.clone()))
    }

    async fn update_address(
        &self,
        node_id: i64,
        family: IpFamily,
        value: &str,
    ) -> anyhow::Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(&node_id)
                .ok_or_else(|| anyhow::anyhow!("node {node_id} not found"))?;
            node.addresses.set(family, value.to_string());
        }
        self.log.push(format!("persist:{node_id}"));
        Ok(())
    }

    async fn agent_info(&self, node_id: i64) -> anyhow::Result<Option<NodeAgentInfo>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|node| Self::info(node_id, node)))
    }

    async fn agent_infos(&self, node_ids: &[i64]) -> anyhow::Result<Vec<NodeAgentInfo>> {
        let nodes = self.nodes.lock().unwrap();
        Ok(node_ids
            .iter()
            .filter_map(|id| nodes.get(id).map(|node| Self::info(*id, node)))
            .collect())
    }

    async fn list_node_ids(&self, limit: usize) -> anyhow::Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.nodes.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }
}

/// Notifier that records what the repository held when it ran.
pub(crate) struct LoggingNotifier {
    repo: Arc<FakeNodeRepository>,
    log: EventLog,
    seen_ipv4: Mutex<Vec<Option<String>>>,
}

impl LoggingNotifier {
    pub(crate) fn new(repo: Arc<FakeNodeRepository>, log: EventLog) -> Self {
        Self {
            repo,
            log,
            seen_ipv4: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen_ipv4.lock().unwrap().len()
    }

    pub(crate) fn observed_at_notify(&self) -> Vec<Option<String>> {
        self.seen_ipv4.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for(&self, count: usize) {
        eventually(|| self.calls() >= count).await;
    }
}

#[async_trait]
impl AddressNotifier for LoggingNotifier {
    async fn address_changed(&self, node_id: i64, _addresses: NodeAddresses) -> anyhow::Result<()> {
        let stored = self.repo.addresses(node_id).await?;
        self.log.push(format!("notify:{node_id}"));
        self.seen_ipv4
            .lock()
            .unwrap()
            .push(stored.and_then(|addresses| addresses.ipv4));
        Ok(())
    }
}

/// Release source returning a fixed result and recording the versions it was asked about.
pub(crate) struct FakeReleaseSource {
    result: Result<ReleaseInfo, String>,
    lookups: Mutex<Vec<Option<String>>>,
}

impl FakeReleaseSource {
    pub(crate) fn new(result: Result<ReleaseInfo, String>) -> Self {
        Self {
            result,
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lookups(&self) -> Vec<Option<String>> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReleaseSource for FakeReleaseSource {
    async fn latest(&self, known_version: Option<&str>) -> anyhow::Result<ReleaseInfo> {
        self.lookups
            .lock()
            .unwrap()
            .push(known_version.map(str::to_string));
        self.result.clone().map_err(|msg| anyhow::anyhow!(msg))
    }
}

pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server: crate::config::ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        metrics: crate::config::MetricsConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        database: crate::config::DatabaseConfig {
            url: "sqlite::memory:".into(),
        },
        operator: crate::config::OperatorAuthConfig {
            tokens: vec!["op-token".into()],
            header_name: "authorization".into(),
        },
        tokens: crate::config::TokenConfig {
            pepper: "pepper".into(),
        },
        hub: Default::default(),
        traffic: Default::default(),
        quota: Default::default(),
        releases: Default::default(),
    }
}

pub(crate) async fn setup_state() -> AppState {
    let db = crate::persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    let migration_outcome = crate::persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    crate::metrics::record_build_info(&migration_outcome.snapshot);

    AppState::assemble(
        db,
        &test_config(),
        Arc::new(FakeReleaseSource::new(Err("no releases in tests".into()))),
        metrics_handle,
        migration_outcome.snapshot,
    )
    .expect("assemble state")
}
