use std::{sync::Arc, time::Duration};

use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    address::{AddressChangeCoordinator, BroadcastAddressNotifier},
    buffer::TrafficBuffer,
    cache::QuotaTtlCache,
    config::{AppConfig, HubConfig},
    persistence,
    quota::QuotaEngine,
    registry::ConnectionRegistry,
    router::MessageRouter,
    services::{
        nodes::{NodeRepository, SqliteNodeRepository},
        quota::{
            BufferedUsageReader, CachingQuotaLoader, SqliteSubscriptionResolver,
            SqliteSuspensionEnforcer,
        },
    },
    session::{ConnectionSession, SessionLimits},
    status::StatusStore,
    supervisor::BackgroundTasks,
    tokens::tokens_match,
    traffic::TrafficPipeline,
    updates::{ReleaseSource, UpdateDispatcher},
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub registry: ConnectionRegistry,
    pub sessions: ConnectionSession,
    pub status: Arc<StatusStore>,
    pub buffer: Arc<TrafficBuffer>,
    pub address: Arc<AddressChangeCoordinator>,
    pub updates: Arc<UpdateDispatcher>,
    pub operator_auth: OperatorAuth,
    pub token_pepper: String,
    pub hub: HubConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

/// Operator authentication configuration.
#[derive(Clone)]
pub struct OperatorAuth {
    pub tokens: Vec<String>,
    pub header_name: HeaderName,
}

impl OperatorAuth {
    pub fn is_valid(&self, candidate: &str) -> bool {
        self.tokens
            .iter()
            .any(|token| tokens_match(token, candidate))
    }
}

impl AppState {
    /// Wire every hub component against one database pool.
    pub fn assemble(
        db: persistence::Db,
        config: &AppConfig,
        releases: Arc<dyn ReleaseSource>,
        metrics_handle: PrometheusHandle,
        schema: persistence::MigrationSnapshot,
    ) -> anyhow::Result<Self> {
        let header_name = HeaderName::from_bytes(config.operator.header_name.as_bytes())
            .map_err(|err| anyhow::anyhow!("invalid operator.header_name: {err}"))?;

        let tasks = BackgroundTasks::new(Duration::from_secs(config.quota.task_timeout_secs));
        let registry = ConnectionRegistry::new(config.hub.send_queue_capacity);
        let buffer = Arc::new(TrafficBuffer::new());
        let status = Arc::new(StatusStore::new());
        let nodes: Arc<dyn NodeRepository> = Arc::new(SqliteNodeRepository::new(db.clone()));

        let cache = Arc::new(QuotaTtlCache::new(
            Duration::from_secs(config.quota.cache_ttl_secs),
            Duration::from_secs(config.quota.not_found_ttl_secs),
        ));
        let quota = Arc::new(QuotaEngine::new(
            cache.clone(),
            Arc::new(CachingQuotaLoader::new(db.clone(), cache)),
            Arc::new(BufferedUsageReader::new(db.clone(), buffer.clone())),
            Arc::new(SqliteSuspensionEnforcer::new(db.clone())),
            tasks.clone(),
        ));
        let pipeline = Arc::new(TrafficPipeline::new(
            Arc::new(SqliteSubscriptionResolver::new(db.clone())),
            buffer.clone(),
            quota,
            config.traffic.max_report_bytes,
        ));
        let router = Arc::new(MessageRouter::new(status.clone(), pipeline));
        let sessions = ConnectionSession::new(
            registry.clone(),
            router,
            SessionLimits::from(&config.hub),
        );

        let address = Arc::new(AddressChangeCoordinator::new(
            nodes.clone(),
            Arc::new(BroadcastAddressNotifier::new(registry.clone())),
            tasks,
        ));
        let updates = Arc::new(UpdateDispatcher::new(
            registry.clone(),
            nodes,
            releases,
            config.releases.batch_max_nodes,
        ));

        Ok(Self {
            db,
            registry,
            sessions,
            status,
            buffer,
            address,
            updates,
            operator_auth: OperatorAuth {
                tokens: config.operator.tokens.clone(),
                header_name,
            },
            token_pepper: config.tokens.pepper.clone(),
            hub: config.hub.clone(),
            metrics_handle,
            schema,
        })
    }
}
