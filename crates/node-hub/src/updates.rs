use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use common::api::{
    BatchUpdateItem, BatchUpdateRequest, BatchUpdateResponse, CommandAction, NodeCommand,
    UpdateNodeResponse, UpdatePayload,
};
use semver::Version;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    registry::{ConnectionRegistry, DispatchError},
    services::nodes::{NodeAgentInfo, NodeRepository},
};

/// Parse an agent version leniently: optional `v` prefix, and `1` or `1.2`
/// are read as `1.0.0` and `1.2.0`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(stripped) {
        return Some(version);
    }

    let split_at = stripped.find(['-', '+']).unwrap_or(stripped.len());
    let (core, suffix) = stripped.split_at(split_at);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Whether `latest` should replace `current`.
///
/// An unparsable `current` (empty, `dev`) always wants the update; an
/// unparsable `latest` never triggers one.
pub fn has_newer_version(current: &str, latest: &str) -> bool {
    let Some(latest) = parse_version(latest) else {
        return false;
    };
    match parse_version(current) {
        Some(current) => current < latest,
        None => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub platform: String,
    pub arch: String,
    pub download_url: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: String,
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseInfo {
    pub fn asset_for(&self, platform: &str, arch: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| {
            asset.platform.eq_ignore_ascii_case(platform) && asset.arch.eq_ignore_ascii_case(arch)
        })
    }
}

/// Latest published agent release.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// `known_version` is the newest version the caller has seen on an agent;
    /// implementations refresh their cache when it is not older than what they hold.
    async fn latest(&self, known_version: Option<&str>) -> anyhow::Result<ReleaseInfo>;
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("node {0} not found")]
    NodeNotFound(i64),
    #[error("node is offline")]
    NodeOffline,
    #[error("node platform or architecture is unknown")]
    UnknownPlatform,
    #[error("node already runs {current} (latest {latest})")]
    AlreadyUpToDate { current: String, latest: String },
    #[error("no download available for {platform}/{arch}")]
    NoDownload { platform: String, arch: String },
    #[error("latest release unavailable: {0}")]
    ReleaseUnavailable(String),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("node lookup failed: {0:#}")]
    Repository(anyhow::Error),
}

impl UpdateError {
    /// Conditions that make a node ineligible rather than a failed attempt.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            UpdateError::NodeOffline
                | UpdateError::UnknownPlatform
                | UpdateError::AlreadyUpToDate { .. }
                | UpdateError::NoDownload { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum BatchRequestError {
    #[error("node_ids and all are mutually exclusive")]
    Conflicting,
    #[error("either node_ids or all must be set")]
    MissingTarget,
    #[error("node_ids cannot be empty")]
    EmptyNodeList,
    #[error("too many nodes requested ({0})")]
    TooManyNodes(usize),
    #[error("listing nodes failed: {0:#}")]
    Repository(anyhow::Error),
}

struct Target<'a> {
    info: &'a NodeAgentInfo,
    platform: &'a str,
    arch: &'a str,
}

pub struct UpdateDispatcher {
    registry: ConnectionRegistry,
    nodes: Arc<dyn NodeRepository>,
    releases: Arc<dyn ReleaseSource>,
    batch_max_nodes: usize,
}

impl UpdateDispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        nodes: Arc<dyn NodeRepository>,
        releases: Arc<dyn ReleaseSource>,
        batch_max_nodes: usize,
    ) -> Self {
        Self {
            registry,
            nodes,
            releases,
            batch_max_nodes,
        }
    }

    pub async fn trigger(&self, node_id: i64) -> Result<UpdateNodeResponse, UpdateError> {
        let info = self
            .nodes
            .agent_info(node_id)
            .await
            .map_err(UpdateError::Repository)?
            .ok_or(UpdateError::NodeNotFound(node_id))?;
        let target = self.preflight(&info).await?;
        let release = self
            .releases
            .latest(info.version.as_deref())
            .await
            .map_err(|err| UpdateError::ReleaseUnavailable(format!("{err:#}")))?;
        self.dispatch(&target, &release).await
    }

    pub async fn trigger_batch(
        &self,
        request: &BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse, BatchRequestError> {
        let (node_ids, truncated) = self.batch_targets(request).await?;
        let infos: HashMap<i64, NodeAgentInfo> = self
            .nodes
            .agent_infos(&node_ids)
            .await
            .map_err(BatchRequestError::Repository)?
            .into_iter()
            .map(|info| (info.node_id, info))
            .collect();

        let mut response = BatchUpdateResponse {
            total: node_ids.len(),
            truncated,
            ..BatchUpdateResponse::default()
        };

        let mut eligible = Vec::new();
        for node_id in &node_ids {
            let Some(info) = infos.get(node_id) else {
                classify(&mut response, *node_id, Err(UpdateError::NodeNotFound(*node_id)));
                continue;
            };
            match self.preflight(info).await {
                Ok(target) => eligible.push(target),
                Err(err) => classify(&mut response, *node_id, Err(err)),
            }
        }

        if !eligible.is_empty() {
            let highest = highest_version(eligible.iter().map(|t| t.info.version.as_deref()));
            debug!(
                highest = highest.unwrap_or("<none>"),
                candidates = eligible.len(),
                "looking up release for batch update"
            );
            match self.releases.latest(highest).await {
                Ok(release) => {
                    response.target_version = Some(release.version.clone());
                    for target in &eligible {
                        let outcome = self.dispatch(target, &release).await;
                        classify(&mut response, target.info.node_id, outcome);
                    }
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(error = %reason, "release lookup failed for batch update");
                    for target in &eligible {
                        classify(
                            &mut response,
                            target.info.node_id,
                            Err(UpdateError::ReleaseUnavailable(reason.clone())),
                        );
                    }
                }
            }
        }

        info!(
            total = response.total,
            succeeded = response.succeeded.len(),
            failed = response.failed.len(),
            skipped = response.skipped.len(),
            truncated = response.truncated,
            "batch update evaluated"
        );
        Ok(response)
    }

    async fn batch_targets(
        &self,
        request: &BatchUpdateRequest,
    ) -> Result<(Vec<i64>, bool), BatchRequestError> {
        match (&request.node_ids, request.all) {
            (Some(_), true) => Err(BatchRequestError::Conflicting),
            (None, false) => Err(BatchRequestError::MissingTarget),
            (Some(ids), false) => {
                if ids.is_empty() {
                    return Err(BatchRequestError::EmptyNodeList);
                }
                let mut seen = HashSet::new();
                let ids: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
                if ids.len() > self.batch_max_nodes {
                    return Err(BatchRequestError::TooManyNodes(ids.len()));
                }
                Ok((ids, false))
            }
            (None, true) => {
                let mut ids = self
                    .nodes
                    .list_node_ids(self.batch_max_nodes.saturating_add(1))
                    .await
                    .map_err(BatchRequestError::Repository)?;
                let truncated = ids.len() > self.batch_max_nodes;
                ids.truncate(self.batch_max_nodes);
                Ok((ids, truncated))
            }
        }
    }

    async fn preflight<'a>(&self, info: &'a NodeAgentInfo) -> Result<Target<'a>, UpdateError> {
        if !self.registry.is_online(info.node_id).await {
            return Err(UpdateError::NodeOffline);
        }
        let platform = non_empty(info.platform.as_deref()).ok_or(UpdateError::UnknownPlatform)?;
        let arch = non_empty(info.arch.as_deref()).ok_or(UpdateError::UnknownPlatform)?;
        Ok(Target {
            info,
            platform,
            arch,
        })
    }

    async fn dispatch(
        &self,
        target: &Target<'_>,
        release: &ReleaseInfo,
    ) -> Result<UpdateNodeResponse, UpdateError> {
        let node_id = target.info.node_id;
        let current = target.info.version.clone().unwrap_or_default();
        if !has_newer_version(&current, &release.version) {
            return Err(UpdateError::AlreadyUpToDate {
                current,
                latest: release.version.clone(),
            });
        }
        let asset = release
            .asset_for(target.platform, target.arch)
            .ok_or_else(|| UpdateError::NoDownload {
                platform: target.platform.to_string(),
                arch: target.arch.to_string(),
            })?;
        if asset.checksum.is_none() {
            info!(
                node_id,
                version = %release.version,
                platform = target.platform,
                arch = target.arch,
                "release asset has no checksum; dispatching without one"
            );
        }

        let command = NodeCommand::new(CommandAction::Update(UpdatePayload {
            version: release.version.clone(),
            download_url: asset.download_url.clone(),
            checksum: asset.checksum.clone(),
        }));
        self.registry.send_command(node_id, &command).await?;
        info!(
            node_id,
            command_id = %command.command_id,
            from = %current,
            to = %release.version,
            "update command dispatched"
        );

        Ok(UpdateNodeResponse {
            node_id,
            command_id: command.command_id,
            current_version: target.info.version.clone(),
            target_version: release.version.clone(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Highest reported version using the "not older than" rule; blank versions are ignored.
fn highest_version<'a>(versions: impl Iterator<Item = Option<&'a str>>) -> Option<&'a str> {
    let mut highest: Option<&str> = None;
    for version in versions.flatten() {
        if version.trim().is_empty() {
            continue;
        }
        match highest {
            Some(current) if has_newer_version(version, current) => {}
            _ => highest = Some(version),
        }
    }
    highest
}

fn classify(
    response: &mut BatchUpdateResponse,
    node_id: i64,
    outcome: Result<UpdateNodeResponse, UpdateError>,
) {
    match outcome {
        Ok(dispatched) => response.succeeded.push(BatchUpdateItem {
            node_id,
            reason: dispatched.target_version,
        }),
        Err(err) if err.is_skip() => response.skipped.push(BatchUpdateItem {
            node_id,
            reason: err.to_string(),
        }),
        Err(err) => {
            warn!(node_id, error = %err, "batch update failed for node");
            response.failed.push(BatchUpdateItem {
                node_id,
                reason: err.to_string(),
            })
        }
    }
}
