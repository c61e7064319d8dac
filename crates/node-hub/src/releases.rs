use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    config::ReleaseConfig,
    updates::{has_newer_version, ReleaseAsset, ReleaseInfo, ReleaseSource},
};

const CHECKSUM_ASSETS: [&str; 2] = ["checksums.txt", "SHA256SUMS"];
const ARCHIVE_SUFFIXES: [&str; 4] = [".tar.gz", ".tgz", ".zip", ".exe"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

struct CachedRelease {
    release: ReleaseInfo,
    fetched_at: Instant,
}

/// Latest agent release from the GitHub releases API, cached in memory.
pub struct GithubReleaseSource {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    asset_prefix: String,
    ttl: Duration,
    cached: Mutex<Option<CachedRelease>>,
}

impl GithubReleaseSource {
    pub fn new(cfg: &ReleaseConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("node-hub/{}", crate::version::VERSION))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build release http client")?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            repo: cfg.github_repo.clone(),
            asset_prefix: cfg.asset_prefix.clone(),
            ttl: Duration::from_secs(cfg.cache_ttl_secs),
            cached: Mutex::new(None),
        })
    }

    fn cached_release(&self, known_version: Option<&str>) -> Option<ReleaseInfo> {
        let guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        if let Some(known) = known_version.map(str::trim).filter(|v| !v.is_empty()) {
            // An agent already at (or past) the cached release means the cache may be stale.
            if !has_newer_version(known, &cached.release.version) {
                debug!(known, cached = %cached.release.version, "forcing release refresh");
                return None;
            }
        }
        Some(cached.release.clone())
    }

    fn store(&self, release: &ReleaseInfo) {
        let mut guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CachedRelease {
            release: release.clone(),
            fetched_at: Instant::now(),
        });
    }

    async fn fetch(&self) -> anyhow::Result<ReleaseInfo> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, self.repo);
        let release: GithubRelease = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .with_context(|| format!("failed to fetch release metadata: {url}"))?
            .error_for_status()
            .with_context(|| format!("release request failed: {url}"))?
            .json()
            .await
            .with_context(|| format!("invalid release metadata: {url}"))?;

        let version = normalize_tag(&release.tag_name)
            .ok_or_else(|| anyhow::anyhow!("release at {url} has an empty tag"))?;
        let checksums = self.fetch_checksums(&release).await;

        let assets = release
            .assets
            .iter()
            .filter_map(|asset| {
                let (platform, arch) = parse_asset_name(&self.asset_prefix, &asset.name)?;
                Some(ReleaseAsset {
                    platform,
                    arch,
                    download_url: asset.browser_download_url.clone(),
                    checksum: checksums.get(&asset.name).cloned(),
                })
            })
            .collect::<Vec<_>>();

        info!(
            repo = %self.repo,
            version = %version,
            assets = assets.len(),
            checksums = checksums.len(),
            "fetched latest agent release"
        );
        Ok(ReleaseInfo { version, assets })
    }

    /// Missing or unreadable checksum files yield an empty map.
    async fn fetch_checksums(&self, release: &GithubRelease) -> HashMap<String, String> {
        let Some(asset) = release
            .assets
            .iter()
            .find(|asset| CHECKSUM_ASSETS.contains(&asset.name.as_str()))
        else {
            debug!(tag = %release.tag_name, "release has no checksum file");
            return HashMap::new();
        };

        let body = async {
            self.client
                .get(&asset.browser_download_url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        }
        .await;

        match body {
            Ok(text) => parse_checksums(&text),
            Err(err) => {
                warn!(
                    tag = %release.tag_name,
                    asset = %asset.name,
                    error = %err,
                    "failed to download release checksums"
                );
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    async fn latest(&self, known_version: Option<&str>) -> anyhow::Result<ReleaseInfo> {
        if let Some(release) = self.cached_release(known_version) {
            return Ok(release);
        }
        let release = self.fetch().await?;
        self.store(&release);
        Ok(release)
    }
}

/// `1.2.0`, `v1.2.0` and `V1.2.0` all become `v1.2.0`.
fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if bare.is_empty() {
        None
    } else {
        Some(format!("v{bare}"))
    }
}

/// `{prefix}-{platform}-{arch}` with an optional archive suffix.
fn parse_asset_name(prefix: &str, name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| rest.strip_suffix(suffix))
        .unwrap_or(rest);
    if rest.contains('.') {
        return None;
    }
    let (platform, arch) = rest.split_once('-')?;
    if platform.is_empty() || arch.is_empty() || arch.contains('-') {
        return None;
    }
    Some((platform.to_ascii_lowercase(), arch.to_ascii_lowercase()))
}

/// `sha256sum` output: `<hex>  <file>`, optionally `*<file>` for binary mode.
fn parse_checksums(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let file = parts.next()?.trim_start_matches('*');
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            Some((file.to_string(), digest.to_ascii_lowercase()))
        })
        .collect()
}
