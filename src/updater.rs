// src/updater.rs
use crate::client_pool::ClientPool;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const RELEASES_API: &str =
    "https://api.github.com/repos/Drelf2018/biligo-live-ws-PostgreSQL/releases/latest";
const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub prerelease: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available { version: String, url: String },
}

/// Compares dotted numeric versions; a leading `v` is ignored and missing
/// components count as zero, so `1.2` == `1.2.0` and `0.1.13.4` > `0.1.9`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    for i in 0..a.len().max(b.len()) {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Checks the latest published release once a day and logs when it is newer.
pub struct Updater {
    pool: ClientPool,
    url: String,
    current: String,
}

impl Updater {
    pub fn new(pool: ClientPool) -> Self {
        Self::with_source(pool, RELEASES_API, env!("CARGO_PKG_VERSION"))
    }

    pub fn with_source(pool: ClientPool, url: impl Into<String>, current: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
            current: current.into(),
        }
    }

    pub async fn check_once(&self) -> Result<UpdateStatus> {
        let (index, client) = self.pool.get_client().await;
        let resp = match client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.pool.recycle_client(index).await;
                return Err(e).context("release request failed");
            }
        };
        if !resp.status().is_success() {
            bail!("release endpoint answered {}", resp.status());
        }
        let release: Release = resp.json().await.context("invalid release payload")?;

        if !release.prerelease
            && compare_versions(&release.tag_name, &self.current) == Ordering::Greater
        {
            Ok(UpdateStatus::Available {
                version: release.tag_name.trim_start_matches('v').to_string(),
                url: release.html_url,
            })
        } else {
            Ok(UpdateStatus::UpToDate)
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("🔄 [UPDATER] Started, current version {}", self.current);
        let mut ticker = interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check_once().await {
                        Ok(UpdateStatus::Available { version, url }) => {
                            info!("🆕 [UPDATER] Version {} is available: {}", version, url);
                        }
                        Ok(UpdateStatus::UpToDate) => info!("[UPDATER] Already up to date"),
                        Err(e) => warn!("⚠️ [UPDATER] Update check failed: {:#}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("0.1.13.4", "0.1.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.2.0", "v0.10.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-rc1", "1.0.0"), Ordering::Equal);
    }

    async fn release_server(body: Value) -> String {
        let app = Router::new().route("/latest", get(move || async move { Json(body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/latest", addr)
    }

    #[tokio::test]
    async fn reports_newer_stable_release() {
        let url = release_server(json!({
            "tag_name": "v0.3.1",
            "html_url": "https://example.invalid/r",
            "prerelease": false
        }))
        .await;
        let updater = Updater::with_source(ClientPool::new(1, None, "test"), url, "0.2.0");
        assert_eq!(
            updater.check_once().await.unwrap(),
            UpdateStatus::Available {
                version: "0.3.1".into(),
                url: "https://example.invalid/r".into()
            }
        );
    }

    #[tokio::test]
    async fn ignores_prereleases_and_older_tags() {
        let url = release_server(json!({ "tag_name": "v9.0.0", "prerelease": true })).await;
        let updater = Updater::with_source(ClientPool::new(1, None, "test"), url, "0.2.0");
        assert_eq!(updater.check_once().await.unwrap(), UpdateStatus::UpToDate);

        let url = release_server(json!({ "tag_name": "0.1.0" })).await;
        let updater = Updater::with_source(ClientPool::new(1, None, "test"), url, "0.2.0");
        assert_eq!(updater.check_once().await.unwrap(), UpdateStatus::UpToDate);
    }
}
