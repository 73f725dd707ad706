// src/metadata.rs
use crate::{
    client_pool::ClientPool,
    config::Config,
    error::ResolveError,
    types::{ListeningInfo, LiveInfo, OwnerInfo, RoomId, RoomInfo},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::{debug, info, warn};

const ROOM_INFO_API: &str = "https://api.live.bilibili.com/room/v1/Room/get_info";
const USER_INFO_API: &str = "https://api.bilibili.com/x/space/acc/info";
const WS_CONF_API: &str = "https://api.live.bilibili.com/room/v1/Danmu/getConf";

const CODE_RATE_LIMITED: i64 = -412;
const CODE_ROOM_NOT_FOUND: i64 = 1;
const CODE_USER_NOT_FOUND: i64 = -404;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks up room and owner metadata.
#[async_trait]
pub trait MetadataResolver: Send + Sync + 'static {
    /// `force` bypasses any cache.
    async fn resolve_room(&self, room: RoomId, force: bool) -> Result<RoomInfo, ResolveError>;

    async fn resolve_owner(&self, uid: i64, force: bool) -> Result<OwnerInfo, ResolveError>;

    /// `wss://` url of the fastest upstream host for `room`, if one can be found.
    async fn low_latency_host(&self, _room: RoomId, _force: bool) -> Option<String> {
        None
    }
}

pub async fn fetch_live_info(
    resolver: &dyn MetadataResolver,
    room: RoomId,
    force: bool,
) -> Result<LiveInfo, ResolveError> {
    let room_info = resolver.resolve_room(room, force).await?;
    let owner = resolver.resolve_owner(room_info.uid, force).await?;
    Ok(LiveInfo::new(room_info, &owner))
}

pub async fn fetch_listening_info(
    resolver: &dyn MetadataResolver,
    room: RoomId,
) -> Result<ListeningInfo, ResolveError> {
    let room_info = resolver.resolve_room(room, false).await?;
    let owner = resolver.resolve_owner(room_info.uid, false).await?;
    Ok(ListeningInfo {
        official_role: owner.official_role,
        live_info: LiveInfo::new(room_info, &owner),
    })
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    msg: String,
    // kept untyped: error responses put `{}` or `[]` here
    #[serde(default)]
    data: Value,
}

impl ApiResponse {
    fn reason(&self) -> String {
        let text = if self.message.is_empty() { &self.msg } else { &self.message };
        format!("code {}: {}", self.code, text)
    }

    fn into_data<T: DeserializeOwned>(self) -> Result<Option<T>, ResolveError> {
        match self.data {
            Value::Null => Ok(None),
            data => Ok(Some(serde_json::from_value(data)?)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoomData {
    room_id: RoomId,
    uid: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    user_cover: String,
}

#[derive(Debug, Deserialize)]
struct Official {
    role: i32,
}

#[derive(Debug, Deserialize)]
struct UserData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    face: String,
    #[serde(default)]
    sign: String,
    official: Option<Official>,
}

#[derive(Debug, Deserialize)]
struct WsConf {
    #[serde(default)]
    host_server_list: Vec<HostServer>,
}

#[derive(Debug, Clone, Deserialize)]
struct HostServer {
    host: String,
    #[serde(default = "default_wss_port")]
    wss_port: u16,
}

fn default_wss_port() -> u16 {
    443
}

fn upgrade_https(url: &str) -> String {
    url.replace("http://", "https://")
}

fn classify_room(resp: ApiResponse) -> Result<RoomInfo, ResolveError> {
    match resp.code {
        0 => {}
        CODE_RATE_LIMITED => return Err(ResolveError::RateLimited),
        CODE_ROOM_NOT_FOUND => return Err(ResolveError::NotFound),
        _ => return Err(ResolveError::Transient(resp.reason())),
    }
    let data: RoomData = resp.into_data()?.ok_or(ResolveError::NotFound)?;
    Ok(RoomInfo {
        room_id: data.room_id,
        uid: data.uid,
        title: data.title,
        cover: upgrade_https(&data.user_cover),
    })
}

fn classify_owner(resp: ApiResponse) -> Result<OwnerInfo, ResolveError> {
    match resp.code {
        0 => {}
        CODE_RATE_LIMITED => return Err(ResolveError::RateLimited),
        CODE_USER_NOT_FOUND => return Err(ResolveError::NotFound),
        _ => return Err(ResolveError::Transient(resp.reason())),
    }
    let reason = resp.reason();
    let data: UserData = resp
        .into_data()?
        .ok_or_else(|| ResolveError::Transient(format!("no user data ({})", reason)))?;
    Ok(OwnerInfo {
        name: data.name,
        face: upgrade_https(&data.face),
        bio: data.sign,
        official_role: data.official.map(|o| o.role).unwrap_or(-1),
    })
}

/// Metadata resolver backed by the bilibili HTTP API.
pub struct BiliApi {
    pool: ClientPool,
    rooms: DashMap<RoomId, RoomInfo>,
    owners: DashMap<i64, OwnerInfo>,
    hosts: DashMap<RoomId, String>,
}

impl BiliApi {
    pub fn new(config: &Config) -> Self {
        Self::with_pool(ClientPool::new(
            config.api_pool_size,
            config.proxy_addr.clone(),
            config.user_agent.clone(),
        ))
    }

    pub fn with_pool(pool: ClientPool) -> Self {
        Self {
            pool,
            rooms: DashMap::new(),
            owners: DashMap::new(),
            hosts: DashMap::new(),
        }
    }

    /// Forgets every cached low-latency host.
    pub fn reset_low_latency(&self) {
        let count = self.hosts.len();
        self.hosts.clear();
        info!("🔄 [API] Reset {} cached low latency hosts", count);
    }

    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<ApiResponse, ResolveError> {
        let (idx, client) = self.pool.get_client().await;

        let resp = match client.get(url).query(query).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.pool.recycle_client(idx).await;
                return Err(e.into());
            }
        };

        let status = resp.status();
        if status.as_u16() == 412 {
            return Err(ResolveError::RateLimited);
        }
        if !status.is_success() {
            return Err(ResolveError::Transient(format!("HTTP {} from {}", status, url)));
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<ApiResponse, ResolveError> {
        let strategy = FixedInterval::from_millis(500).take(2);
        RetryIf::spawn(
            strategy,
            move || self.get_once(url, query),
            |e: &ResolveError| matches!(e, ResolveError::Transient(_)),
        )
        .await
    }

    async fn fetch_ws_conf(&self, room: RoomId) -> Result<WsConf, ResolveError> {
        let query = [
            ("room_id", room.to_string()),
            ("platform", "pc".to_string()),
            ("player", "web".to_string()),
        ];
        let resp = self.get(WS_CONF_API, &query).await?;
        if resp.code != 0 {
            return Err(ResolveError::Transient(resp.reason()));
        }
        let reason = resp.reason();
        resp.into_data()?
            .ok_or_else(|| ResolveError::Transient(format!("no danmu conf ({})", reason)))
    }
}

#[async_trait]
impl MetadataResolver for BiliApi {
    async fn resolve_room(&self, room: RoomId, force: bool) -> Result<RoomInfo, ResolveError> {
        if !force {
            if let Some(cached) = self.rooms.get(&room) {
                return Ok(cached.clone());
            }
        }

        let resp = self.get(ROOM_INFO_API, &[("room_id", room.to_string())]).await?;
        let info = classify_room(resp).inspect_err(|e| {
            warn!("⚠️ [API] Room {} lookup failed: {}", room, e);
        })?;
        debug!("[API] Room {} resolved to {}", room, info.room_id);
        self.rooms.insert(room, info.clone());
        Ok(info)
    }

    async fn resolve_owner(&self, uid: i64, force: bool) -> Result<OwnerInfo, ResolveError> {
        if !force {
            if let Some(cached) = self.owners.get(&uid) {
                return Ok(cached.clone());
            }
        }

        let resp = self.get(USER_INFO_API, &[("mid", uid.to_string())]).await?;
        let owner = classify_owner(resp).inspect_err(|e| {
            warn!("⚠️ [API] User {} lookup failed: {}", uid, e);
        })?;
        self.owners.insert(uid, owner.clone());
        Ok(owner)
    }

    async fn low_latency_host(&self, room: RoomId, force: bool) -> Option<String> {
        if !force {
            if let Some(host) = self.hosts.get(&room) {
                return Some(host.clone());
            }
        }

        let conf = match self.fetch_ws_conf(room).await {
            Ok(conf) => conf,
            Err(e) => {
                warn!("⚠️ [API] Danmu conf of room {} unavailable: {}", room, e);
                return None;
            }
        };

        let host = fastest_host(&conf.host_server_list).await?;
        let url = format!("wss://{}/sub", host);
        info!("⚡ [API] Room {} low latency host: {}", room, url);
        self.hosts.insert(room, url.clone());
        Some(url)
    }
}

/// Probes every host with a TCP connect and returns the quickest to answer.
async fn fastest_host(servers: &[HostServer]) -> Option<String> {
    let probes = servers.iter().map(|server| async move {
        let started = Instant::now();
        let connect = TcpStream::connect((server.host.as_str(), server.wss_port));
        match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
            Ok(Ok(_)) => Some((started.elapsed(), server.host.clone())),
            Ok(Err(e)) => {
                debug!("[API] Probe of {} failed: {}", server.host, e);
                None
            }
            Err(_) => None,
        }
    });

    join_all(probes)
        .await
        .into_iter()
        .flatten()
        .min_by_key(|(rtt, _)| *rtt)
        .map(|(_, host)| host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn response(raw: &str) -> ApiResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn room_codes_map_to_resolve_errors() {
        assert_eq!(
            classify_room(response(r#"{"code":-412,"message":"too fast","data":[]}"#)),
            Err(ResolveError::RateLimited)
        );
        assert_eq!(
            classify_room(response(r#"{"code":1,"msg":"房间不存在","data":[]}"#)),
            Err(ResolveError::NotFound)
        );
        assert_eq!(
            classify_room(response(r#"{"code":0,"message":"ok","data":null}"#)),
            Err(ResolveError::NotFound)
        );
        assert!(matches!(
            classify_room(response(r#"{"code":-500,"message":"busy"}"#)),
            Err(ResolveError::Transient(msg)) if msg.contains("busy")
        ));
    }

    #[test]
    fn room_info_resolves_short_ids_and_upgrades_cover() {
        let info = classify_room(response(
            r#"{"code":0,"data":{"room_id":22637261,"short_id":545,"uid":9,"title":"hi","user_cover":"http://i0.hdslb.com/a.jpg"}}"#,
        ))
        .unwrap();
        assert_eq!(info.room_id, 22637261);
        assert_eq!(info.cover, "https://i0.hdslb.com/a.jpg");
    }

    #[test]
    fn owner_codes_and_official_role() {
        assert_eq!(
            classify_owner(response(r#"{"code":-404,"message":"啥都木有"}"#)),
            Err(ResolveError::NotFound)
        );
        assert_eq!(
            classify_owner(response(r#"{"code":-412,"message":"请求被拦截"}"#)),
            Err(ResolveError::RateLimited)
        );

        let owner = classify_owner(response(
            r#"{"code":0,"data":{"name":"n","face":"http://f","sign":"bio","official":{"role":3}}}"#,
        ))
        .unwrap();
        assert_eq!(owner.official_role, 3);
        assert_eq!(owner.face, "https://f");

        let plain = classify_owner(response(r#"{"code":0,"data":{"name":"n"}}"#)).unwrap();
        assert_eq!(plain.official_role, -1);
    }

    #[tokio::test]
    async fn fastest_host_skips_unreachable_servers() {
        let alive = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive_port = alive.local_addr().unwrap().port();
        let dead_port = {
            let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
            dead.local_addr().unwrap().port()
        };

        let servers = vec![
            HostServer { host: "127.0.0.1".into(), wss_port: dead_port },
            HostServer { host: "localhost".into(), wss_port: alive_port },
        ];
        assert_eq!(fastest_host(&servers).await.as_deref(), Some("localhost"));
        assert_eq!(fastest_host(&[]).await, None);
    }
}
