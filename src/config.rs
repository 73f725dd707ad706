// src/config.rs
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_WS_HOST: &str = "wss://broadcastlv.chat.bilibili.com/sub";

/// How the upstream WebSocket host is picked for each room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSelection {
    Default,
    /// Always use this `wss://` url.
    Fixed(String),
    /// Probe the hosts advertised for the room and use the fastest.
    Auto,
}

impl HostSelection {
    /// Parses the `BILI_WS_HOST_FORCE` convention: a `wss://` url, `AUTO`, or anything else for default.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("wss://") {
            HostSelection::Fixed(raw.to_string())
        } else if raw == "AUTO" {
            HostSelection::Auto
        } else {
            HostSelection::Default
        }
    }
}

/// What keeps a canonical listener alive when only alias subscribers remain.
///
/// Both behaviours have shipped historically, so this stays a policy knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowRetention {
    /// A shadow alias counts only while somebody is still subscribed to it.
    Subscribed,
    /// A shadow alias counts until its canonical listener stops.
    Sticky,
}

impl FromStr for ShadowRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subscribed" => Ok(ShadowRetention::Subscribed),
            "sticky" => Ok(ShadowRetention::Sticky),
            other => Err(format!("unknown shadow retention `{}`", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub reconcile_interval: Duration,
    /// Max silence between upstream heartbeat replies before a listener is considered stalled.
    pub heartbeat_timeout: Duration,
    /// How often a session pings the upstream.
    pub upstream_heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub subscription_expiry: Duration,
    pub cooldown_base: Duration,
    /// Added to the cooldown once per room currently cooling down.
    pub cooldown_step: Duration,
    pub live_refresh_window: Duration,
    pub shadow_retention: ShadowRetention,
    pub ws_host: HostSelection,
    pub default_ws_host: String,
    pub proxy_addr: Option<String>,
    pub user_agent: String,
    pub api_pool_size: usize,
    pub global_token: Option<String>,
    pub database_url: Option<String>,
    pub reset_low_latency: bool,
    pub check_updates: bool,
    pub quiet_listening_log: bool,
}

impl Config {
    pub fn new() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            reconcile_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(180),
            upstream_heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            subscription_expiry: Duration::from_secs(300),
            cooldown_base: Duration::from_secs(600),
            cooldown_step: Duration::from_secs(1),
            live_refresh_window: Duration::from_secs(300),
            shadow_retention: ShadowRetention::Subscribed,
            ws_host: HostSelection::Default,
            default_ws_host: DEFAULT_WS_HOST.to_string(),
            proxy_addr: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36".to_string(),
            api_pool_size: 8,
            global_token: None,
            database_url: Some("sqlite:./data/live_events.db".to_string()),
            reset_low_latency: false,
            check_updates: true,
            quiet_listening_log: false,
        }
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Some(port) = env_parse::<u16>("PORT") {
            config.listen_addr = format!("0.0.0.0:{}", port);
        }
        if let Some(secs) = env_parse::<u64>("RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SUBSCRIPTION_EXPIRY_SECS") {
            config.subscription_expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COOLDOWN_BASE_SECS") {
            config.cooldown_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COOLDOWN_STEP_SECS") {
            config.cooldown_step = Duration::from_secs(secs);
        }
        if let Some(retention) = env_parse::<ShadowRetention>("SHADOW_RETENTION") {
            config.shadow_retention = retention;
        }
        if let Ok(host) = std::env::var("BILI_WS_HOST_FORCE") {
            config.ws_host = HostSelection::parse(&host);
        }
        if let Some(proxy) = env_non_empty("PROXY_ADDR") {
            config.proxy_addr = Some(proxy);
        }
        config.global_token = env_non_empty("RESTRICT_GLOBAL");
        if let Some(url) = env_non_empty("DATABASE_URL") {
            config.database_url = if url == "none" { None } else { Some(url) };
        }
        config.reset_low_latency = env_flag("RESET_LOW_LATENCY");
        config.quiet_listening_log = env_flag("NO_LISTENING_LOG");
        if let Ok(v) = std::env::var("CHECK_UPDATES") {
            config.check_updates = v != "false";
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "true").unwrap_or(false)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env_non_empty(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("⚠️ [CONFIG] Ignoring {}={}: {}", key, raw, e);
            None
        }
    }
}
