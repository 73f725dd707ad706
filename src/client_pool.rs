// src/client_pool.rs

use reqwest::{Client, Proxy};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Round-robin pool of reqwest clients for the metadata API.
///
/// A client that hit a transport error is rebuilt through
/// [`recycle_client`](Self::recycle_client) so the next request gets a fresh
/// connection (and, behind a proxy, usually a fresh exit).
#[derive(Clone)]
pub struct ClientPool {
    clients: Arc<RwLock<Vec<Client>>>,
    proxy_url: Option<String>,
    user_agent: String,
    max_size: usize,
    counter: Arc<AtomicUsize>,
}

impl ClientPool {
    pub fn new(size: usize, proxy_url: Option<String>, user_agent: impl Into<String>) -> Self {
        let size = size.max(1);
        let user_agent = user_agent.into();

        info!(
            "🏊 [POOL] Initializing with {} clients. Mode: {}",
            size,
            if proxy_url.is_some() { "PROXY" } else { "DIRECT" }
        );

        let clients = (0..size)
            .map(|i| build_client(proxy_url.as_deref(), &user_agent, i))
            .collect();

        Self {
            clients: Arc::new(RwLock::new(clients)),
            proxy_url,
            user_agent,
            max_size: size,
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A client and its index, for [`recycle_client`](Self::recycle_client).
    pub async fn get_client(&self) -> (usize, Client) {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.max_size;
        let read_lock = self.clients.read().await;
        (index, read_lock[index].clone())
    }

    pub async fn recycle_client(&self, index: usize) -> Client {
        warn!("♻️ [POOL] Recycling Client #{}", index);
        let new_client = build_client(self.proxy_url.as_deref(), &self.user_agent, index);

        let mut write_lock = self.clients.write().await;
        if let Some(slot) = write_lock.get_mut(index) {
            *slot = new_client.clone();
        }
        new_client
    }
}

/// With a proxy configured, a client that cannot use it gets a black-hole
/// proxy instead so requests fail rather than going out directly.
fn build_safe_fallback(proxy_url: Option<&str>) -> Client {
    if proxy_url.is_none() {
        return Client::new();
    }
    Proxy::all("http://0.0.0.0:1")
        .and_then(|broken| Client::builder().proxy(broken).build())
        .unwrap_or_else(|_| Client::new())
}

fn build_client(proxy_url: Option<&str>, user_agent: &str, index: usize) -> Client {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(8))
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(user_agent);

    if let Some(url) = proxy_url {
        match Proxy::all(proxy_url_with_scheme(url)) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => {
                error!("❌ [POOL] Invalid Proxy URL {}: {}", url, e);
                return build_safe_fallback(proxy_url);
            }
        }
    }

    match builder.build() {
        Ok(client) => client,
        Err(e) => {
            error!("🔥 [POOL] Client #{} failed to build: {}", index, e);
            build_safe_fallback(proxy_url)
        }
    }
}

/// `PROXY_ADDR` is a bare `host:port`; reqwest wants a url.
fn proxy_url_with_scheme(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
