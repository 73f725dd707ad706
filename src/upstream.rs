// src/upstream.rs
use crate::{
    config::Config,
    error::UpstreamError,
    packet,
    types::{LiveMessage, RoomId},
};
use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to open the upstream connection of one room.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub room: RoomId,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
}

/// One open upstream connection.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Sends the enter-room handshake.
    async fn enter(&mut self, room: RoomId, guest_uid: i64) -> Result<(), UpstreamError>;

    /// Next decoded message, `Ok(None)` once the upstream closed.
    ///
    /// Must be cancel safe: the listener drops it when stopping.
    async fn next_message(&mut self) -> Result<Option<LiveMessage>, UpstreamError>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self, target: &ConnectTarget)
        -> Result<Box<dyn UpstreamSession>, UpstreamError>;
}

/// WebSocket connector for the danmaku servers, optionally through an HTTP CONNECT proxy.
pub struct DanmakuConnector {
    proxy_addr: Option<String>,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
}

impl DanmakuConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            proxy_addr: config.proxy_addr.clone(),
            handshake_timeout: config.handshake_timeout,
            heartbeat_interval: config.upstream_heartbeat_interval,
        }
    }

    async fn open(&self, target: &ConnectTarget) -> Result<DanmakuSession, UpstreamError> {
        let url = Url::parse(&target.url).map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| UpstreamError::Connect(format!("no host in {}", target.url)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let stream = establish_tcp(&host, port, self.proxy_addr.as_deref()).await?;

        let mut request = target.url.as_str().into_client_request()?;
        for (name, value) in &target.headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| UpstreamError::Connect(format!("header {}: {}", name, e)))?;
            request.headers_mut().insert(*name, value);
        }

        let (ws_stream, response) = client_async_tls_with_config(request, stream, None, None).await?;
        info!(
            "✅ [UPSTREAM {}] Connected to {} ({})",
            target.room,
            host,
            response.status()
        );

        let (write, read) = ws_stream.split();
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(DanmakuSession {
            room: target.room,
            write,
            read,
            heartbeat,
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl UpstreamConnector for DanmakuConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        let session = tokio::time::timeout(self.handshake_timeout, self.open(target))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        Ok(Box::new(session))
    }
}

pub struct DanmakuSession {
    room: RoomId,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    heartbeat: Interval,
    // messages decoded from a frame but not handed out yet
    pending: VecDeque<LiveMessage>,
}

#[async_trait]
impl UpstreamSession for DanmakuSession {
    async fn enter(&mut self, room: RoomId, guest_uid: i64) -> Result<(), UpstreamError> {
        debug!("[UPSTREAM {}] Entering as guest {}", room, guest_uid);
        self.write
            .send(Message::Binary(packet::enter_room(room, guest_uid)))
            .await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<LiveMessage>, UpstreamError> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.write.send(Message::Binary(packet::heartbeat())).await?;
                }
                frame = self.read.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let msgs = packet::decode(&data)?;
                        self.pending.extend(msgs);
                    }
                    Some(Ok(Message::Ping(p))) => {
                        self.write.send(Message::Pong(p)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("[UPSTREAM {}] Close frame: {:?}", self.room, frame);
                        return Ok(None);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(None),
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

/// Opens the TCP stream to `host:port`, tunnelling through an HTTP proxy when one is set.
async fn establish_tcp(
    host: &str,
    port: u16,
    proxy_addr: Option<&str>,
) -> Result<TcpStream, UpstreamError> {
    let target_addr = format!("{}:{}", host, port);

    let proxy = match proxy_addr {
        Some(p) if !p.is_empty() && p != "none" => p,
        _ => return Ok(TcpStream::connect(&target_addr).await?),
    };

    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| UpstreamError::Connect(format!("proxy {}: {}", proxy, e)))?;
    let connect_req = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target_addr, target_addr
    );
    stream.write_all(connect_req.as_bytes()).await?;

    let mut buf = vec![0; 1024];
    let n = stream.read(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf[..n]);

    if !(response.starts_with("HTTP/1.1 200") || response.starts_with("HTTP/1.0 200")) {
        return Err(UpstreamError::Connect(format!(
            "proxy CONNECT failed: {}",
            response.trim()
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_proxy(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT upstream.test:443"));
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn tunnels_through_http_proxy() {
        let proxy = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        assert!(establish_tcp("upstream.test", 443, Some(&proxy)).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_tunnel_is_a_connect_error() {
        let proxy = fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let err = establish_tcp("upstream.test", 443, Some(&proxy))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(msg) if msg.contains("407")));
    }
}
