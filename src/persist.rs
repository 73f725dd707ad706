// src/persist.rs
use crate::types::{LiveInfo, LiveMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Commands worth keeping; everything else is only relayed.
pub const PERSISTED_COMMANDS: &[&str] = &[
    "LIVE",
    "PREPARING",
    "DANMU_MSG",
    "SEND_GIFT",
    "USER_TOAST_MSG",
    "SUPER_CHAT_MESSAGE",
    "SUPER_CHAT_MESSAGE_JPN",
];

/// Fire-and-forget store for relayed messages. Failures are logged by the
/// caller and never reach subscribers.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn persist(&self, command: &str, live_info: &LiveInfo, message: &LiveMessage)
        -> Result<()>;
}

pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn persist(&self, _: &str, _: &LiveInfo, _: &LiveMessage) -> Result<()> {
        Ok(())
    }
}

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn connect(database_url: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_url.trim_start_matches("sqlite:")).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("create database directory")?;
            }
        }

        let opts = SqliteConnectOptions::from_str(database_url)
            .context("invalid database url")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", "5000");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .context("connect to sqlite")?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        init_db(&pool).await?;
        Ok(Self { pool })
    }
}

async fn init_db(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS live_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id INTEGER NOT NULL,
            command TEXT NOT NULL,
            uid INTEGER NOT NULL,
            title TEXT NOT NULL,
            payload TEXT NOT NULL,
            received_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("create live_events")?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_live_events_room ON live_events (room_id, received_at)")
        .execute(pool)
        .await
        .context("create live_events index")?;

    // 每场直播一行，stopped_at 为空表示正在直播
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS live_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            cover TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            stopped_at INTEGER,
            danmaku_count INTEGER NOT NULL DEFAULT 0,
            gift_total REAL NOT NULL DEFAULT 0,
            guard_total REAL NOT NULL DEFAULT 0,
            super_chat_total REAL NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await
    .context("create live_sessions")?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_live_sessions_open ON live_sessions (room_id, stopped_at)")
        .execute(pool)
        .await
        .context("create live_sessions index")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS super_chats (
            chat_id INTEGER PRIMARY KEY,
            room_id INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("create super_chats")?;

    info!("🗃️ 'live_events', 'live_sessions' and 'super_chats' tables are ready.");
    Ok(())
}

/// What a persisted message adds to the open session of its room.
#[derive(Debug, Clone, PartialEq)]
enum Tally {
    Danmaku,
    /// Gift value in yuan.
    Gift(f64),
    /// Guard purchase value in yuan.
    Guard(f64),
    SuperChat { id: i64, price: f64 },
}

/// Numbers arrive as JSON numbers or as strings depending on the command.
fn as_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn tally(command: &str, content: &Value) -> Option<Tally> {
    let data = &content["data"];
    match command {
        "DANMU_MSG" => Some(Tally::Danmaku),
        "SEND_GIFT" => {
            let coins = as_f64(&data["total_coin"]).or_else(|| {
                Some(as_f64(&data["price"])? * as_f64(&data["num"]).unwrap_or(1.0))
            })?;
            Some(Tally::Gift(coins / 1000.0))
        }
        "USER_TOAST_MSG" => Some(Tally::Guard(as_f64(&data["price"])? / 1000.0)),
        "SUPER_CHAT_MESSAGE" | "SUPER_CHAT_MESSAGE_JPN" => Some(Tally::SuperChat {
            id: as_i64(&data["id"])?,
            price: as_f64(&data["price"]).unwrap_or(0.0),
        }),
        _ => None,
    }
}

impl SqliteSink {
    async fn open_session(&self, live_info: &LiveInfo) -> Result<()> {
        let opened = sqlx::query(
            "INSERT INTO live_sessions (room_id, uid, name, title, cover, started_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM live_sessions WHERE room_id = ? AND stopped_at IS NULL)",
        )
        .bind(live_info.room_id)
        .bind(live_info.uid)
        .bind(&live_info.name)
        .bind(&live_info.title)
        .bind(&live_info.cover)
        .bind(Utc::now().timestamp())
        .bind(live_info.room_id)
        .execute(&self.pool)
        .await
        .context("open live session")?
        .rows_affected();
        if opened > 0 {
            info!("🔴 [PERSIST] Room {} went live", live_info.room_id);
        }
        Ok(())
    }

    async fn close_session(&self, room_id: i64) -> Result<()> {
        sqlx::query("UPDATE live_sessions SET stopped_at = ? WHERE room_id = ? AND stopped_at IS NULL")
            .bind(Utc::now().timestamp())
            .bind(room_id)
            .execute(&self.pool)
            .await
            .context("close live session")?;
        Ok(())
    }

    /// False when this super chat was already stored under another command.
    async fn first_super_chat(&self, chat_id: i64, room_id: i64) -> Result<bool> {
        let inserted = sqlx::query("INSERT OR IGNORE INTO super_chats (chat_id, room_id) VALUES (?, ?)")
            .bind(chat_id)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .context("record super chat")?
            .rows_affected();
        Ok(inserted > 0)
    }

    async fn add_to_session(&self, room_id: i64, tally: &Tally) -> Result<()> {
        let (column, amount) = match tally {
            Tally::Danmaku => ("danmaku_count", 1.0),
            Tally::Gift(v) => ("gift_total", *v),
            Tally::Guard(v) => ("guard_total", *v),
            Tally::SuperChat { price, .. } => ("super_chat_total", *price),
        };
        let sql = format!(
            "UPDATE live_sessions SET {col} = {col} + ? WHERE room_id = ? AND stopped_at IS NULL",
            col = column
        );
        sqlx::query(&sql)
            .bind(amount)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .context("update live session")?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for SqliteSink {
    async fn persist(&self, command: &str, live_info: &LiveInfo, message: &LiveMessage) -> Result<()> {
        if !PERSISTED_COMMANDS.contains(&command) {
            return Ok(());
        }
        let room_id = live_info.room_id;

        match command {
            "LIVE" => self.open_session(live_info).await?,
            "PREPARING" => self.close_session(room_id).await?,
            _ => {}
        }

        if let Some(tally) = tally(command, &message.content()) {
            if let Tally::SuperChat { id, .. } = tally {
                if !self.first_super_chat(id, room_id).await? {
                    debug!("[PERSIST] Super chat {} of room {} already stored", id, room_id);
                    return Ok(());
                }
            }
            self.add_to_session(room_id, &tally).await?;
        }

        sqlx::query(
            "INSERT INTO live_events (room_id, command, uid, title, payload, received_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(room_id)
        .bind(command)
        .bind(live_info.uid)
        .bind(&live_info.title)
        .bind(String::from_utf8_lossy(&message.raw).into_owned())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert {} for room {}", command, room_id))?;
        Ok(())
    }
}

/// The configured sink. A database that cannot be opened disables persistence
/// instead of stopping the relay.
pub async fn open_sink(database_url: Option<&str>) -> Arc<dyn EventSink> {
    let Some(url) = database_url else {
        info!("🗃️ [PERSIST] Disabled");
        return Arc::new(NullSink);
    };
    match SqliteSink::connect(url).await {
        Ok(sink) => {
            info!("🗃️ [PERSIST] Writing events to {}", url);
            Arc::new(sink)
        }
        Err(e) => {
            error!("❌ [PERSIST] Cannot open {}: {:#}. Persistence disabled.", url, e);
            Arc::new(NullSink)
        }
    }
}
