use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{
    RECONNECT_BACKOFF_MS, TRADE_BATCH_MAX, TRADE_FLUSH_INTERVAL_MS, TRADE_QUEUE_CAPACITY,
    TRADE_WRITE_RETRIES, TRADE_WRITE_RETRY_DELAY_MS, WS_PING_INTERVAL_SECS,
    WS_SUBSCRIBE_CHUNK_SIZE,
};
use crate::error::Result;
use crate::health::{ConnectionSnapshot, HealthRegistry};
use crate::storage::Storage;
use crate::stream::messages::parse_trade_frames;
use crate::types::Trade;

pub const TRADE_LISTENER_UNIT: &str = "trade_listener";

/// Per-connection counters, updated from the read loop and read by the
/// drain task when publishing health.
pub struct ConnectionHealth {
    connected: AtomicBool,
    last_message_ms: AtomicI64,
    reconnects: AtomicU64,
    subscribed_tokens: usize,
}

impl ConnectionHealth {
    fn new(subscribed_tokens: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
            reconnects: AtomicU64::new(0),
            subscribed_tokens,
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        let ms = self.last_message_ms.load(Ordering::Relaxed);
        ConnectionSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            last_message: (ms > 0).then(|| DateTime::<Utc>::from_timestamp_millis(ms)).flatten(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            subscribed_tokens: self.subscribed_tokens,
        }
    }
}

/// Split the token universe into per-connection subscription lists. A single
/// connection has a server-side subscription ceiling.
fn chunk_universe(universe: &[String]) -> Vec<Vec<String>> {
    universe
        .chunks(WS_SUBSCRIBE_CHUNK_SIZE)
        .map(|c| c.to_vec())
        .collect()
}

/// Push a parsed trade into the shared queue without ever blocking the read
/// loop. When the queue is full the incoming event is dropped: a lost tick is
/// acceptable, a stalled heartbeat path is not.
fn enqueue_trade(tx: &mpsc::Sender<Trade>, trade: Trade) -> bool {
    match tx.try_send(trade) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("trade queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            // Drain task already gone; normal during shutdown.
            debug!("trade queue closed, dropping event");
            false
        }
    }
}

/// Self-healing consumer of the venue's trade feed.
///
/// The token universe is fixed for the life of the instance; the daemon
/// reconstructs the whole listener (fresh universe, fresh queue, fresh
/// connections) when it restarts the unit.
pub struct TradeListener {
    ws_url: String,
    storage: Arc<Storage>,
    health: Arc<HealthRegistry>,
    chunks: Vec<Vec<String>>,
    conn_health: Vec<Arc<ConnectionHealth>>,
}

impl TradeListener {
    pub fn new(
        ws_url: String,
        storage: Arc<Storage>,
        health: Arc<HealthRegistry>,
        universe: Vec<String>,
    ) -> Self {
        let chunks = chunk_universe(&universe);
        let conn_health = chunks
            .iter()
            .map(|c| Arc::new(ConnectionHealth::new(c.len())))
            .collect();
        Self { ws_url, storage, health, chunks, conn_health }
    }

    /// Runs until the shutdown signal flips. Returning earlier than that is
    /// a crash the daemon will recover from by rebuilding the listener.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tokens = self.chunks.iter().map(Vec::len).sum::<usize>(),
            connections = self.chunks.len(),
            "trade listener starting"
        );
        self.health.set_running(TRADE_LISTENER_UNIT, true);

        let (tx, mut rx) = mpsc::channel::<Trade>(TRADE_QUEUE_CAPACITY);
        let conn_tasks: Vec<JoinHandle<()>> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                tokio::spawn(connection_task(
                    self.ws_url.clone(),
                    chunk.clone(),
                    i,
                    tx.clone(),
                    Arc::clone(&self.conn_health[i]),
                    shutdown.clone(),
                ))
            })
            .collect();
        drop(tx); // rx closes once every connection task is gone

        let mut batch: Vec<Trade> = Vec::with_capacity(TRADE_BATCH_MAX);
        let mut flush = interval(Duration::from_millis(TRADE_FLUSH_INTERVAL_MS));
        flush.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(trade) => {
                        batch.push(trade);
                        if batch.len() >= TRADE_BATCH_MAX {
                            self.flush_batch(&mut batch).await;
                        }
                    }
                    None => break,
                },

                _ = flush.tick() => {
                    if !batch.is_empty() {
                        self.flush_batch(&mut batch).await;
                    }
                    self.publish_connection_health();
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Flush whatever is already queued; don't wait for more.
        while let Ok(trade) = rx.try_recv() {
            batch.push(trade);
            if batch.len() >= TRADE_BATCH_MAX {
                self.flush_batch(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(&mut batch).await;
        }

        for task in conn_tasks {
            let _ = task.await;
        }
        self.publish_connection_health();
        self.health.set_running(TRADE_LISTENER_UNIT, false);
        info!("trade listener stopped");
    }

    /// A failed write is retried before the next batch is accepted; after
    /// the last attempt the batch is dropped loudly.
    async fn flush_batch(&self, batch: &mut Vec<Trade>) {
        for attempt in 1..=TRADE_WRITE_RETRIES {
            match self.storage.bulk_insert_trades(batch).await {
                Ok(inserted) => {
                    debug!(inserted, "trade batch written");
                    self.health.record_success(TRADE_LISTENER_UNIT, inserted);
                    batch.clear();
                    return;
                }
                Err(e) => {
                    warn!(attempt, batch_size = batch.len(), "trade batch write failed: {e}");
                    if attempt == TRADE_WRITE_RETRIES {
                        error!(
                            dropped = batch.len(),
                            "trade batch dropped after {attempt} failed write attempts"
                        );
                        self.health.record_failure(TRADE_LISTENER_UNIT, &e.to_string());
                        batch.clear();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(TRADE_WRITE_RETRY_DELAY_MS)).await;
                }
            }
        }
    }

    fn publish_connection_health(&self) {
        self.health
            .set_stream_connections(self.conn_health.iter().map(|h| h.snapshot()).collect());
    }
}

/// Owns one WebSocket connection: connect, subscribe, read until drop, then
/// reconnect on a backoff ladder. Exits only on shutdown.
async fn connection_task(
    ws_url: String,
    token_ids: Vec<String>,
    conn_id: usize,
    tx: mpsc::Sender<Trade>,
    health: Arc<ConnectionHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff_idx = 0usize;

    loop {
        if *shutdown.borrow() {
            break;
        }
        info!(conn = conn_id, "WS connecting to {ws_url}");
        match run_connection(&ws_url, &token_ids, conn_id, &tx, &health, &mut shutdown).await {
            Ok(()) => {
                info!(conn = conn_id, "WS connection closed cleanly");
                backoff_idx = 0;
            }
            Err(e) => {
                error!(conn = conn_id, "WS connection error: {e}");
            }
        }
        health.connected.store(false, Ordering::Relaxed);

        if *shutdown.borrow() {
            break;
        }
        health.reconnects.fetch_add(1, Ordering::Relaxed);

        let delay_ms = RECONNECT_BACKOFF_MS
            .get(backoff_idx)
            .copied()
            .unwrap_or(*RECONNECT_BACKOFF_MS.last().unwrap());
        backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

        warn!(conn = conn_id, "WS reconnecting in {delay_ms}ms");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn run_connection(
    ws_url: &str,
    token_ids: &[String],
    conn_id: usize,
    tx: &mpsc::Sender<Trade>,
    health: &ConnectionHealth,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (ws_stream, _) = connect_async(ws_url).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(build_subscribe_msg(token_ids).into()))
        .await?;
    debug!(conn = conn_id, ids = token_ids.len(), "WS subscribed");
    health.connected.store(true, Ordering::Relaxed);

    let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    ping_interval.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        health.last_message_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        for trade in parse_trade_frames(&text) {
                            enqueue_trade(tx, trade);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }

            _ = ping_interval.tick() => {
                debug!(conn = conn_id, "WS ping");
                write.send(Message::Ping(vec![].into())).await?;
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Market-channel subscription message over a fixed token-id list.
fn build_subscribe_msg(token_ids: &[String]) -> String {
    serde_json::json!({
        "assets_ids": token_ids,
        "type": "market"
    })
    .to_string()
}
