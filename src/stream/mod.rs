//! Streaming trade ingestion: a pool of WebSocket connections over a fixed
//! token universe, one shared bounded queue, one drain task batching writes.

pub mod listener;
pub mod messages;

pub use listener::{TradeListener, TRADE_LISTENER_UNIT};
