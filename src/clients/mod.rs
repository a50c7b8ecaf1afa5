//! Thin request/response wrappers around Polymarket's REST APIs.
//! Transport failures surface as errors; collectors are responsible for
//! catching them.

pub mod clob;
pub mod gamma;

pub use clob::ClobClient;
pub use gamma::GammaClient;
