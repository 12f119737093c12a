//! The sync orchestration engine: durable per-account control loops that
//! fetch since a cursor, normalize vendor payloads, persist idempotently,
//! and advance monotonic watermarks only after committed writes.

pub mod backoff;
pub mod credential;
pub mod cursor;
pub mod gateway;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod runner;
pub mod traits;
