//! Download Engine - The heart of FluxDM
//!
//! This module implements the segmented download engine with:
//! - Range probing (HEAD with a `bytes=0-0` fallback)
//! - Multi-segment parallel downloads over positional file writes
//! - Per-segment retry with exponential backoff
//! - Token bucket rate limiting (per download and global)
//! - Durable resume tokens (SQLite or JSON files)
//! - Clean pause/resume/cancel

mod download_task;
mod file;
mod manager;
mod persistence;
mod planner;
mod prober;
mod progress;
mod rate_limiter;
mod retry;
mod segment_worker;
mod transport;

pub use download_task::*;
pub use file::*;
pub use manager::*;
pub use persistence::*;
pub use planner::*;
pub use prober::*;
pub use progress::*;
pub use rate_limiter::*;
pub use retry::*;
pub use segment_worker::*;
pub use transport::*;
