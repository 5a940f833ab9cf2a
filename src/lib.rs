//! Per-CPU hardware counter collection: perf ring buffers, a time-ordered
//! merge across CPUs and sliding-window aggregation per measured entity.

pub mod agent;
pub mod aggregate;
pub mod collector;
pub mod config;
pub mod perf;
pub mod protocol;
