//! # Portcullis Core
//!
//! Core library for the Portcullis multi-tenant API gateway.
//!
//! This crate provides the foundational components for:
//!
//! - **[`kv`]**: Binary key/value store abstraction with TTL, atomic
//!   increments, leases and pub/sub. Backed by a shared Redis deployment or a
//!   thread-safe in-process fallback.
//!
//! - **[`cache`]**: Response caching with TTL + stale-while-revalidate,
//!   cross-instance single-flight coalescing, and a bloom-filtered negative
//!   cache for repeated 404s.
//!
//! - **[`limit`]**: Token-bucket and sliding-window rate limiting plus
//!   calendar-period quota counters, all coordinated through the KV store.
//!
//! - **[`abuse`]**: EWMA/z-score anomaly detection with temporary soft
//!   blocks.
//!
//! - **[`upstream`]**: Bounded-timeout HTTP fetches with header hygiene and
//!   outcome classification.
//!
//! - **[`pipeline`]**: The gateway request engine composing authentication,
//!   admission control, the cache path and proxy execution.
//!
//! - **[`catalog`]**: Copy-on-write view of tenants, API keys, routes and
//!   cache policies, refreshed from the persistence store and invalidated
//!   over pub/sub.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌──────────────┐
//! │ Authenticate │ ─── Unknown key / inactive tenant ──► 401
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ Route Match  │ ─── No route ──► 404
//! └──────┬───────┘
//!        ▼
//! ┌─────────────────────────────┐
//! │ Abuse / Rate Limit / Quota  │ ─── Denied ──► 429
//! └──────┬──────────────────────┘
//!        ▼
//! ┌──────────────┐     HIT / STALE
//! │ Cache Lookup │ ───────────────► Cached Response
//! └──────┬───────┘
//!        │ MISS
//!        ▼
//! ┌───────────────────┐
//! │ Single-flight     │ ──► Upstream HTTP ──► Store ──► Response
//! │ (KV lease+pubsub) │
//! └───────────────────┘
//! ```

pub mod abuse;
pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod kv;
pub mod limit;
pub mod metrics;
pub mod pipeline;
pub mod request_log;
pub mod upstream;
