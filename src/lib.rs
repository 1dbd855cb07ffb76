//! # Ingest Harness
//!
//! A checkpointed, resumable sync framework for pulling documents out of
//! external sources and into a local index.
//!
//! Connectors declare capabilities (load, poll, checkpointed, slim); the
//! scheduler dispatches on them, drives one page of network work per sync
//! call, and persists an opaque checkpoint blob after every applied batch.
//! A crashed or interrupted run resumes from its last persisted checkpoint,
//! and idempotent upsert-by-id makes the resulting at-least-once delivery
//! safe.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Connectors  │──▶│ Sync session │──▶│   SQLite    │
//! │  FS / Feed   │   │ (batches +   │   │ docs, ckpts │
//! └──────────────┘   │ checkpoints) │   │ leases      │
//!                    └──────┬───────┘   └─────────────┘
//!                           │
//!                    ┌──────▼───────┐
//!                    │  Scheduler   │  lease-guarded cycles,
//!                    │    (CLI)     │  one task per source
//!                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Items, failures, batches |
//! | [`checkpoint`] | Checkpoint types and blob (de)serialization |
//! | [`window`] | Effective time windows and day buckets |
//! | [`pagination`] | One-page-per-call pagination driver |
//! | [`failure`] | Per-item failure isolation |
//! | [`retry`] | Bounded exponential backoff |
//! | [`connector`] | Capability traits and source runtimes |
//! | [`runner`] | Batch-assembling sync session |
//! | [`scheduler`] | Lease-guarded sync and prune cycles |
//! | [`lock`] | TTL lease store |
//! | [`store`] | Checkpoint persistence and the index sink |
//! | [`connector_fs`] | Local filesystem connector |
//! | [`connector_feed`] | Paginated JSON feed connector |

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod connector_feed;
pub mod connector_fs;
pub mod db;
pub mod error;
pub mod failure;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod pagination;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod window;
