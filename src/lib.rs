//! # cb-admin
//!
//! Design-document reconciliation and bulk document administration for
//! Couchbase buckets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   dd / docs  │──▶│  Connection  │──▶│    Bucket    │
//! │   workflows  │   │ (retry state)│   │ HTTP / memory│
//! └──────┬───────┘   └──────────────┘   └──────────────┘
//!        │
//!        ├── compare (cb-admin-core)   design-document diff
//!        ├── ddocs                     staging install protocol
//!        ├── admin_views               content-addressed filter views
//!        └── iterator + bulk           paged walk, copy / move / delete
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`retry`] | Exponential backoff for transient store errors |
//! | [`connection`] | Bucket handle with per-connection retry state |
//! | [`http`] | REST implementation of the bucket interface |
//! | [`ddocs`] | Design-document install, view helpers, export/import |
//! | [`admin_views`] | Administrative filter views |
//! | [`iterator`] | Paged view walk with bounded concurrency |
//! | [`bulk`] | Copy, move, delete, and dump over a filter view |
//! | [`dd`] | Export, diff, and upgrade workflows |
//! | [`report`] | Diff report rendering |
//! | [`progress`] | Bulk progress reporting |
//! | [`logging`] | Tracing subscriber setup |

pub mod admin_views;
pub mod bulk;
pub mod config;
pub mod connection;
pub mod dd;
pub mod ddocs;
pub mod http;
pub mod iterator;
pub mod logging;
pub mod progress;
pub mod report;
pub mod retry;
