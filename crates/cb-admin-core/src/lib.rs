//! # cb-admin core
//!
//! Pure logic for cb-admin: the design-document data model, the
//! reconciliation engine that diffs two design-document sets, the
//! content-addressed admin filter view generator, and the [`store::Bucket`]
//! trait that abstracts a connection to one bucket.
//!
//! This crate performs no network or filesystem I/O and has no runtime
//! dependency on tokio. The in-memory [`store::memory::InMemoryBucket`] is
//! provided for tests and dry runs.

pub mod admin_view;
pub mod diff;
pub mod models;
pub mod store;
