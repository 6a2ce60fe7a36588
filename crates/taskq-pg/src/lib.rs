//! taskq-pg
//!
//! PostgreSQL-backed [`TaskStore`](taskq_core::ports::TaskStore) for taskq.
//! Schema lives in `migrations/` and is applied with [`PgTaskStore::migrate`].

mod store;

pub use store::PgTaskStore;
