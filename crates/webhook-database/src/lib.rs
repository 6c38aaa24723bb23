//! SQLite persistence for webhook delivery events.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread ([`AsyncDatabase`])
//! - Synchronous single-connection wrapper ([`Database`])
//! - Versioned migrations
//! - Model types for the `webhook_events` table
//! - Query functions taking `&Connection`, usable from either wrapper
//!
//! # Architecture
//!
//! Every state change is a single guarded `UPDATE ... RETURNING`. Callers
//! pass the statuses a transition may start from; a `None` result means the
//! guard did not match (row missing or in the wrong state).
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let claimed = db
//!     .call(move |conn| queries::claim_due(conn, now, &[DeliveryStatus::Pending]))
//!     .await?;
//! ```

mod db;
mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
