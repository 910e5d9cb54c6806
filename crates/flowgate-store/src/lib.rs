//! SQLite implementations of the Flowgate storage traits.
//!
//! Both stores can share one database file; each opens its own connection
//! in WAL mode.

mod approvals;
mod checkpoints;
mod schema;

pub use approvals::SqliteApprovalRepository;
pub use checkpoints::SqliteCheckpointStore;
