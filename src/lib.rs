//! Transactional find-and-replace over a directory tree: plan renames and
//! line edits from a key/value mapping, persist the plan, then apply it one
//! step at a time with sandboxing, drift checks and retry.

pub mod diff;
pub mod encoding;
pub mod error;
pub mod executor;
pub mod files;
pub mod logging;
pub mod normalize;
pub mod paths;
pub mod replacement;
pub mod rtf;
pub mod run;
pub mod scanner;
pub mod store;
pub mod transaction;

pub use error::{ExecError, MappingError};
pub use executor::{ExecuteOptions, Executor, FileOps, LocalFs, RetryPolicy};
pub use replacement::{ReplacementTable, load_mapping};
pub use run::{Plan, RunConfig, Session, run};
pub use scanner::{ScanOptions, scan};
pub use store::TransactionStore;
pub use transaction::{RunStatistics, Transaction, TransactionKind, TransactionStatus};
