//! Purpose: Crash-consistent append-only log pools over memory-mapped files.
//! Exports: `LogPool`, `check`, configuration and error types, `core` modules.
//! Role: Library crate backing the `palog` binary and embedding users.
//! Invariants: An append is all-or-nothing across crashes.
//! Invariants: A reopened pool never exposes bytes past the durable write offset.
pub mod core;

pub use crate::core::check::{check, CheckIssue, CheckReport, CheckStatus};
pub use crate::core::ctl::{Ctl, QueryKind};
pub use crate::core::error::{to_exit_code, Error, ErrorKind};
pub use crate::core::log::LogPool;
pub use crate::core::pmem::MutationHook;
pub use crate::core::pool::{CreateConfig, OpenConfig, MIN_POOL};
