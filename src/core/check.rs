// Offline consistency checking over an independent copy-on-write view.
// Every violation is collected rather than stopping at the first, so an
// operator sees the whole picture before deciding what to do with a pool.
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::desc::{data_start, LogDesc};
use crate::core::error::Error;
use crate::core::pool::{OpenConfig, PoolSet};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckStatus {
    Consistent,
    Inconsistent,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckIssue {
    pub code: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckReport {
    pub path: PathBuf,
    pub status: CheckStatus,
    pub issues: Vec<CheckIssue>,
}

impl CheckReport {
    pub fn is_consistent(&self) -> bool {
        self.status == CheckStatus::Consistent
    }
}

/// Check a pool without mutating it. `Err` means the pool could not even be
/// examined (missing file, I/O failure, unreadable set header) — unknown,
/// as opposed to a report with [`CheckStatus::Inconsistent`]: known broken.
pub fn check(path: impl AsRef<Path>) -> Result<CheckReport, Error> {
    let path = path.as_ref();

    // The copy-on-write view bypasses the fail-fast descriptor validation a
    // normal open performs, so a broken descriptor still yields a verdict.
    let set = PoolSet::open(
        path,
        OpenConfig {
            read_only: false,
            copy_on_write: true,
        },
    )?;

    let desc = LogDesc::read(set.map());
    let mut issues = Vec::new();

    if desc.start_offset != data_start() {
        issues.push(issue(
            "start-offset",
            format!(
                "wrong start offset {} (expected {})",
                desc.start_offset,
                data_start()
            ),
        ));
    }
    if desc.end_offset != set.pool_size() {
        issues.push(issue(
            "end-offset",
            format!(
                "end offset {} does not match pool size {}",
                desc.end_offset,
                set.pool_size()
            ),
        ));
    }
    if desc.end_offset != set.mapped_len() as u64 {
        issues.push(issue(
            "mapped-size",
            format!(
                "end offset {} does not match mapped size {}",
                desc.end_offset,
                set.mapped_len()
            ),
        ));
    }
    if desc.start_offset > desc.end_offset {
        issues.push(issue(
            "offset-order",
            format!(
                "start offset {} beyond end offset {}",
                desc.start_offset, desc.end_offset
            ),
        ));
    }
    if desc.write_offset < desc.start_offset {
        issues.push(issue(
            "write-offset",
            format!(
                "write offset {} before start offset {}",
                desc.write_offset, desc.start_offset
            ),
        ));
    }
    if desc.write_offset > desc.end_offset {
        issues.push(issue(
            "write-offset",
            format!(
                "write offset {} beyond end offset {}",
                desc.write_offset, desc.end_offset
            ),
        ));
    }

    let status = if issues.is_empty() {
        CheckStatus::Consistent
    } else {
        CheckStatus::Inconsistent
    };
    debug!(path = %path.display(), ?status, issues = issues.len(), "check");

    Ok(CheckReport {
        path: path.to_path_buf(),
        status,
        issues,
    })
}

fn issue(code: &'static str, message: String) -> CheckIssue {
    CheckIssue { code, message }
}
