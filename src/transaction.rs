use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Reason recorded on transactions completed by a simulated run.
pub const DRY_RUN_REASON: &str = "DRY_RUN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    RenameFile,
    RenameFolder,
    EditContentLine,
}

impl TransactionKind {
    /// Execution order: folders, then files, then content edits.
    pub fn rank(self) -> u8 {
        match self {
            TransactionKind::RenameFolder => 0,
            TransactionKind::RenameFile => 1,
            TransactionKind::EditContentLine => 2,
        }
    }

    pub fn is_rename(self) -> bool {
        !matches!(self, TransactionKind::EditContentLine)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionKind::RenameFile => "rename-file",
            TransactionKind::RenameFolder => "rename-folder",
            TransactionKind::EditContentLine => "edit-line",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    RetryLater,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Skipped
        )
    }
}

/// One planned mutation. `path` is the root-relative, `/`-separated path
/// at scan time and stays the transaction's identity after renames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_line_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_encoding: Option<String>,
    #[serde(default)]
    pub is_rtf: bool,
    pub status: TransactionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_content: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

/// Dedup identity across resumed runs.
pub type TransactionKey = (String, TransactionKind, Option<usize>);

impl Transaction {
    fn base(kind: TransactionKind, path: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            path,
            original_name: None,
            new_name: None,
            line_number: None,
            original_line_content: None,
            original_encoding: None,
            is_rtf: false,
            status: TransactionStatus::Pending,
            error_message: None,
            proposed_content: None,
            retry_count: 0,
            created_at: OffsetDateTime::now_utc(),
            last_attempt_at: None,
            processed_at: None,
        }
    }

    pub fn rename(kind: TransactionKind, path: impl Into<String>, original_name: impl Into<String>) -> Self {
        debug_assert!(kind.is_rename());
        let mut txn = Self::base(kind, path.into());
        txn.original_name = Some(original_name.into());
        txn
    }

    pub fn content_line(
        path: impl Into<String>,
        line_number: usize,
        original_line_content: impl Into<String>,
        encoding: &str,
        is_rtf: bool,
    ) -> Self {
        let mut txn = Self::base(TransactionKind::EditContentLine, path.into());
        txn.line_number = Some(line_number);
        txn.original_line_content = Some(original_line_content.into());
        txn.original_encoding = Some(encoding.to_string());
        txn.is_rtf = is_rtf;
        txn
    }

    pub fn key(&self) -> TransactionKey {
        (self.path.clone(), self.kind, self.line_number)
    }

    /// Number of path components; shallow entries run first.
    pub fn depth(&self) -> usize {
        self.path.split('/').filter(|part| !part.is_empty()).count()
    }

    pub fn is_dry_run_completion(&self) -> bool {
        self.status == TransactionStatus::Completed
            && self.error_message.as_deref() == Some(DRY_RUN_REASON)
    }

    /// Back to a fresh, never-attempted state.
    pub fn reset_to_pending(&mut self) {
        self.status = TransactionStatus::Pending;
        self.error_message = None;
        self.proposed_content = None;
        self.new_name = None;
        self.retry_count = 0;
    }

    pub fn mark(&mut self, status: TransactionStatus, message: Option<String>) {
        self.status = status;
        self.error_message = message;
        if status.is_terminal() {
            self.processed_at = Some(OffsetDateTime::now_utc());
        }
    }
}

/// Per-status counts over a whole transaction list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub dry_run: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retry_later: usize,
}

impl RunStatistics {
    pub fn from_transactions(transactions: &[Transaction]) -> Self {
        let mut stats = RunStatistics {
            total: transactions.len(),
            ..Default::default()
        };
        for txn in transactions {
            match txn.status {
                TransactionStatus::Pending => stats.pending += 1,
                TransactionStatus::InProgress => stats.in_progress += 1,
                TransactionStatus::Completed => {
                    stats.completed += 1;
                    if txn.is_dry_run_completion() {
                        stats.dry_run += 1;
                    }
                }
                TransactionStatus::Failed => stats.failed += 1,
                TransactionStatus::Skipped => stats.skipped += 1,
                TransactionStatus::RetryLater => stats.retry_later += 1,
            }
        }
        stats
    }

    pub fn print(&self, label: &str) {
        if self.total == 0 {
            println!("{label} summary: no transactions");
            return;
        }
        println!(
            "{label} summary: total={}, completed={} (dry-run={}), failed={}, skipped={}, pending={}, in-progress={}, retry-later={}",
            self.total,
            self.completed,
            self.dry_run,
            self.failed,
            self.skipped,
            self.pending,
            self.in_progress,
            self.retry_later
        );
    }
}
