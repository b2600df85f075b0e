use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::files::write_via_temp;
use crate::transaction::{Transaction, TransactionKey, TransactionStatus};

/// The JSON transaction log plus its `.bak` sibling.
#[derive(Debug, Clone)]
pub struct TransactionStore {
    path: PathBuf,
}

impl TransactionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("transactions.json");
        self.path.with_file_name(format!("{name}.bak"))
    }

    /// Back up the current log, then replace it with `transactions`.
    pub fn save(&self, transactions: &[Transaction]) -> Result<()> {
        if self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup)
                .with_context(|| format!("creating backup {}", backup.display()))?;
        }
        let data = serde_json::to_vec_pretty(transactions)?;
        write_via_temp(&self.path, &data, None)
            .with_context(|| format!("writing {}", self.path.display()))
    }

    /// Primary log first, then the backup. `None` when neither holds a
    /// readable transaction list.
    pub fn load(&self) -> Option<Vec<Transaction>> {
        for candidate in [self.path.clone(), self.backup_path()] {
            if !candidate.exists() {
                continue;
            }
            match read_log(&candidate) {
                Ok(transactions) => {
                    debug!(
                        "loaded {} transactions from {}",
                        transactions.len(),
                        candidate.display()
                    );
                    return Some(transactions);
                }
                Err(err) => warn!("ignoring unreadable log {}: {err:#}", candidate.display()),
            }
        }
        None
    }
}

fn read_log(path: &Path) -> Result<Vec<Transaction>> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let transactions = serde_json::from_slice(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(transactions)
}

/// Fold a fresh scan into a prior log. Known keys are kept as they are,
/// except on force-rescanned paths where an unfinished record is refreshed
/// from the new scan.
pub fn merge(
    mut prior: Vec<Transaction>,
    fresh: Vec<Transaction>,
    force_rescan: &HashSet<String>,
) -> Vec<Transaction> {
    let mut index: HashMap<TransactionKey, usize> = prior
        .iter()
        .enumerate()
        .map(|(idx, txn)| (txn.key(), idx))
        .collect();
    let mut appended = 0usize;
    let mut refreshed = 0usize;

    for txn in fresh {
        match index.get(&txn.key()).copied() {
            Some(idx) => {
                let existing = &mut prior[idx];
                if force_rescan.contains(&txn.path)
                    && (existing.status != TransactionStatus::Completed
                        || existing.is_dry_run_completion())
                {
                    existing.original_name = txn.original_name;
                    existing.original_line_content = txn.original_line_content;
                    existing.original_encoding = txn.original_encoding;
                    existing.is_rtf = txn.is_rtf;
                    existing.reset_to_pending();
                    refreshed += 1;
                }
            }
            None => {
                index.insert(txn.key(), prior.len());
                prior.push(txn);
                appended += 1;
            }
        }
    }

    debug!("merge appended {appended} and refreshed {refreshed} transactions");
    prior
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionKind;
    use tempfile::tempdir;

    fn sample() -> Vec<Transaction> {
        vec![
            Transaction::rename(TransactionKind::RenameFile, "a_flojoy.txt", "a_flojoy.txt"),
            Transaction::content_line("a_flojoy.txt", 1, "flojoy\n", "UTF-8", false),
        ]
    }

    #[test]
    fn save_keeps_a_backup_of_the_previous_log() {
        let temp = tempdir().expect("temp dir");
        let store = TransactionStore::new(temp.path().join("planned_transactions.json"));
        let first = sample();
        store.save(&first[..1]).expect("first save");
        assert!(!store.backup_path().exists());

        store.save(&first).expect("second save");
        let backup: Vec<Transaction> =
            serde_json::from_slice(&fs::read(store.backup_path()).expect("backup")).expect("json");
        assert_eq!(backup.len(), 1);
        assert_eq!(store.load().expect("load").len(), 2);
    }

    #[test]
    fn load_falls_back_to_backup_when_primary_is_corrupt() {
        let temp = tempdir().expect("temp dir");
        let store = TransactionStore::new(temp.path().join("log.json"));
        store.save(&sample()).expect("save");
        store.save(&sample()).expect("save again");
        fs::write(store.path(), b"{ not json").expect("corrupt");

        let loaded = store.load().expect("backup used");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn load_reports_absence_rather_than_failing() {
        let temp = tempdir().expect("temp dir");
        let store = TransactionStore::new(temp.path().join("missing.json"));
        assert!(store.load().is_none());
        fs::write(store.path(), b"garbage").expect("corrupt");
        assert!(store.load().is_none());
    }

    #[test]
    fn merge_skips_known_keys_and_appends_new_ones() {
        let mut prior = sample();
        prior[0].mark(TransactionStatus::Completed, None);
        let mut fresh = sample();
        fresh.push(Transaction::content_line("a_flojoy.txt", 4, "flojoy\n", "UTF-8", false));
        let prior_ids: Vec<_> = prior.iter().map(|t| t.id.clone()).collect();

        let merged = merge(prior, fresh, &HashSet::new());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, prior_ids[0]);
        assert_eq!(merged[1].id, prior_ids[1]);
        assert_eq!(merged[2].line_number, Some(4));
    }

    #[test]
    fn merge_refreshes_unfinished_records_on_rescanned_paths() {
        let mut prior = sample();
        prior[0].mark(TransactionStatus::Completed, None);
        prior[1].mark(TransactionStatus::Failed, Some("content drifted".into()));
        let mut fresh = sample();
        fresh[1].original_line_content = Some("Flojoy edited\n".into());
        let force: HashSet<String> = ["a_flojoy.txt".to_string()].into();

        let merged = merge(prior, fresh, &force);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].status, TransactionStatus::Completed);
        assert_eq!(merged[1].status, TransactionStatus::Pending);
        assert_eq!(merged[1].original_line_content.as_deref(), Some("Flojoy edited\n"));
        assert!(merged[1].error_message.is_none());
    }
}
