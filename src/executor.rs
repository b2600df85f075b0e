use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::encoding;
use crate::error::ExecError;
use crate::files::{TEMP_PREFIX, write_via_temp};
use crate::paths::{PathTranslator, Sandbox, check_new_name};
use crate::replacement::ReplacementTable;
use crate::store::TransactionStore;
use crate::transaction::{
    DRY_RUN_REASON, RunStatistics, Transaction, TransactionKind, TransactionStatus,
};

/// Longest uninterrupted sleep between retry passes, so a stop request is
/// noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(1);

const RTF_SKIP_MESSAGE: &str =
    "RTF content is never rewritten; formatting must be preserved (only the file name may change)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_passes: usize,
    /// Overall budget for the retry loop; `None` runs until `max_passes`.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_passes: 500,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// `0` means unbounded; anything between 0 and 1 is raised to 1 minute.
    pub fn with_timeout_minutes(mut self, minutes: f64) -> Self {
        self.timeout = if minutes <= 0.0 || !minutes.is_finite() {
            None
        } else {
            Some(Duration::from_secs_f64(minutes.max(1.0) * 60.0))
        };
        self
    }

    /// Delay before the next attempt after `retry_count` failures.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub resume: bool,
    pub skip_scan: bool,
    pub skip_file_renames: bool,
    pub skip_folder_renames: bool,
    pub skip_content: bool,
    pub retry: RetryPolicy,
}

impl ExecuteOptions {
    fn skip_reason(&self, kind: TransactionKind) -> Option<&'static str> {
        match kind {
            TransactionKind::RenameFile if self.skip_file_renames => {
                Some("file renaming disabled for this run")
            }
            TransactionKind::RenameFolder if self.skip_folder_renames => {
                Some("folder renaming disabled for this run")
            }
            TransactionKind::EditContentLine if self.skip_content => {
                Some("content editing disabled for this run")
            }
            _ => None,
        }
    }
}

/// The filesystem mutations the executor performs.
pub trait FileOps {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Atomically replace the contents of an existing file, keeping its permissions.
    fn replace_contents(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileOps for LocalFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn replace_contents(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let permissions = fs::metadata(path)?.permissions();
        write_via_temp(path, data, Some(permissions))
    }
}

enum Done {
    Completed(Option<String>),
    Skipped(String),
}

/// Applies planned transactions one at a time, persisting the log after
/// every state change.
pub struct Executor<'a, F = LocalFs> {
    table: &'a ReplacementTable,
    store: &'a TransactionStore,
    options: ExecuteOptions,
    sandbox: Sandbox,
    translator: PathTranslator,
    fs: F,
    stop: Option<Arc<AtomicBool>>,
    next_attempt: HashMap<String, Instant>,
}

impl<'a> Executor<'a, LocalFs> {
    pub fn new(
        root: &Path,
        table: &'a ReplacementTable,
        store: &'a TransactionStore,
        options: ExecuteOptions,
    ) -> Result<Self> {
        let sandbox =
            Sandbox::new(root).with_context(|| format!("resolving root {}", root.display()))?;
        let translator = PathTranslator::new(sandbox.root());
        Ok(Self {
            table,
            store,
            options,
            sandbox,
            translator,
            fs: LocalFs,
            stop: None,
            next_attempt: HashMap::new(),
        })
    }
}

impl<'a, F: FileOps> Executor<'a, F> {
    pub fn with_file_ops<G: FileOps>(self, fs: G) -> Executor<'a, G> {
        Executor {
            table: self.table,
            store: self.store,
            options: self.options,
            sandbox: self.sandbox,
            translator: self.translator,
            fs,
            stop: self.stop,
            next_attempt: self.next_attempt,
        }
    }

    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn execute(&mut self, transactions: &mut Vec<Transaction>) -> Result<RunStatistics> {
        self.bootstrap(transactions);
        self.translator = PathTranslator::from_completed(self.sandbox.root(), transactions);
        transactions.sort_by(|a, b| {
            a.kind
                .rank()
                .cmp(&b.kind.rank())
                .then_with(|| a.depth().cmp(&b.depth()))
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.line_number.cmp(&b.line_number))
        });
        self.store.save(transactions)?;

        let deadline = self
            .options
            .retry
            .timeout
            .map(|timeout| Instant::now() + timeout);
        self.run_pass(transactions)?;
        let mut passes = 1usize;

        loop {
            if self.stop_requested() {
                info!("stop requested; remaining transactions stay queued for --resume");
                break;
            }
            if !transactions
                .iter()
                .any(|txn| txn.status == TransactionStatus::RetryLater)
            {
                break;
            }
            if passes >= self.options.retry.max_passes {
                warn!("giving up after {passes} passes");
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("retry budget exhausted");
                break;
            }
            self.wait_for_next_retry(transactions, deadline);
            if self.stop_requested()
                || deadline.is_some_and(|deadline| Instant::now() >= deadline)
            {
                continue;
            }
            passes += 1;
            debug!("retry pass {passes}");
            self.run_pass(transactions)?;
        }

        if !self.stop_requested() {
            let mut gave_up = 0usize;
            for txn in transactions.iter_mut() {
                if txn.status == TransactionStatus::RetryLater {
                    let last = txn.error_message.take().unwrap_or_default();
                    txn.mark(
                        TransactionStatus::Failed,
                        Some(format!(
                            "timed out after {} attempts; last error: {last}",
                            txn.retry_count
                        )),
                    );
                    gave_up += 1;
                }
            }
            if gave_up > 0 {
                self.store.save(transactions)?;
            }
        }

        Ok(RunStatistics::from_transactions(transactions))
    }

    /// A dry run never counts as done, and a crash can leave an item
    /// mid-flight; both go back to Pending. Resume also retries failures.
    fn bootstrap(&self, transactions: &mut [Transaction]) {
        if !(self.options.resume || self.options.skip_scan) {
            return;
        }
        let mut reset = 0usize;
        for txn in transactions.iter_mut() {
            let stale = txn.is_dry_run_completion()
                || txn.status == TransactionStatus::InProgress
                || (self.options.resume && txn.status == TransactionStatus::Failed);
            if stale {
                txn.reset_to_pending();
                reset += 1;
            }
        }
        if reset > 0 {
            info!("{reset} transactions reset to pending");
        }
    }

    fn run_pass(&mut self, transactions: &mut [Transaction]) -> Result<()> {
        for idx in 0..transactions.len() {
            if self.stop_requested() {
                return Ok(());
            }
            let status = transactions[idx].status;
            if status.is_terminal() {
                continue;
            }
            if let Some(reason) = self.options.skip_reason(transactions[idx].kind) {
                transactions[idx].mark(TransactionStatus::Skipped, Some(reason.to_string()));
                self.store.save(transactions)?;
                continue;
            }
            if status == TransactionStatus::RetryLater {
                let due = self
                    .next_attempt
                    .get(&transactions[idx].id)
                    .is_none_or(|at| *at <= Instant::now());
                if !due {
                    continue;
                }
            }

            {
                let txn = &mut transactions[idx];
                txn.status = TransactionStatus::InProgress;
                txn.last_attempt_at = Some(OffsetDateTime::now_utc());
            }
            self.store.save(transactions)?;
            let result = self.attempt(&mut transactions[idx]);
            self.settle(&mut transactions[idx], result);
            self.store.save(transactions)?;
        }
        Ok(())
    }

    fn settle(&mut self, txn: &mut Transaction, result: Result<Done, ExecError>) {
        match result {
            Ok(Done::Completed(note)) => {
                debug!("completed {} {}", txn.kind, txn.path);
                self.next_attempt.remove(&txn.id);
                txn.mark(TransactionStatus::Completed, note);
            }
            Ok(Done::Skipped(reason)) => {
                debug!("skipped {} {}: {reason}", txn.kind, txn.path);
                self.next_attempt.remove(&txn.id);
                txn.mark(TransactionStatus::Skipped, Some(reason));
            }
            Err(err) if err.is_retryable() => {
                txn.retry_count += 1;
                let delay = self.options.retry.backoff(txn.retry_count);
                self.next_attempt
                    .insert(txn.id.clone(), Instant::now() + delay);
                warn!(
                    "{} {} will be retried in {delay:?} (attempt {}): {err}",
                    txn.kind, txn.path, txn.retry_count
                );
                txn.mark(TransactionStatus::RetryLater, Some(err.to_string()));
            }
            Err(err) => {
                warn!("{} {} failed: {err}", txn.kind, txn.path);
                self.next_attempt.remove(&txn.id);
                txn.mark(TransactionStatus::Failed, Some(err.to_string()));
            }
        }
    }

    fn wait_for_next_retry(&self, transactions: &[Transaction], deadline: Option<Instant>) {
        let now = Instant::now();
        let mut until = transactions
            .iter()
            .filter(|txn| txn.status == TransactionStatus::RetryLater)
            .filter_map(|txn| self.next_attempt.get(&txn.id).copied())
            .min()
            .unwrap_or(now);
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }
        loop {
            let now = Instant::now();
            if now >= until || self.stop_requested() {
                return;
            }
            thread::sleep((until - now).min(MAX_SLEEP_SLICE));
        }
    }

    fn attempt(&mut self, txn: &mut Transaction) -> Result<Done, ExecError> {
        match txn.kind {
            TransactionKind::RenameFile | TransactionKind::RenameFolder => self.rename(txn),
            TransactionKind::EditContentLine => self.edit_line(txn),
        }
    }

    fn rename(&mut self, txn: &mut Transaction) -> Result<Done, ExecError> {
        let original_name = txn
            .original_name
            .clone()
            .ok_or_else(|| ExecError::Fatal("rename without an original name".into()))?;
        let new_name = self.table.substitute(&original_name).into_owned();
        if new_name == original_name {
            return Ok(Done::Skipped("name unchanged by the mapping".into()));
        }
        if self.options.dry_run {
            self.translator.record_rename(&txn.path, &new_name);
            txn.new_name = Some(new_name);
            return Ok(Done::Completed(Some(DRY_RUN_REASON.into())));
        }

        check_new_name(&new_name)?;
        let source = self.translator.resolve(&txn.path);
        let source = self.sandbox.check_entry(&source)?;
        let destination = self.sandbox.check_entry(&source.with_file_name(&new_name))?;
        if let Err(err) = fs::symlink_metadata(&source) {
            // A crash between the rename and the log write leaves the entry
            // already under its new name.
            if err.kind() == io::ErrorKind::NotFound && fs::symlink_metadata(&destination).is_ok() {
                info!("{} was already renamed to {new_name}", txn.path);
                self.translator.record_rename(&txn.path, &new_name);
                txn.new_name = Some(new_name);
                return Ok(Done::Completed(Some("already renamed".into())));
            }
            return Err(ExecError::from_io(
                &err,
                &format!("inspecting {}", source.display()),
            ));
        }

        if fs::symlink_metadata(&destination).is_ok() {
            if !same_entry(&source, &destination) {
                return Ok(Done::Skipped(format!(
                    "{} already exists; not overwriting",
                    destination.display()
                )));
            }
            // Case-only rename on a case-insensitive filesystem.
            let interim = source.with_file_name(format!("{TEMP_PREFIX}{new_name}"));
            self.fs
                .rename(&source, &interim)
                .map_err(|err| ExecError::from_io(&err, &format!("renaming {}", source.display())))?;
            if let Err(err) = self.fs.rename(&interim, &destination) {
                if let Err(rollback) = self.fs.rename(&interim, &source) {
                    warn!(
                        "unable to move {} back to {}: {rollback}",
                        interim.display(),
                        source.display()
                    );
                    return Err(ExecError::Fatal(format!(
                        "renaming {}: {err}; rollback failed, entry left at {}: {rollback}",
                        source.display(),
                        interim.display()
                    )));
                }
                return Err(ExecError::from_io(
                    &err,
                    &format!("renaming {}", source.display()),
                ));
            }
        } else {
            self.fs
                .rename(&source, &destination)
                .map_err(|err| ExecError::from_io(&err, &format!("renaming {}", source.display())))?;
        }

        info!("renamed {} -> {new_name}", txn.path);
        self.translator.record_rename(&txn.path, &new_name);
        txn.new_name = Some(new_name);
        Ok(Done::Completed(None))
    }

    fn edit_line(&mut self, txn: &mut Transaction) -> Result<Done, ExecError> {
        let original = txn
            .original_line_content
            .clone()
            .ok_or_else(|| ExecError::Fatal("content edit without recorded line".into()))?;
        let line_number = txn
            .line_number
            .filter(|line| *line >= 1)
            .ok_or_else(|| ExecError::Fatal("content edit without a valid line number".into()))?;
        let replacement = self.table.substitute(&original).into_owned();
        if replacement == original {
            return Ok(Done::Skipped("line unchanged by the mapping".into()));
        }
        if txn.is_rtf {
            return Ok(Done::Skipped(RTF_SKIP_MESSAGE.into()));
        }
        if self.options.dry_run {
            txn.proposed_content = Some(replacement);
            return Ok(Done::Completed(Some(DRY_RUN_REASON.into())));
        }

        let label = txn.original_encoding.as_deref().unwrap_or("utf-8");
        let file_encoding = encoding::for_label(label)
            .ok_or_else(|| ExecError::Fatal(format!("unknown encoding '{label}'")))?;
        let target = self.translator.resolve(&txn.path);
        let target = self.sandbox.check_target(&target)?;
        let bytes = fs::read(&target)
            .map_err(|err| ExecError::from_io(&err, &format!("reading {}", target.display())))?;
        let decoded = encoding::decode_with(&bytes, file_encoding);
        if decoded.had_errors {
            return Err(ExecError::Fatal(format!(
                "{} no longer decodes as {}",
                target.display(),
                file_encoding.name()
            )));
        }

        let lines = encoding::split_lines_keep_ends(&decoded.text);
        let idx = line_number - 1;
        if lines.get(idx).copied() != Some(original.as_str()) {
            return Err(ExecError::ContentDrift { line: line_number });
        }
        let rebuilt: String = lines
            .iter()
            .enumerate()
            .map(|(i, line)| if i == idx { replacement.as_str() } else { *line })
            .collect();
        let (encoded, had_errors) = encoding::encode_like(&decoded, &rebuilt);
        if had_errors {
            return Err(ExecError::Fatal(format!(
                "replacement text cannot be represented in {}",
                file_encoding.name()
            )));
        }
        self.fs
            .replace_contents(&target, &encoded)
            .map_err(|err| ExecError::from_io(&err, &format!("writing {}", target.display())))?;

        debug!("rewrote line {line_number} of {}", txn.path);
        txn.proposed_content = Some(replacement);
        Ok(Done::Completed(None))
    }
}

#[cfg(unix)]
fn same_entry(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_entry(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use tempfile::{TempDir, tempdir};

    use crate::scanner::{ScanOptions, scan};

    fn table() -> ReplacementTable {
        ReplacementTable::new([
            ("flojoy", "atlasvibe".to_string()),
            ("Flojoy", "Atlasvibe".to_string()),
        ])
        .expect("table")
    }

    struct Fixture {
        root: TempDir,
        _logs: TempDir,
        store: TransactionStore,
        table: ReplacementTable,
    }

    fn fixture() -> Fixture {
        let root = tempdir().expect("root");
        let logs = tempdir().expect("logs");
        let store = TransactionStore::new(logs.path().join("planned_transactions.json"));
        Fixture {
            root,
            _logs: logs,
            store,
            table: table(),
        }
    }

    impl Fixture {
        fn plan(&self) -> Vec<Transaction> {
            scan(self.root.path(), &self.table, &ScanOptions::default(), None)
                .expect("scan")
                .transactions
        }

        fn fast_options(&self) -> ExecuteOptions {
            ExecuteOptions {
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                    max_passes: 50,
                    timeout: None,
                },
                ..Default::default()
            }
        }

        fn run(&self, transactions: &mut Vec<Transaction>, options: ExecuteOptions) -> RunStatistics {
            Executor::new(self.root.path(), &self.table, &self.store, options)
                .expect("executor")
                .execute(transactions)
                .expect("execute")
        }
    }

    /// Fails the first `failures` renames with a transient error.
    struct FlakyFs {
        failures: Cell<u32>,
        attempts: RefCell<Vec<Instant>>,
    }

    impl FlakyFs {
        fn new(failures: u32) -> Self {
            Self {
                failures: Cell::new(failures),
                attempts: RefCell::new(Vec::new()),
            }
        }
    }

    impl FileOps for FlakyFs {
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.attempts.borrow_mut().push(Instant::now());
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
            }
            LocalFs.rename(from, to)
        }

        fn replace_contents(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            LocalFs.replace_contents(path, data)
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn timeout_minutes_are_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.with_timeout_minutes(0.0).timeout, None);
        assert_eq!(
            policy.with_timeout_minutes(0.2).timeout,
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            policy.with_timeout_minutes(2.5).timeout,
            Some(Duration::from_secs(150))
        );
    }

    #[test]
    fn folders_then_files_then_lines_in_depth_order() {
        let fx = fixture();
        fs::create_dir_all(fx.root.path().join("flojoy/flojoy_sub")).expect("dirs");
        fs::write(fx.root.path().join("flojoy/flojoy_sub/flojoy.txt"), "flojoy\n").expect("file");
        let mut transactions = fx.plan();
        transactions.reverse();

        fx.run(&mut transactions, fx.fast_options());
        let order: Vec<_> = transactions
            .iter()
            .map(|t| (t.kind, t.path.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (TransactionKind::RenameFolder, "flojoy"),
                (TransactionKind::RenameFolder, "flojoy/flojoy_sub"),
                (TransactionKind::RenameFile, "flojoy/flojoy_sub/flojoy.txt"),
                (TransactionKind::EditContentLine, "flojoy/flojoy_sub/flojoy.txt"),
            ]
        );
        assert!(transactions
            .iter()
            .all(|t| t.status == TransactionStatus::Completed));
        let moved = fx.root.path().join("atlasvibe/atlasvibe_sub/atlasvibe.txt");
        assert_eq!(fs::read_to_string(moved).expect("moved file"), "atlasvibe\n");
    }

    #[test]
    fn dry_run_touches_nothing() {
        let fx = fixture();
        fs::create_dir(fx.root.path().join("flojoy_dir")).expect("dir");
        fs::write(fx.root.path().join("flojoy_dir/flojoy.txt"), "Flojoy rocks\n").expect("file");
        let mut transactions = fx.plan();

        let options = ExecuteOptions {
            dry_run: true,
            ..fx.fast_options()
        };
        let stats = fx.run(&mut transactions, options);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.dry_run, 3);
        assert!(transactions.iter().all(Transaction::is_dry_run_completion));
        assert_eq!(
            fs::read_to_string(fx.root.path().join("flojoy_dir/flojoy.txt")).expect("untouched"),
            "Flojoy rocks\n"
        );
        let line = transactions
            .iter()
            .find(|t| t.kind == TransactionKind::EditContentLine)
            .expect("line");
        assert_eq!(line.proposed_content.as_deref(), Some("Atlasvibe rocks\n"));
    }

    #[test]
    fn drifted_line_is_not_overwritten() {
        let fx = fixture();
        let file = fx.root.path().join("notes.txt");
        fs::write(&file, "flojoy one\n").expect("file");
        let mut transactions = fx.plan();
        fs::write(&file, "someone else edited flojoy\n").expect("edit");

        let stats = fx.run(&mut transactions, fx.fast_options());
        assert_eq!(stats.failed, 1);
        assert!(transactions[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("content drifted"));
        assert_eq!(
            fs::read_to_string(&file).expect("read"),
            "someone else edited flojoy\n"
        );
    }

    #[test]
    fn existing_destination_is_never_clobbered() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.cfg"), "old").expect("source");
        fs::write(fx.root.path().join("atlasvibe.cfg"), "keep").expect("destination");
        let mut transactions = fx.plan();

        fx.run(&mut transactions, fx.fast_options());
        assert_eq!(transactions[0].status, TransactionStatus::Skipped);
        assert_eq!(
            fs::read_to_string(fx.root.path().join("atlasvibe.cfg")).expect("read"),
            "keep"
        );
    }

    #[test]
    fn crlf_and_permissions_survive_a_line_edit() {
        let fx = fixture();
        let file = fx.root.path().join("script.sh");
        fs::write(&file, "#!/bin/sh\r\necho flojoy\r\nexit 0\r\n").expect("file");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        let mut transactions = fx.plan();

        fx.run(&mut transactions, fx.fast_options());
        assert_eq!(
            fs::read_to_string(&file).expect("read"),
            "#!/bin/sh\r\necho atlasvibe\r\nexit 0\r\n"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&file).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn transient_failures_are_retried_with_growing_delay() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.dat"), "x").expect("file");
        let mut transactions = fx.plan();
        let options = ExecuteOptions {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(40),
                max_passes: 50,
                timeout: None,
            },
            ..Default::default()
        };
        let flaky = FlakyFs::new(3);

        let mut executor = Executor::new(fx.root.path(), &fx.table, &fx.store, options)
            .expect("executor")
            .with_file_ops(flaky);
        let stats = executor.execute(&mut transactions).expect("execute");

        assert_eq!(stats.completed, 1);
        assert_eq!(transactions[0].retry_count, 3);
        assert!(transactions[0].error_message.is_none());
        assert!(fx.root.path().join("atlasvibe.dat").exists());
        let attempts = executor.fs.attempts.borrow();
        assert_eq!(attempts.len(), 4);
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(20));
        assert!(attempts[2] - attempts[1] >= Duration::from_millis(40));
        assert!(attempts[3] - attempts[2] >= Duration::from_millis(40));
    }

    #[test]
    fn persistent_lock_fails_once_the_budget_runs_out() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.dat"), "x").expect("file");
        let mut transactions = fx.plan();
        let options = ExecuteOptions {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                max_passes: 500,
                timeout: Some(Duration::from_millis(80)),
            },
            ..Default::default()
        };

        let stats = Executor::new(fx.root.path(), &fx.table, &fx.store, options)
            .expect("executor")
            .with_file_ops(FlakyFs::new(u32::MAX))
            .execute(&mut transactions)
            .expect("execute");

        assert_eq!(stats.failed, 1);
        assert!(transactions[0].retry_count >= 1);
        assert!(transactions[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("timed out after"));
        assert!(fx.root.path().join("flojoy.dat").exists());
    }

    #[test]
    fn skip_flags_mark_pending_work_skipped() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.txt"), "flojoy\n").expect("file");
        let mut transactions = fx.plan();
        let options = ExecuteOptions {
            skip_content: true,
            ..fx.fast_options()
        };

        fx.run(&mut transactions, options);
        let line = transactions
            .iter()
            .find(|t| t.kind == TransactionKind::EditContentLine)
            .expect("line");
        assert_eq!(line.status, TransactionStatus::Skipped);
        assert_eq!(
            fs::read_to_string(fx.root.path().join("atlasvibe.txt")).expect("renamed"),
            "flojoy\n"
        );
    }

    #[test]
    fn rtf_content_is_skipped_but_file_renamed() {
        let fx = fixture();
        let original = r"{\rtf1\ansi Flojoy rocks\par}";
        fs::write(fx.root.path().join("flojoy.rtf"), original).expect("rtf");
        let mut transactions = fx.plan();

        fx.run(&mut transactions, fx.fast_options());
        let line = transactions
            .iter()
            .find(|t| t.kind == TransactionKind::EditContentLine)
            .expect("line");
        assert_eq!(line.status, TransactionStatus::Skipped);
        assert_eq!(
            fs::read_to_string(fx.root.path().join("atlasvibe.rtf")).expect("renamed"),
            original
        );
    }

    #[test]
    fn resume_resets_dry_runs_and_failures() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.txt"), "flojoy\n").expect("file");
        let mut transactions = fx.plan();
        let dry = ExecuteOptions {
            dry_run: true,
            ..fx.fast_options()
        };
        fx.run(&mut transactions, dry);
        assert!(fx.root.path().join("flojoy.txt").exists());

        let resume = ExecuteOptions {
            resume: true,
            ..fx.fast_options()
        };
        let stats = fx.run(&mut transactions, resume);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.dry_run, 0);
        assert_eq!(
            fs::read_to_string(fx.root.path().join("atlasvibe.txt")).expect("renamed"),
            "atlasvibe\n"
        );
    }

    #[test]
    fn stop_signal_leaves_work_queued() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.txt"), "flojoy\n").expect("file");
        let mut transactions = fx.plan();
        let stop = Arc::new(AtomicBool::new(true));

        let stats = Executor::new(fx.root.path(), &fx.table, &fx.store, fx.fast_options())
            .expect("executor")
            .with_stop_signal(stop)
            .execute(&mut transactions)
            .expect("execute");
        assert_eq!(stats.pending, 2);
        assert!(fx.root.path().join("flojoy.txt").exists());
        assert_eq!(fx.store.load().expect("log").len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_cannot_redirect_a_rename() {
        let fx = fixture();
        let outside = tempdir().expect("outside");
        fs::write(outside.path().join("flojoy.txt"), "secret").expect("victim");
        fs::create_dir(fx.root.path().join("dir")).expect("dir");
        fs::write(fx.root.path().join("dir/flojoy.txt"), "inside").expect("file");
        let mut transactions = fx.plan();
        // Swap the directory for a link pointing outside the root after planning.
        fs::remove_dir_all(fx.root.path().join("dir")).expect("remove");
        std::os::unix::fs::symlink(outside.path(), fx.root.path().join("dir")).expect("symlink");

        let stats = fx.run(&mut transactions, fx.fast_options());
        assert_eq!(stats.completed, 0);
        assert!(transactions
            .iter()
            .all(|t| t.status == TransactionStatus::Failed));
        assert!(transactions
            .iter()
            .all(|t| t.error_message.as_deref().unwrap_or_default().starts_with("sandbox violation")));
        assert!(outside.path().join("flojoy.txt").exists());
        assert_eq!(
            fs::read_to_string(outside.path().join("flojoy.txt")).expect("read"),
            "secret"
        );
    }

    #[test]
    fn rename_interrupted_before_logging_is_recognised_on_restart() {
        let fx = fixture();
        fs::create_dir(fx.root.path().join("flojoy_dir")).expect("dir");
        fs::write(fx.root.path().join("flojoy_dir/note.txt"), "flojoy\n").expect("file");
        let mut transactions = fx.plan();
        let folder = transactions
            .iter_mut()
            .find(|t| t.kind == TransactionKind::RenameFolder)
            .expect("folder rename");
        folder.status = TransactionStatus::InProgress;
        // The rename reached the disk but the log never recorded it.
        fs::rename(
            fx.root.path().join("flojoy_dir"),
            fx.root.path().join("atlasvibe_dir"),
        )
        .expect("rename on disk");

        let options = ExecuteOptions {
            skip_scan: true,
            ..fx.fast_options()
        };
        let stats = fx.run(&mut transactions, options);
        assert_eq!(stats.failed, 0);
        let folder = transactions
            .iter()
            .find(|t| t.kind == TransactionKind::RenameFolder)
            .expect("folder rename");
        assert_eq!(folder.status, TransactionStatus::Completed);
        assert_eq!(folder.new_name.as_deref(), Some("atlasvibe_dir"));
        assert_eq!(
            fs::read_to_string(fx.root.path().join("atlasvibe_dir/note.txt")).expect("edited"),
            "atlasvibe\n"
        );
    }

    /// Lets the first rename through and fails every later one.
    struct FailAfterFirstRename {
        renames: Cell<u32>,
    }

    impl FileOps for FailAfterFirstRename {
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.renames.set(self.renames.get() + 1);
            if self.renames.get() > 1 {
                return Err(io::Error::other("device went away"));
            }
            LocalFs.rename(from, to)
        }

        fn replace_contents(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            LocalFs.replace_contents(path, data)
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_rollback_of_an_interim_rename_is_reported() {
        let fx = fixture();
        fs::write(fx.root.path().join("flojoy.cfg"), "x").expect("file");
        let mut transactions = fx.plan();
        // A hard link is the same entry under the new name, so the rename
        // goes through an interim name.
        fs::hard_link(
            fx.root.path().join("flojoy.cfg"),
            fx.root.path().join("atlasvibe.cfg"),
        )
        .expect("hard link");

        let stats = Executor::new(fx.root.path(), &fx.table, &fx.store, fx.fast_options())
            .expect("executor")
            .with_file_ops(FailAfterFirstRename {
                renames: Cell::new(0),
            })
            .execute(&mut transactions)
            .expect("execute");

        assert_eq!(stats.failed, 1);
        let message = transactions[0].error_message.as_deref().unwrap_or_default();
        assert!(message.contains("rollback failed"));
        assert!(message.contains(TEMP_PREFIX));
        assert!(fx.root.path().join(format!("{TEMP_PREFIX}atlasvibe.cfg")).exists());
    }
}
