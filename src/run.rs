use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::executor::{ExecuteOptions, Executor, RetryPolicy};
use crate::files::{self, TEMP_PREFIX};
use crate::paths::PathTranslator;
use crate::replacement::{self, ReplacementTable};
use crate::scanner::{self, ResumeContext, ScanOptions};
use crate::store::{self, TransactionStore};
use crate::transaction::{RunStatistics, Transaction};

pub const DEFAULT_MAPPING_FILE: &str = "replacement_mapping.json";
pub const DEFAULT_LOG_NAME: &str = "planned_transactions.json";
pub const DEFAULT_AUDIT_NAME: &str = "binary_files_matches.log";
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
];

/// Everything one invocation needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub root: PathBuf,
    pub mapping_file: PathBuf,
    pub exclude_dirs: Vec<String>,
    pub exclude_files: Vec<String>,
    pub extensions: Option<Vec<String>>,
    pub use_gitignore: bool,
    pub ignore_file: Option<PathBuf>,
    pub ignore_symlinks: bool,
    pub skip_file_renames: bool,
    pub skip_folder_renames: bool,
    pub skip_content: bool,
    pub dry_run: bool,
    /// Plan and persist, then stop before executing.
    pub scan_only: bool,
    pub skip_scan: bool,
    pub resume: bool,
    /// `0` is unbounded.
    pub timeout_minutes: f64,
    /// File names inside the root.
    pub log_name: String,
    pub audit_name: String,
    pub retry: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            mapping_file: PathBuf::from(DEFAULT_MAPPING_FILE),
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|dir| dir.to_string()).collect(),
            exclude_files: Vec::new(),
            extensions: None,
            use_gitignore: false,
            ignore_file: None,
            ignore_symlinks: false,
            skip_file_renames: false,
            skip_folder_renames: false,
            skip_content: false,
            dry_run: false,
            scan_only: false,
            skip_scan: false,
            resume: false,
            timeout_minutes: 0.0,
            log_name: DEFAULT_LOG_NAME.to_string(),
            audit_name: DEFAULT_AUDIT_NAME.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of the planning phase.
#[derive(Debug, Default)]
pub struct Plan {
    pub transactions: Vec<Transaction>,
    pub binary_matches: usize,
    pub files_scanned: usize,
    /// False when the plan came straight from the log (`skip_scan`).
    pub scanned: bool,
}

/// A validated root plus its mapping and transaction log.
#[derive(Debug)]
pub struct Session {
    config: RunConfig,
    root: PathBuf,
    table: ReplacementTable,
    store: TransactionStore,
}

impl Session {
    /// Validate the root and load the mapping; any problem here aborts the
    /// run before anything is scanned.
    pub fn open(config: RunConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!("root directory {} does not exist", config.root.display());
        }
        if !config.root.is_dir() {
            bail!("root {} is not a directory", config.root.display());
        }
        let root = fs::canonicalize(&config.root)
            .with_context(|| format!("resolving {}", config.root.display()))?;
        let mut listing =
            fs::read_dir(&root).with_context(|| format!("listing {}", root.display()))?;
        if listing.next().is_none() {
            bail!("root directory {} is empty", root.display());
        }

        let table = replacement::load_mapping(&config.mapping_file)?;
        info!(
            "loaded {} replacement rules from {}",
            table.len(),
            config.mapping_file.display()
        );
        let store = TransactionStore::new(root.join(&config.log_name));
        Ok(Self {
            config,
            root,
            table,
            store,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self) -> &ReplacementTable {
        &self.table
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(&self.config.audit_name)
    }

    pub fn plan(&self) -> Result<Plan> {
        if self.config.skip_scan {
            let Some(transactions) = self.store.load() else {
                bail!(
                    "--skip-scan needs an existing transaction log at {}",
                    self.store.path().display()
                );
            };
            info!("using {} transactions from the existing log", transactions.len());
            return Ok(Plan {
                transactions,
                ..Default::default()
            });
        }

        let options = self.scan_options()?;
        let prior = if self.config.resume {
            let loaded = self.store.load();
            if loaded.is_none() {
                warn!("no transaction log to resume from; starting a fresh scan");
            }
            loaded
        } else {
            None
        };

        let plan = match prior {
            Some(prior) => {
                let force_rescan = changed_since_processed(&self.root, &prior);
                if !force_rescan.is_empty() {
                    info!("{} paths changed since they were processed", force_rescan.len());
                }
                let outcome = scanner::scan(
                    &self.root,
                    &self.table,
                    &options,
                    Some(ResumeContext {
                        prior: &prior,
                        force_rescan: &force_rescan,
                    }),
                )?;
                Plan {
                    transactions: store::merge(prior, outcome.transactions, &force_rescan),
                    binary_matches: outcome.binary_matches,
                    files_scanned: outcome.files_scanned,
                    scanned: true,
                }
            }
            None => {
                let outcome = scanner::scan(&self.root, &self.table, &options, None)?;
                Plan {
                    transactions: outcome.transactions,
                    binary_matches: outcome.binary_matches,
                    files_scanned: outcome.files_scanned,
                    scanned: true,
                }
            }
        };
        self.store.save(&plan.transactions)?;
        Ok(plan)
    }

    pub fn execute(
        &self,
        transactions: &mut Vec<Transaction>,
        stop: Option<Arc<AtomicBool>>,
    ) -> Result<RunStatistics> {
        let options = ExecuteOptions {
            dry_run: self.config.dry_run,
            resume: self.config.resume,
            skip_scan: self.config.skip_scan,
            skip_file_renames: self.config.skip_file_renames,
            skip_folder_renames: self.config.skip_folder_renames,
            skip_content: self.config.skip_content,
            retry: self
                .config
                .retry
                .with_timeout_minutes(self.config.timeout_minutes),
        };
        let mut executor = Executor::new(&self.root, &self.table, &self.store, options)?;
        if let Some(stop) = stop {
            executor = executor.with_stop_signal(stop);
        }
        executor.execute(transactions)
    }

    fn scan_options(&self) -> Result<ScanOptions> {
        let config = &self.config;
        let mut exclude_files = config.exclude_files.clone();
        exclude_files.extend([
            config.log_name.clone(),
            format!("{}.bak", config.log_name),
            config.audit_name.clone(),
            format!("{TEMP_PREFIX}*"),
        ]);
        if let Ok(mapping) = fs::canonicalize(&config.mapping_file) {
            if let Some(relative) = files::to_relative_posix(&self.root, &mapping) {
                exclude_files.push(relative);
            }
        }

        Ok(ScanOptions {
            exclude_dirs: config.exclude_dirs.clone(),
            exclude_files,
            extensions: config.extensions.clone(),
            ignore_symlinks: config.ignore_symlinks,
            ignore: files::build_ignore(
                &self.root,
                config.use_gitignore,
                config.ignore_file.as_deref(),
            )?,
            skip_file_renames: config.skip_file_renames,
            skip_folder_renames: config.skip_folder_renames,
            skip_content: config.skip_content,
            audit_log: Some(self.audit_path()),
        })
    }
}

/// Original paths whose entry was modified after the last time any of its
/// transactions was processed.
fn changed_since_processed(root: &Path, prior: &[Transaction]) -> HashSet<String> {
    let mut last_processed: HashMap<&str, OffsetDateTime> = HashMap::new();
    for txn in prior {
        if let Some(at) = txn.processed_at {
            let entry = last_processed.entry(txn.path.as_str()).or_insert(at);
            if at > *entry {
                *entry = at;
            }
        }
    }

    let mut translator = PathTranslator::from_completed(root, prior);
    let mut changed = HashSet::new();
    for (path, processed_at) in last_processed {
        let current = translator.resolve(path);
        let Ok(modified) = fs::metadata(&current).and_then(|meta| meta.modified()) else {
            continue;
        };
        if OffsetDateTime::from(modified) > processed_at {
            changed.insert(path.to_string());
        }
    }
    changed
}

/// Open, plan and execute without any interaction. With `scan_only` the
/// statistics describe the persisted plan.
pub fn run(config: RunConfig) -> Result<RunStatistics> {
    let session = Session::open(config)?;
    let mut plan = session.plan()?;
    if session.config().scan_only {
        return Ok(RunStatistics::from_transactions(&plan.transactions));
    }
    session.execute(&mut plan.transactions, None)
}
