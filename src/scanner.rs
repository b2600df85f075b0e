use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use ignore::gitignore::Gitignore;
use tracing::{debug, info, warn};

use crate::encoding::{self, EncodingSource};
use crate::files::{self, EntryKind, TreeEntry, TreeFilter};
use crate::logging::BinaryMatchLog;
use crate::paths::{PathTranslator, ReverseTranslation};
use crate::replacement::ReplacementTable;
use crate::rtf;
use crate::transaction::{Transaction, TransactionKey, TransactionKind};

#[derive(Debug, Default, Clone)]
pub struct ScanOptions {
    /// Directory names, or root-relative directory paths, never entered.
    pub exclude_dirs: Vec<String>,
    /// Globs matched against file names and root-relative file paths.
    pub exclude_files: Vec<String>,
    /// When set, only files with these extensions are content-scanned.
    pub extensions: Option<Vec<String>>,
    pub ignore_symlinks: bool,
    pub ignore: Option<Gitignore>,
    pub skip_file_renames: bool,
    pub skip_folder_renames: bool,
    pub skip_content: bool,
    pub audit_log: Option<PathBuf>,
}

/// What a resumed scan already knows.
#[derive(Debug, Clone, Copy)]
pub struct ResumeContext<'a> {
    pub prior: &'a [Transaction],
    /// Original paths modified since they were last processed.
    pub force_rescan: &'a HashSet<String>,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub transactions: Vec<Transaction>,
    pub binary_matches: usize,
    pub files_scanned: usize,
}

pub fn scan(
    root: &Path,
    table: &ReplacementTable,
    options: &ScanOptions,
    resume: Option<ResumeContext<'_>>,
) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    if table.is_empty() {
        warn!("no replacement rules loaded; nothing to scan for");
        return Ok(outcome);
    }

    let filter = TreeFilter::new(
        &options.exclude_dirs,
        &options.exclude_files,
        options.ignore.clone(),
        options.ignore_symlinks,
    )?;
    let reverse = match resume {
        Some(ctx) => PathTranslator::from_completed(root, ctx.prior).reverse(),
        None => ReverseTranslation::default(),
    };
    let known: HashSet<TransactionKey> = resume
        .map(|ctx| ctx.prior.iter().map(Transaction::key).collect())
        .unwrap_or_default();
    let empty = HashSet::new();
    let force_rescan = resume.map(|ctx| ctx.force_rescan).unwrap_or(&empty);
    let mut planner = Planner {
        known: &known,
        force_rescan,
        queued: &mut outcome.transactions,
    };
    let audit = options.audit_log.as_ref().map(BinaryMatchLog::new);

    for entry in files::walk_tree(root, &filter) {
        let original = reverse.original_for(&entry.relative);
        queue_rename(table, options, &entry, &original, &mut planner);

        if entry.kind != EntryKind::File || options.skip_content {
            continue;
        }
        if let Some(extensions) = &options.extensions {
            if !files::has_extension(&entry.name, extensions) {
                continue;
            }
        }
        outcome.files_scanned += 1;
        match scan_contents(table, &entry, &original, audit.as_ref(), &mut planner) {
            Ok(hits) => outcome.binary_matches += hits,
            Err(err) => warn!("skipping contents of {}: {err:#}", entry.relative),
        }
    }

    info!(
        "scan planned {} transactions across {} files",
        outcome.transactions.len(),
        outcome.files_scanned
    );
    if outcome.binary_matches > 0 {
        if let Some(log) = &audit {
            info!(
                "{} matches inside binary files recorded in {}",
                outcome.binary_matches,
                log.path().display()
            );
        }
    }
    Ok(outcome)
}

struct Planner<'a> {
    known: &'a HashSet<TransactionKey>,
    force_rescan: &'a HashSet<String>,
    queued: &'a mut Vec<Transaction>,
}

impl Planner<'_> {
    fn push(&mut self, txn: Transaction) {
        if self.known.contains(&txn.key()) && !self.force_rescan.contains(&txn.path) {
            return;
        }
        self.queued.push(txn);
    }
}

fn queue_rename(
    table: &ReplacementTable,
    options: &ScanOptions,
    entry: &TreeEntry,
    original: &str,
    planner: &mut Planner<'_>,
) {
    let kind = match entry.kind {
        EntryKind::Dir if options.skip_folder_renames => return,
        EntryKind::Dir => TransactionKind::RenameFolder,
        _ if options.skip_file_renames => return,
        _ => TransactionKind::RenameFile,
    };
    if !table.might_match(&entry.name) || table.substitute(&entry.name) == entry.name {
        return;
    }
    debug!("planning {kind} for {}", entry.relative);
    planner.push(Transaction::rename(kind, original, entry.name.clone()));
}

/// Returns the number of binary matches logged.
fn scan_contents(
    table: &ReplacementTable,
    entry: &TreeEntry,
    original: &str,
    audit: Option<&BinaryMatchLog>,
    planner: &mut Planner<'_>,
) -> Result<usize> {
    if files::detect_binary(&entry.path)? {
        let data = fs::read(&entry.path)?;
        let mut hits = 0;
        for (key, offset) in table.find_in_bytes(&data) {
            if let Some(log) = audit {
                log.record_match(&entry.relative, key, offset)?;
            }
            hits += 1;
        }
        return Ok(hits);
    }

    let bytes = fs::read(&entry.path)?;
    let (decoded, source) = encoding::decode_auto(&bytes);
    if decoded.had_errors {
        warn!(
            "skipping contents of {}: does not decode cleanly as {}",
            entry.relative,
            decoded.encoding.name()
        );
        return Ok(0);
    }
    if source != EncodingSource::AssumedUtf8 {
        debug!(
            "{} decoded as {} ({source})",
            entry.relative,
            decoded.encoding.name()
        );
    }

    let is_rtf = rtf::is_rtf_path(&entry.name);
    let text = if is_rtf {
        rtf::extract_text(&decoded.text)
    } else {
        decoded.text
    };
    for (idx, line) in encoding::split_lines_keep_ends(&text).into_iter().enumerate() {
        if !table.might_match(line) || table.substitute(line) == line {
            continue;
        }
        planner.push(Transaction::content_line(
            original,
            idx + 1,
            line,
            decoded.encoding.name(),
            is_rtf,
        ));
    }
    Ok(0)
}
