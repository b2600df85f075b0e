use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, ValueHint};
use is_terminal::IsTerminal;

use mass_replace::diff::print_plan_preview;
use mass_replace::logging::{Verbosity, init_tracing};
use mass_replace::run::{DEFAULT_MAPPING_FILE, Plan, RunConfig, Session};
use mass_replace::{TransactionKind, TransactionStatus};

const PREVIEW_LIMIT: usize = 200;

/// Rename files and folders and rewrite text lines across a directory tree
/// according to a JSON replacement mapping.
#[derive(Debug, Parser)]
#[command(name = "mass-replace", version, about)]
struct Cli {
    /// Directory to process.
    #[arg(value_name = "ROOT", default_value = ".", value_hint = ValueHint::DirPath)]
    root: PathBuf,
    /// JSON file holding a "REPLACEMENT_MAPPING" object.
    #[arg(
        long = "mapping-file",
        value_name = "FILE",
        default_value = DEFAULT_MAPPING_FILE,
        value_hint = ValueHint::FilePath
    )]
    mapping_file: PathBuf,
    /// Only scan the contents of files with these extensions.
    #[arg(long, value_name = "EXT", value_delimiter = ',')]
    extensions: Vec<String>,
    /// Additional directory names or root-relative paths to skip.
    #[arg(long = "exclude-dirs", value_name = "DIR", value_delimiter = ',')]
    exclude_dirs: Vec<String>,
    /// File names or globs to skip.
    #[arg(long = "exclude-files", value_name = "GLOB", value_delimiter = ',')]
    exclude_files: Vec<String>,
    /// Honour the root's .gitignore.
    #[arg(long = "use-gitignore", action = ArgAction::SetTrue)]
    use_gitignore: bool,
    /// Extra ignore file in .gitignore syntax.
    #[arg(long = "ignore-file", value_name = "FILE", value_hint = ValueHint::FilePath)]
    ignore_file: Option<PathBuf>,
    #[arg(long = "ignore-symlinks", action = ArgAction::SetTrue)]
    ignore_symlinks: bool,
    #[arg(long = "skip-file-renaming", action = ArgAction::SetTrue)]
    skip_file_renaming: bool,
    #[arg(long = "skip-folder-renaming", action = ArgAction::SetTrue)]
    skip_folder_renaming: bool,
    #[arg(long = "skip-content", action = ArgAction::SetTrue)]
    skip_content: bool,
    /// Plan and simulate without touching the tree.
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Plan and save the transaction log, then stop.
    #[arg(long = "scan-only", action = ArgAction::SetTrue, conflicts_with_all = ["skip_scan", "dry_run"])]
    scan_only: bool,
    /// Execute the existing transaction log without scanning.
    #[arg(long = "skip-scan", action = ArgAction::SetTrue)]
    skip_scan: bool,
    /// Continue an interrupted run from its transaction log.
    #[arg(long, action = ArgAction::SetTrue)]
    resume: bool,
    /// Execute without asking for confirmation.
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
    /// Retry budget in minutes; 0 retries until the pass limit.
    #[arg(long, value_name = "MINUTES", default_value_t = 0.0)]
    timeout: f64,
    #[arg(long, short = 'q', action = ArgAction::SetTrue, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long, short = 'v', action = ArgAction::SetTrue)]
    verbose: bool,
}

impl Cli {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    /// Dry runs, resumes and plan-only runs never prompt.
    fn needs_confirmation(&self) -> bool {
        !(self.force || self.dry_run || self.resume || self.scan_only)
    }

    fn into_config(self) -> RunConfig {
        let mut defaults = RunConfig::default();
        let mut exclude_dirs = std::mem::take(&mut defaults.exclude_dirs);
        exclude_dirs.extend(self.exclude_dirs);
        RunConfig {
            root: self.root,
            mapping_file: self.mapping_file,
            exclude_dirs,
            exclude_files: self.exclude_files,
            extensions: (!self.extensions.is_empty()).then_some(self.extensions),
            use_gitignore: self.use_gitignore,
            ignore_file: self.ignore_file,
            ignore_symlinks: self.ignore_symlinks,
            skip_file_renames: self.skip_file_renaming,
            skip_folder_renames: self.skip_folder_renaming,
            skip_content: self.skip_content,
            dry_run: self.dry_run,
            scan_only: self.scan_only,
            skip_scan: self.skip_scan,
            resume: self.resume,
            timeout_minutes: self.timeout,
            ..defaults
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity());
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                eprintln!("Second interrupt received; exiting immediately.");
                std::process::exit(130);
            }
            eprintln!("Stopping after the current step; rerun with --resume to continue.");
        })
        .context("installing the interrupt handler")?;
    }

    let confirm = cli.needs_confirmation();
    let preview = cli.dry_run || cli.verbose;
    let quiet = cli.quiet;
    let session = Session::open(cli.into_config())?;
    let config = session.config();
    let mut plan = session.plan()?;

    if !quiet {
        print_plan_summary(&session, &plan);
        if preview {
            print_plan_preview(&plan.transactions, session.table(), PREVIEW_LIMIT);
        }
    }
    if config.scan_only {
        println!("Plan saved to {}", session.store().path().display());
        return Ok(());
    }
    if plan.transactions.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }
    if confirm && !confirm_execution()? {
        println!("Aborted; nothing was changed.");
        return Ok(());
    }

    let stats = session.execute(&mut plan.transactions, Some(Arc::clone(&stop)))?;
    stats.print(if config.dry_run { "Dry run" } else { "Execution" });
    if plan.binary_matches > 0 {
        println!(
            "Matches inside binary files were logged to {}",
            session.audit_path().display()
        );
    }
    if stop.load(Ordering::SeqCst) {
        println!("Interrupted; rerun with --resume to finish the remaining transactions.");
    }
    println!("Transaction log: {}", session.store().path().display());
    Ok(())
}

fn print_plan_summary(session: &Session, plan: &Plan) {
    let count = |kind: TransactionKind| {
        plan.transactions
            .iter()
            .filter(|txn| txn.kind == kind && txn.status == TransactionStatus::Pending)
            .count()
    };
    if plan.scanned {
        println!(
            "Scanned {} files under {}",
            plan.files_scanned,
            session.root().display()
        );
    }
    println!(
        "Planned: {} folder renames, {} file renames, {} line edits ({} transactions in log)",
        count(TransactionKind::RenameFolder),
        count(TransactionKind::RenameFile),
        count(TransactionKind::EditContentLine),
        plan.transactions.len()
    );
    if plan.binary_matches > 0 {
        println!(
            "{} matches found inside binary files (never modified)",
            plan.binary_matches
        );
    }
}

fn confirm_execution() -> Result<bool> {
    if !io::stdin().is_terminal() {
        bail!("confirmation required but stdin is not a terminal; rerun with --force");
    }
    print!("Apply these changes? Type 'yes' to continue: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}
