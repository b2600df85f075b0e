use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::ExecError;
use crate::transaction::{Transaction, TransactionStatus};

/// Maps original root-relative paths to where they live now.
///
/// Transactions keep their scan-time path forever; renames of ancestors
/// are applied here instead, so a descendant resolves through every
/// rename that has completed so far.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
    current_names: HashMap<String, String>,
    resolved: HashMap<String, String>,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current_names: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Seed from renames a previous (real) run already performed.
    pub fn from_completed(root: impl Into<PathBuf>, transactions: &[Transaction]) -> Self {
        let mut translator = Self::new(root);
        for txn in transactions {
            if !txn.kind.is_rename()
                || txn.status != TransactionStatus::Completed
                || txn.is_dry_run_completion()
            {
                continue;
            }
            if let Some(new_name) = &txn.new_name {
                translator.record_rename(&txn.path, new_name);
            }
        }
        translator
    }

    pub fn record_rename(&mut self, original: &str, new_name: &str) {
        self.current_names
            .insert(original.to_string(), new_name.to_string());
        self.resolved.clear();
    }

    /// Current root-relative path of an original path.
    pub fn current_relative(&mut self, original: &str) -> String {
        if original.is_empty() {
            return String::new();
        }
        if let Some(hit) = self.resolved.get(original) {
            return hit.clone();
        }
        let (parent, name) = original.rsplit_once('/').unwrap_or(("", original));
        let parent_now = self.current_relative(parent);
        let name_now = self
            .current_names
            .get(original)
            .map(String::as_str)
            .unwrap_or(name);
        let current = if parent_now.is_empty() {
            name_now.to_string()
        } else {
            format!("{parent_now}/{name_now}")
        };
        self.resolved.insert(original.to_string(), current.clone());
        current
    }

    pub fn resolve(&mut self, original: &str) -> PathBuf {
        let current = self.current_relative(original);
        current
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    /// Snapshot of the inverse mapping, current path → original path.
    pub fn reverse(&mut self) -> ReverseTranslation {
        let originals: Vec<String> = self.current_names.keys().cloned().collect();
        let mut by_current = HashMap::with_capacity(originals.len());
        for original in originals {
            let current = self.current_relative(&original);
            by_current.insert(current, original);
        }
        ReverseTranslation { by_current }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReverseTranslation {
    by_current: HashMap<String, String>,
}

impl ReverseTranslation {
    pub fn original_for(&self, current: &str) -> String {
        if self.by_current.is_empty() {
            return current.to_string();
        }
        let mut current_prefix = String::new();
        let mut original_prefix = String::new();
        for part in current.split('/').filter(|part| !part.is_empty()) {
            current_prefix = join_relative(&current_prefix, part);
            original_prefix = match self.by_current.get(&current_prefix) {
                Some(original) => original.clone(),
                None => join_relative(&original_prefix, part),
            };
        }
        original_prefix
    }
}

fn join_relative(prefix: &str, part: &str) -> String {
    if prefix.is_empty() {
        part.to_string()
    } else {
        format!("{prefix}/{part}")
    }
}

/// Confines every mutation to the canonical root.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: &Path) -> io::Result<Self> {
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// For renames: the entry itself is not followed (renaming a symlink
    /// renames the link), but every ancestor must resolve inside the root.
    pub fn check_entry(&self, path: &Path) -> Result<PathBuf, ExecError> {
        let name = path
            .file_name()
            .ok_or_else(|| ExecError::SandboxViolation(format!("{} has no name", path.display())))?;
        let parent = path.parent().ok_or_else(|| {
            ExecError::SandboxViolation(format!("{} has no parent", path.display()))
        })?;
        let parent = fs::canonicalize(parent)
            .map_err(|err| ExecError::from_io(&err, &format!("resolving {}", parent.display())))?;
        if !parent.starts_with(&self.root) {
            return Err(ExecError::SandboxViolation(format!(
                "{} resolves outside {}",
                path.display(),
                self.root.display()
            )));
        }
        Ok(parent.join(name))
    }

    /// For content edits: the fully resolved file must be inside the root.
    pub fn check_target(&self, path: &Path) -> Result<PathBuf, ExecError> {
        let resolved = fs::canonicalize(path)
            .map_err(|err| ExecError::from_io(&err, &format!("resolving {}", path.display())))?;
        if !resolved.starts_with(&self.root) {
            return Err(ExecError::SandboxViolation(format!(
                "{} resolves to {} outside {}",
                path.display(),
                resolved.display(),
                self.root.display()
            )));
        }
        Ok(resolved)
    }
}

/// A replacement name must stay a single plain path component.
pub fn check_new_name(name: &str) -> Result<(), ExecError> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    );
    if single && !name.contains('/') && !name.contains('\\') {
        Ok(())
    } else {
        Err(ExecError::SandboxViolation(format!(
            "new name '{name}' is not a plain file name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn descendants_follow_ancestor_renames() {
        let mut translator = PathTranslator::new("/root");
        assert_eq!(translator.resolve("a/b/c.txt"), PathBuf::from("/root/a/b/c.txt"));

        translator.record_rename("a", "x");
        translator.record_rename("a/b", "y");
        assert_eq!(translator.current_relative("a/b/c.txt"), "x/y/c.txt");
        assert_eq!(translator.resolve("a/b/c.txt"), PathBuf::from("/root/x/y/c.txt"));
        assert_eq!(translator.current_relative("a/other"), "x/other");
    }

    #[test]
    fn reverse_translation_recovers_original_paths() {
        let mut translator = PathTranslator::new("/root");
        translator.record_rename("flojoy_dir", "atlasvibe_dir");
        translator.record_rename("flojoy_dir/flojoy.txt", "atlasvibe.txt");
        let reverse = translator.reverse();

        assert_eq!(reverse.original_for("atlasvibe_dir/atlasvibe.txt"), "flojoy_dir/flojoy.txt");
        assert_eq!(reverse.original_for("atlasvibe_dir/new.txt"), "flojoy_dir/new.txt");
        assert_eq!(reverse.original_for("untouched/a.txt"), "untouched/a.txt");
    }

    #[test]
    fn seeding_ignores_dry_runs() {
        let mut real = Transaction::rename(crate::TransactionKind::RenameFolder, "a", "a");
        real.new_name = Some("b".into());
        real.mark(TransactionStatus::Completed, None);
        let mut simulated = Transaction::rename(crate::TransactionKind::RenameFile, "c", "c");
        simulated.new_name = Some("d".into());
        simulated.mark(
            TransactionStatus::Completed,
            Some(crate::transaction::DRY_RUN_REASON.into()),
        );

        let mut translator = PathTranslator::from_completed("/r", &[real, simulated]);
        assert_eq!(translator.current_relative("a/x"), "b/x");
        assert_eq!(translator.current_relative("c"), "c");
    }

    #[test]
    fn new_names_must_be_single_components() {
        assert!(check_new_name("atlasvibe.txt").is_ok());
        assert!(check_new_name("../escape").is_err());
        assert!(check_new_name("a/b").is_err());
        assert!(check_new_name("..").is_err());
        assert!(check_new_name("").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_parent_outside_root_is_rejected() {
        let outside = tempdir().expect("outside");
        let root = tempdir().expect("root");
        std::fs::write(outside.path().join("victim.txt"), "x").expect("victim");
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).expect("symlink");

        let sandbox = Sandbox::new(root.path()).expect("sandbox");
        let through_link = root.path().join("link").join("victim.txt");
        assert!(matches!(
            sandbox.check_entry(&through_link),
            Err(ExecError::SandboxViolation(_))
        ));
        assert!(matches!(
            sandbox.check_target(&through_link),
            Err(ExecError::SandboxViolation(_))
        ));
        assert!(sandbox.check_entry(&root.path().join("link")).is_ok());
    }
}
