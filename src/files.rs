use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use time::OffsetDateTime;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const BINARY_CHECK_BYTES: usize = 4096;

/// Name prefix of in-flight temp files; never scanned.
pub const TEMP_PREFIX: &str = ".mass-replace-tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    /// Root-relative, `/`-separated.
    pub relative: String,
    pub name: String,
    pub kind: EntryKind,
}

/// Which parts of the tree the scanner never looks at.
#[derive(Debug, Default)]
pub struct TreeFilter {
    exclude_dirs: Vec<String>,
    exclude_files: Option<GlobSet>,
    ignore: Option<Gitignore>,
    ignore_symlinks: bool,
}

impl TreeFilter {
    pub fn new(
        exclude_dirs: &[String],
        exclude_file_patterns: &[String],
        ignore: Option<Gitignore>,
        ignore_symlinks: bool,
    ) -> Result<Self> {
        Ok(Self {
            exclude_dirs: exclude_dirs
                .iter()
                .map(|dir| dir.trim().trim_end_matches('/').replace('\\', "/"))
                .filter(|dir| !dir.is_empty())
                .collect(),
            exclude_files: build_exclude_globs(exclude_file_patterns)?,
            ignore,
            ignore_symlinks,
        })
    }

    fn excludes(&self, entry: &DirEntry, relative: &str, name: &str) -> bool {
        let file_type = entry.file_type();
        if file_type.is_symlink() && self.ignore_symlinks {
            return true;
        }
        if file_type.is_dir() {
            let by_name = self
                .exclude_dirs
                .iter()
                .any(|dir| dir == relative || (!dir.contains('/') && dir == name));
            if by_name {
                return true;
            }
        } else if let Some(set) = &self.exclude_files {
            if set.is_match(name) || set.is_match(relative) {
                return true;
            }
        }
        self.ignore
            .as_ref()
            .map(|gitignore| gitignore.matched(entry.path(), file_type.is_dir()).is_ignore())
            .unwrap_or(false)
    }
}

/// Every entry below `root` (the root itself excluded) that survives the
/// filter, parents before children. Symlinks are reported, never followed.
pub fn walk_tree(root: &Path, filter: &TreeFilter) -> Vec<TreeEntry> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match relative_parts(root, entry.path()) {
            Some((relative, name)) => {
                let excluded = filter.excludes(entry, &relative, &name);
                if excluded {
                    debug!("excluded {relative}");
                }
                !excluded
            }
            None => {
                warn!("skipping {} (not valid UTF-8)", entry.path().display());
                false
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("unable to read part of the tree: {err}");
                continue;
            }
        };
        let Some((relative, name)) = relative_parts(root, entry.path()) else {
            continue;
        };
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(TreeEntry {
            path: entry.into_path(),
            relative,
            name,
            kind,
        });
    }

    entries
}

fn relative_parts(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = to_relative_posix(root, path)?;
    let name = path.file_name()?.to_str()?.to_string();
    Some((relative, name))
}

pub fn to_relative_posix(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Union of the root `.gitignore` (when requested) and a custom ignore file.
pub fn build_ignore(
    root: &Path,
    use_gitignore: bool,
    custom: Option<&Path>,
) -> Result<Option<Gitignore>> {
    let mut builder = GitignoreBuilder::new(root);
    let mut added = 0;

    if use_gitignore {
        let gitignore = root.join(".gitignore");
        if gitignore.is_file() {
            if let Some(err) = builder.add(&gitignore) {
                warn!("problem reading {}: {err}", gitignore.display());
            }
            added += 1;
        } else {
            debug!("no .gitignore at {}", root.display());
        }
    }

    if let Some(path) = custom {
        if !path.is_file() {
            bail!("ignore file {} does not exist", path.display());
        }
        if let Some(err) = builder.add(path) {
            warn!("problem reading {}: {err}", path.display());
        }
        added += 1;
    }

    if added == 0 {
        return Ok(None);
    }
    builder
        .build()
        .map(Some)
        .map_err(|err| anyhow!("unable to build ignore rules: {err}"))
}

fn build_exclude_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).map_err(|err| anyhow!("invalid exclude glob '{pattern}': {err}"))?;
        builder.add(glob);
    }

    builder
        .build()
        .map(Some)
        .map_err(|err| anyhow!("unable to build exclude globs: {err}"))
}

/// A NUL byte in the first few KiB marks a file as binary, unless the file
/// announces itself as UTF-16 through its BOM.
pub fn detect_binary(path: &Path) -> Result<bool> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("opening '{}' for binary detection", path.display()))?;
    let mut buf = [0u8; BINARY_CHECK_BYTES];
    let read = file.read(&mut buf)?;
    let head = &buf[..read];
    if head.starts_with(&[0xFF, 0xFE]) || head.starts_with(&[0xFE, 0xFF]) {
        return Ok(false);
    }
    Ok(head.contains(&0))
}

/// Write `data` next to `path` and rename it into place, so readers never
/// observe a half-written file.
pub fn write_via_temp(
    path: &Path,
    data: &[u8],
    permissions: Option<fs::Permissions>,
) -> io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let base_dir = parent.unwrap_or_else(|| Path::new("."));
    let unique = format!(
        "{TEMP_PREFIX}{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    );
    let temp_path = base_dir.join(unique);
    let written = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        if let Some(permissions) = permissions {
            fs::set_permissions(&temp_path, permissions)?;
        }
        fs::rename(&temp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

pub fn has_extension(name: &str, extensions: &[String]) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}
