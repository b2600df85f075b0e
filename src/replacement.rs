use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use regex::{Captures, Regex, RegexBuilder};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::MappingError;
use crate::normalize::searchable_form;

pub const MAPPING_KEY: &str = "REPLACEMENT_MAPPING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementEntry {
    pub key: String,
    pub value: String,
}

/// Immutable set of replacement rules for one run.
///
/// Entries are kept longest key first so the alternation prefers the
/// longest key at any given position. Keys that differ only by case are
/// distinct rules; the exact-case index resolves which one a match
/// belongs to.
#[derive(Debug, Clone)]
pub struct ReplacementTable {
    entries: Vec<ReplacementEntry>,
    exact: HashMap<String, usize>,
    /// Case-insensitive alternation of every key, longest first.
    pattern: Option<Regex>,
    needles: Vec<regex::bytes::Regex>,
}

impl ReplacementTable {
    pub fn new<I, K, V>(pairs: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut entries: Vec<ReplacementEntry> = Vec::new();
        let mut seen = HashSet::new();
        for (raw_key, value) in pairs {
            let raw_key = raw_key.as_ref();
            let key = searchable_form(raw_key);
            if key.is_empty() {
                warn!("dropping mapping key {raw_key:?}: empty after normalization");
                continue;
            }
            if !seen.insert(key.clone()) {
                warn!("dropping mapping key {raw_key:?}: duplicates '{key}' after normalization");
                continue;
            }
            entries.push(ReplacementEntry {
                key,
                value: value.into(),
            });
        }

        entries.sort_by(|a, b| {
            b.key
                .chars()
                .count()
                .cmp(&a.key.chars().count())
                .then_with(|| a.key.cmp(&b.key))
        });

        let exact = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.key.clone(), idx))
            .collect();

        let pattern = if entries.is_empty() {
            None
        } else {
            let alternation = entries
                .iter()
                .map(|entry| regex::escape(&entry.key))
                .collect::<Vec<_>>()
                .join("|");
            Some(
                RegexBuilder::new(&format!("(?:{alternation})"))
                    .case_insensitive(true)
                    .build()?,
            )
        };

        let needles = entries
            .iter()
            .map(|entry| regex::bytes::Regex::new(&regex::escape(&entry.key)))
            .collect::<Result<Vec<_>, _>>()?;

        let table = Self {
            entries,
            exact,
            pattern,
            needles,
        };
        table.check_not_recursive()?;
        debug!("loaded {} replacement rules", table.entries.len());
        Ok(table)
    }

    /// A value the table would itself rewrite makes a second run change the
    /// first run's output. Keys match case-insensitively, so the value is
    /// looked up the same way; a value that only maps back onto itself is fine.
    fn check_not_recursive(&self) -> Result<(), MappingError> {
        for entry in &self.entries {
            let form = searchable_form(&entry.value);
            match self.value_for(&form) {
                Some(rewritten) if rewritten != entry.value => {
                    return Err(MappingError::Recursive {
                        key: entry.key.clone(),
                        value: entry.value.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            exact: HashMap::new(),
            pattern: None,
            needles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ReplacementEntry] {
        &self.entries
    }

    /// Cheap pre-filter: could `text` contain any key once control
    /// characters and diacritics are ignored?
    pub fn might_match(&self, text: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(&searchable_form(text)),
            None => false,
        }
    }

    /// Replace every key occurrence in a single pass over `text`.
    /// Inserted values are never rescanned.
    pub fn substitute<'t>(&self, text: &'t str) -> Cow<'t, str> {
        let Some(pattern) = &self.pattern else {
            return Cow::Borrowed(text);
        };
        pattern.replace_all(text, |caps: &Captures<'_>| {
            let matched = &caps[0];
            self.value_for(matched).unwrap_or(matched).to_string()
        })
    }

    fn value_for(&self, matched: &str) -> Option<&str> {
        if let Some(idx) = self.exact.get(matched) {
            return Some(self.entries[*idx].value.as_str());
        }
        let folded = matched.to_lowercase();
        self.entries
            .iter()
            .find(|entry| entry.key.to_lowercase() == folded)
            .map(|entry| entry.value.as_str())
    }

    /// Every byte offset at which a key's UTF-8 encoding occurs in `data`.
    pub fn find_in_bytes<'a>(&'a self, data: &'a [u8]) -> impl Iterator<Item = (&'a str, usize)> + 'a {
        self.entries
            .iter()
            .zip(&self.needles)
            .flat_map(move |(entry, needle)| {
                needle
                    .find_iter(data)
                    .map(move |hit| (entry.key.as_str(), hit.start()))
            })
    }
}

/// Load a table from a `{"REPLACEMENT_MAPPING": {...}}` document.
pub fn load_mapping(path: &Path) -> Result<ReplacementTable, MappingError> {
    let data = fs::read(path).map_err(|source| MappingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let document: JsonValue = serde_json::from_slice(&data).map_err(|source| MappingError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    parse_mapping(&document)
}

pub fn parse_mapping(document: &JsonValue) -> Result<ReplacementTable, MappingError> {
    let mapping = document
        .get(MAPPING_KEY)
        .ok_or(MappingError::MissingMapping)?
        .as_object()
        .ok_or(MappingError::NotAnObject)?;

    let mut pairs = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let value = value
            .as_str()
            .ok_or_else(|| MappingError::NonStringValue { key: key.clone() })?;
        pairs.push((key.clone(), value.to_string()));
    }
    if !mapping.is_empty() && pairs.iter().all(|(key, _)| searchable_form(key).is_empty()) {
        warn!("every mapping key is empty after normalization; nothing will be replaced");
    }
    ReplacementTable::new(pairs)
}
