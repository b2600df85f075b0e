use similar::{ChangeTag, TextDiff};

use crate::replacement::ReplacementTable;
use crate::transaction::{Transaction, TransactionKind};

/// Word-level rendering of a single line edit: removed text in `[-…-]`,
/// inserted text in `{+…+}`. Line terminators are not shown.
pub fn render_line_change(old: &str, new: &str) -> String {
    let old = old.trim_end_matches(['\r', '\n']);
    let new = new.trim_end_matches(['\r', '\n']);
    let diff = TextDiff::configure()
        .algorithm(similar::Algorithm::Myers)
        .diff_words(old, new);

    let mut rendered = String::with_capacity(old.len() + new.len());
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => rendered.push_str(change.value()),
            ChangeTag::Delete => {
                rendered.push_str("[-");
                rendered.push_str(change.value());
                rendered.push_str("-]");
            }
            ChangeTag::Insert => {
                rendered.push_str("{+");
                rendered.push_str(change.value());
                rendered.push_str("+}");
            }
        }
    }
    rendered
}

/// One preview line per transaction, at most `limit` of them.
pub fn print_plan_preview(transactions: &[Transaction], table: &ReplacementTable, limit: usize) {
    for txn in transactions.iter().take(limit) {
        match txn.kind {
            TransactionKind::RenameFile | TransactionKind::RenameFolder => {
                let original = txn.original_name.as_deref().unwrap_or_default();
                let renamed = txn
                    .new_name
                    .clone()
                    .unwrap_or_else(|| table.substitute(original).into_owned());
                println!("  {:<13} {} -> {renamed}", txn.kind, txn.path);
            }
            TransactionKind::EditContentLine => {
                let original = txn.original_line_content.as_deref().unwrap_or_default();
                let proposed = txn
                    .proposed_content
                    .clone()
                    .unwrap_or_else(|| table.substitute(original).into_owned());
                let suffix = if txn.is_rtf { " (rtf, not rewritten)" } else { "" };
                println!(
                    "  {:<13} {}:{}{suffix}: {}",
                    txn.kind,
                    txn.path,
                    txn.line_number.unwrap_or_default(),
                    render_line_change(original, &proposed)
                );
            }
        }
    }
    if transactions.len() > limit {
        println!("  ... and {} more", transactions.len() - limit);
    }
}
