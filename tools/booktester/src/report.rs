//! Human-readable chapter verdicts.

use crate::driver::ReplayOutcome;
use crate::errors::BookTesterError;
use crate::types::Listing;

pub fn render_outcome(outcome: &ReplayOutcome) -> Vec<String> {
    let ledger = &outcome.context.ledger;
    let Some(error) = &outcome.error else {
        return vec![format!(
            "PASS chapter {} ({} listings, {} skipped, {} fast-forwarded)",
            outcome.chapter_no,
            outcome.total,
            ledger.skipped_count(),
            ledger.fast_forwarded_count()
        )];
    };

    let message = match error {
        BookTesterError::VerificationMismatch(mismatch) => {
            format!("{} does not match the book", mismatch.context)
        }
        BookTesterError::CommandFailed {
            command, exit_code, ..
        } => format!("`{command}` exited with {exit_code}"),
        BookTesterError::NoTargetFile { kind, .. } => format!("{kind} has no file to apply to"),
        other => other.to_string(),
    };
    let headline = match error.address() {
        Some(address) => format!("FAIL chapter {} at lines {address}: {message}", outcome.chapter_no),
        None => format!("FAIL chapter {}: {message}", outcome.chapter_no),
    };
    let mut lines = vec![headline];
    match error {
        BookTesterError::VerificationMismatch(mismatch) => {
            lines.push("--- expected".to_string());
            lines.push("+++ actual".to_string());
            lines.extend(line_diff(&mismatch.expected, &mismatch.actual));
        }
        BookTesterError::CommandFailed { output, .. } => {
            lines.extend(output.lines().map(|line| format!("    {line}")));
        }
        _ => {}
    }
    lines
}

/// Line diff of `expected` against `actual`: `-` only in expected, `+` only
/// in actual, two spaces for shared lines.
pub fn line_diff(expected: &str, actual: &str) -> Vec<String> {
    let old = expected.lines().collect::<Vec<_>>();
    let new = actual.lines().collect::<Vec<_>>();

    // lcs[i][j]: longest common subsequence of old[i..] and new[j..]
    let cols = new.len() + 1;
    let mut lcs = vec![0usize; (old.len() + 1) * cols];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i * cols + j] = if old[i] == new[j] {
                lcs[(i + 1) * cols + j + 1] + 1
            } else {
                lcs[(i + 1) * cols + j].max(lcs[i * cols + j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            out.push(format!("  {}", old[i]));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * cols + j] >= lcs[i * cols + j + 1] {
            out.push(format!("-{}", old[i]));
            i += 1;
        } else {
            out.push(format!("+{}", new[j]));
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|line| format!("-{line}")));
    out.extend(new[j..].iter().map(|line| format!("+{line}")));
    out
}

/// One row per listing for `--list`.
pub fn render_listing_table(listings: &[Listing]) -> Vec<String> {
    listings
        .iter()
        .enumerate()
        .map(|(index, listing)| {
            let mut row = format!(
                "{index:>4}  {:<9}  {:<16}",
                listing.address.to_string(),
                listing.kind.as_str()
            );
            if let Some(path) = &listing.target_file {
                row.push_str(&format!("  {path}"));
            }
            if let Some(label) = &listing.commit_label {
                row.push_str(&format!("  ({label})"));
            }
            if listing.skip {
                row.push_str("  [skipme]");
            }
            if let Some(first) = listing.contents.lines().next() {
                if listing.target_file.is_none() {
                    row.push_str(&format!("  {}", first.trim()));
                }
            }
            row.trim_end().to_string()
        })
        .collect()
}
