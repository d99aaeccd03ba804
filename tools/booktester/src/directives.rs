//! Operator directives supplied per chapter run: listings to skip and an
//! optional fast-forward jump.

use crate::errors::BookTesterError;
use crate::types::Listing;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipTarget {
    Index(usize),
    /// Any source line inside the listing's address.
    Line(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipEntry {
    pub target: SkipTarget,
    pub reason: String,
    /// Guard against stale indices: the listing must contain this text.
    pub expect_contains: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipDirectives {
    entries: Vec<SkipEntry>,
}

impl SkipDirectives {
    pub fn push(&mut self, entry: SkipEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maps every entry onto a listing index, checking its guard text.
    pub fn resolve(&self, listings: &[Listing]) -> Result<BTreeMap<usize, String>, BookTesterError> {
        let mut resolved = BTreeMap::new();
        for entry in &self.entries {
            let index = match entry.target {
                SkipTarget::Index(index) if index < listings.len() => index,
                SkipTarget::Index(index) => {
                    return Err(BookTesterError::InvalidDirective(format!(
                        "skip index {index} is out of range ({} listings)",
                        listings.len()
                    )))
                }
                SkipTarget::Line(line) => listings
                    .iter()
                    .position(|listing| listing.address.contains(line))
                    .ok_or_else(|| {
                        BookTesterError::InvalidDirective(format!(
                            "skip line {line} is not inside any listing"
                        ))
                    })?,
            };
            if let Some(expected) = &entry.expect_contains {
                let listing = &listings[index];
                if !listing.contents.contains(expected.as_str()) {
                    return Err(BookTesterError::InvalidDirective(format!(
                        "skip of listing {index} (lines {}) expected it to contain `{expected}`",
                        listing.address
                    )));
                }
            }
            resolved.insert(index, entry.reason.clone());
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastForward {
    pub index: usize,
    pub label: String,
}

/// `INDEX:REASON`, e.g. `29:review changes`.
pub fn parse_skip_arg(raw: &str, by_line: bool) -> Result<SkipEntry, BookTesterError> {
    let (number, reason) = split_pair(raw, "skip")?;
    Ok(SkipEntry {
        target: if by_line {
            SkipTarget::Line(number)
        } else {
            SkipTarget::Index(number)
        },
        reason: reason.to_string(),
        expect_contains: None,
    })
}

/// `INDEX:LABEL`, e.g. `59:ch11l030`.
pub fn parse_fast_forward_arg(raw: &str) -> Result<FastForward, BookTesterError> {
    let (index, label) = split_pair(raw, "fast-forward")?;
    if label.is_empty() {
        return Err(BookTesterError::Cli(format!(
            "fast-forward `{raw}` needs a commit label after the colon"
        )));
    }
    Ok(FastForward {
        index,
        label: label.to_string(),
    })
}

fn split_pair<'a>(raw: &'a str, what: &str) -> Result<(usize, &'a str), BookTesterError> {
    let (number, rest) = raw
        .split_once(':')
        .ok_or_else(|| BookTesterError::Cli(format!("{what} `{raw}` must look like NUMBER:TEXT")))?;
    let number = number
        .trim()
        .parse::<usize>()
        .map_err(|e| BookTesterError::Cli(format!("{what} `{raw}`: {e}")))?;
    Ok((number, rest.trim()))
}
