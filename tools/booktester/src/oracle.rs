//! Expected-versus-actual comparison for console output, file contents and the
//! residual working-tree diff.

use crate::errors::BookTesterError;
use crate::types::LineRange;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stands for any run of text (inline) or any run of lines (on its own line).
pub const ELISION: &str = "[...]";
const VOLATILE_PLACEHOLDER: &str = "<volatile>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub address: LineRange,
    pub context: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification mismatch at lines {}: {}",
            self.address, self.context
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch(Mismatch),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    pub fn into_result(self) -> Result<(), BookTesterError> {
        match self {
            Self::Match => Ok(()),
            Self::Mismatch(mismatch) => Err(BookTesterError::VerificationMismatch(Box::new(mismatch))),
        }
    }
}

/// Category of working-tree diff noise excluded from the final diff check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiffIgnore {
    /// A removed line re-added elsewhere.
    Moves,
    BlankLines,
    /// Removed/added pairs that differ only in whitespace.
    Whitespace,
    /// Changed lines matching a regex.
    Matching(String),
}

impl FromStr for DiffIgnore {
    type Err = BookTesterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "moves" => Ok(Self::Moves),
            "blank-lines" => Ok(Self::BlankLines),
            "whitespace" => Ok(Self::Whitespace),
            other => match other.strip_prefix("matching:") {
                Some(pattern) => {
                    Regex::new(pattern).map_err(|e| {
                        BookTesterError::InvalidConfig(format!("diff ignore pattern `{pattern}`: {e}"))
                    })?;
                    Ok(Self::Matching(pattern.to_string()))
                }
                None => Err(BookTesterError::InvalidConfig(format!(
                    "unknown diff ignore category `{other}` (expected moves, blank-lines, whitespace or matching:<regex>)"
                ))),
            },
        }
    }
}

impl TryFrom<String> for DiffIgnore {
    type Error = BookTesterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DiffIgnore> for String {
    fn from(value: DiffIgnore) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DiffIgnore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moves => f.write_str("moves"),
            Self::BlankLines => f.write_str("blank-lines"),
            Self::Whitespace => f.write_str("whitespace"),
            Self::Matching(pattern) => write!(f, "matching:{pattern}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Oracle {
    volatile: Vec<Regex>,
}

impl Oracle {
    /// `volatile_patterns` match text that legitimately differs between runs
    /// (timings, object addresses); matches are masked on both sides.
    pub fn new(volatile_patterns: &[String]) -> Result<Self, BookTesterError> {
        let volatile = volatile_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    BookTesterError::InvalidConfig(format!("volatile pattern `{pattern}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { volatile })
    }

    pub fn normalize(&self, text: &str) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for raw in text.replace("\r\n", "\n").replace('\r', "\n").lines() {
            let mut line = raw.to_string();
            for pattern in &self.volatile {
                line = pattern.replace_all(&line, VOLATILE_PLACEHOLDER).into_owned();
            }
            let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.is_empty() && lines.last().is_some_and(|prev| prev.is_empty()) {
                continue;
            }
            lines.push(line);
        }
        while lines.first().is_some_and(|line| line.is_empty()) {
            lines.remove(0);
        }
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines
    }

    pub fn verify(
        &self,
        address: LineRange,
        context: &str,
        expected: &str,
        actual: &str,
    ) -> Verdict {
        let expected_lines = self.normalize(expected);
        let actual_lines = self.normalize(actual);
        if lines_match(&expected_lines, &actual_lines) {
            Verdict::Match
        } else {
            mismatch(address, context, expected, actual)
        }
    }

    /// Expected lines must appear as one contiguous run somewhere in `actual`.
    pub fn verify_contains(
        &self,
        address: LineRange,
        context: &str,
        expected: &str,
        actual: &str,
    ) -> Verdict {
        let mut pattern = vec![ELISION.to_string()];
        pattern.extend(self.normalize(expected));
        pattern.push(ELISION.to_string());
        if lines_match(&pattern, &self.normalize(actual)) {
            Verdict::Match
        } else {
            mismatch(address, context, expected, actual)
        }
    }

    pub fn verify_diff(
        &self,
        address: LineRange,
        expected: &str,
        diff: &str,
        ignore: &[DiffIgnore],
    ) -> Result<Verdict, BookTesterError> {
        let residual = residual_diff(diff, ignore)?.join("\n");
        Ok(self.verify(address, "final working-tree diff", expected, &residual))
    }
}

fn mismatch(address: LineRange, context: &str, expected: &str, actual: &str) -> Verdict {
    Verdict::Mismatch(Mismatch {
        address,
        context: context.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

fn lines_match(expected: &[String], actual: &[String]) -> bool {
    // reachable[i][j]: expected[i..] matches actual[j..]
    let cols = actual.len() + 1;
    let mut reachable = vec![false; (expected.len() + 1) * cols];
    reachable[expected.len() * cols + actual.len()] = true;
    for i in (0..expected.len()).rev() {
        for j in (0..=actual.len()).rev() {
            let matched = if expected[i] == ELISION {
                reachable[(i + 1) * cols + j] || (j < actual.len() && reachable[i * cols + j + 1])
            } else {
                j < actual.len()
                    && line_matches(&expected[i], &actual[j])
                    && reachable[(i + 1) * cols + j + 1]
            };
            reachable[i * cols + j] = matched;
        }
    }
    reachable[0]
}

fn line_matches(pattern: &str, actual: &str) -> bool {
    if !pattern.contains(ELISION) {
        return pattern == actual;
    }
    let parts = pattern.split(ELISION).collect::<Vec<_>>();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return pattern == actual,
    };
    let Some(mut remaining) = actual.strip_prefix(first.trim_end()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        let part = part.trim();
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.trim_start())
}

/// Changed lines (`+`/`-`) of a unified diff left after removing ignored noise,
/// in their original order.
pub fn residual_diff(diff: &str, ignore: &[DiffIgnore]) -> Result<Vec<String>, BookTesterError> {
    let patterns = ignore
        .iter()
        .filter_map(|category| match category {
            DiffIgnore::Matching(pattern) => Some(Regex::new(pattern).map_err(|e| {
                BookTesterError::InvalidConfig(format!("diff ignore pattern `{pattern}`: {e}"))
            })),
            _ => None,
        })
        .collect::<Result<Vec<_>, _>>()?;

    // `---`/`+++` are file headers only between a file's start and its first hunk.
    let mut in_header = true;
    let mut changes = Vec::new();
    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            in_header = true;
            continue;
        }
        if line.starts_with("@@") {
            in_header = false;
            continue;
        }
        if in_header && (line.starts_with("---") || line.starts_with("+++")) {
            continue;
        }
        if line.starts_with('+') || line.starts_with('-') {
            changes.push(Some(line.to_string()));
        }
    }

    for slot in changes.iter_mut() {
        let Some(line) = slot.as_deref() else { continue };
        let body = &line[1..];
        let blank = ignore.contains(&DiffIgnore::BlankLines) && body.trim().is_empty();
        if blank || patterns.iter().any(|pattern| pattern.is_match(body)) {
            *slot = None;
        }
    }

    if ignore.contains(&DiffIgnore::Moves) {
        cancel_pairs(&mut changes, |body| body.trim_end().to_string());
    }
    if ignore.contains(&DiffIgnore::Whitespace) {
        cancel_pairs(&mut changes, |body| body.split_whitespace().collect::<String>());
    }

    Ok(changes.into_iter().flatten().collect())
}

fn cancel_pairs(changes: &mut [Option<String>], key: impl Fn(&str) -> String) {
    for removed in 0..changes.len() {
        let removed_key = match changes[removed].as_deref() {
            Some(line) if line.starts_with('-') => key(&line[1..]),
            _ => continue,
        };
        let partner = changes.iter().position(|candidate| {
            candidate
                .as_deref()
                .is_some_and(|line| line.starts_with('+') && key(&line[1..]) == removed_key)
        });
        if let Some(added) = partner {
            changes[removed] = None;
            changes[added] = None;
        }
    }
}
