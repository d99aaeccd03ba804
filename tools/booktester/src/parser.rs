//! Chapter text → ordered listing sequence.
//!
//! The chapter source is AsciiDoc-flavoured plain text. Only delimited blocks
//! (`----` ... `----`) become listings; everything else is prose. A block may
//! carry header lines directly above its opening delimiter:
//!
//! ```text
//! [role="sourcecode"]
//! .lists/tests.py (ch02l001)
//! ----
//! from django.test import TestCase
//! ----
//! ```
//!
//! Attribute lines supply roles (`role="sourcecode skipme"`) and a language
//! (`source,diff`); the title line supplies the target file and, in
//! parentheses, the commit label that ties the listing to a revision of the
//! example project.

use crate::errors::BookTesterError;
use crate::types::{LineRange, Listing, ListingKind};

pub const DELIMITER: &str = "----";
pub const PROMPT: &str = "$ ";

#[derive(Debug, Default)]
struct BlockHeader {
    roles: Vec<(String, usize)>,
    language: Option<String>,
    title: Option<Title>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Title {
    text: String,
    commit_label: Option<String>,
}

#[derive(Debug, Default)]
struct ParseState {
    follows_command: bool,
    named_file_seen: bool,
}

pub fn parse_listings(text: &str) -> Result<Vec<Listing>, BookTesterError> {
    let lines = text.lines().map(str::trim_end).collect::<Vec<_>>();
    let mut listings = Vec::new();
    let mut header: Option<BlockHeader> = None;
    let mut state = ParseState::default();
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        let line_no = idx + 1;

        if line == DELIMITER {
            let close = lines[idx + 1..]
                .iter()
                .position(|candidate| *candidate == DELIMITER)
                .map(|offset| idx + 1 + offset)
                .ok_or_else(|| BookTesterError::parse(line_no, "unterminated listing block"))?;
            let address = LineRange::new(line_no, close + 1);
            let block = classify_block(
                header.take().unwrap_or_default(),
                &lines[idx + 1..close],
                address,
                &mut state,
            )?;
            state.follows_command = block
                .last()
                .is_some_and(|listing| listing.kind == ListingKind::Command);
            listings.extend(block);
            idx = close + 1;
            continue;
        }

        if is_attribute_line(line) {
            parse_attributes(line, line_no, header.get_or_insert_with(BlockHeader::default));
        } else if is_title_line(line) && (header.is_some() || opens_block(&lines[idx + 1..])) {
            header.get_or_insert_with(BlockHeader::default).title = Some(parse_title(line, line_no)?);
        } else if !line.trim().is_empty() {
            header = None;
            state.follows_command = false;
        }
        idx += 1;
    }

    Ok(listings)
}

fn is_attribute_line(line: &str) -> bool {
    line.len() > 2 && line.starts_with('[') && line.ends_with(']') && line != "[...]"
}

fn is_title_line(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next() == Some('.')
        && chars
            .next()
            .is_some_and(|next| next != '.' && !next.is_whitespace())
}

fn opens_block(rest: &[&str]) -> bool {
    rest.first()
        .is_some_and(|next| *next == DELIMITER || is_attribute_line(next))
}

fn parse_attributes(line: &str, line_no: usize, header: &mut BlockHeader) {
    let inner = &line[1..line.len() - 1];
    let mut positional = Vec::new();
    for item in split_attribute_items(inner) {
        match item.split_once('=') {
            Some((key, value)) if key.trim() == "role" => {
                header.roles.extend(
                    value
                        .trim()
                        .trim_matches('"')
                        .split_whitespace()
                        .map(|role| (role.to_string(), line_no)),
                );
            }
            Some(_) => {}
            None => positional.push(item.trim().to_string()),
        }
    }
    if positional.first().map(String::as_str) == Some("source") {
        if let Some(language) = positional.get(1) {
            header.language = Some(language.to_ascii_lowercase());
        }
    }
}

fn split_attribute_items(inner: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in inner.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    items.push(current);
    items
}

fn parse_title(line: &str, line_no: usize) -> Result<Title, BookTesterError> {
    let text = line[1..].trim();
    let Some(open) = text.rfind(" (") else {
        return Ok(Title {
            text: text.to_string(),
            commit_label: None,
        });
    };
    let tail = &text[open + 2..];
    let label = match tail.strip_suffix(')') {
        Some(label) => label,
        None if tail.contains(char::is_whitespace) || tail.contains(')') => {
            return Ok(Title {
                text: text.to_string(),
                commit_label: None,
            })
        }
        None => {
            return Err(BookTesterError::parse(
                line_no,
                format!("unterminated commit label in title `{text}`"),
            ))
        }
    };
    // Parenthesised prose such as "(abridged output)" is part of the caption.
    if label.is_empty() || label.contains(char::is_whitespace) {
        return Ok(Title {
            text: text.to_string(),
            commit_label: None,
        });
    }
    Ok(Title {
        text: text[..open].trim().to_string(),
        commit_label: Some(label.to_string()),
    })
}

fn classify_block(
    header: BlockHeader,
    body: &[&str],
    address: LineRange,
    state: &mut ParseState,
) -> Result<Vec<Listing>, BookTesterError> {
    let mut kind: Option<ListingKind> = None;
    let mut skip = false;
    let mut ignore_errors = false;

    for (role, line_no) in &header.roles {
        let role_kind = match role.as_str() {
            "sourcecode" => ListingKind::CodeListing,
            "command" => ListingKind::Command,
            "output" => ListingKind::Output,
            "currentcontents" => ListingKind::CurrentContents,
            "skipme" => {
                skip = true;
                continue;
            }
            "ignore-errors" => {
                ignore_errors = true;
                continue;
            }
            other => {
                return Err(BookTesterError::parse(
                    *line_no,
                    format!("unknown listing role `{other}`"),
                ))
            }
        };
        if kind.is_some_and(|existing| existing != role_kind) {
            return Err(BookTesterError::parse(
                *line_no,
                format!("conflicting listing roles on block at lines {address}"),
            ));
        }
        kind = Some(role_kind);
    }

    let starts_with_prompt = body
        .iter()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.starts_with(PROMPT));

    let kind = match kind {
        Some(ListingKind::CodeListing) if header.language.as_deref() == Some("diff") => {
            ListingKind::Diff
        }
        Some(kind) => kind,
        None if starts_with_prompt => ListingKind::Command,
        None if skip => ListingKind::Illustration,
        None if state.follows_command => ListingKind::Output,
        None => {
            return Err(BookTesterError::parse(
                address.start,
                "cannot determine listing kind (no role, no `$ ` prompt, no preceding command)",
            ))
        }
    };

    if kind == ListingKind::Command {
        let mut commands = split_commands(body, address)?;
        for listing in &mut commands {
            listing.skip = skip;
            listing.ignore_errors = ignore_errors;
        }
        return Ok(commands);
    }

    let mut listing = Listing::new(kind, body.join("\n"), address);
    listing.skip = skip;
    listing.ignore_errors = ignore_errors;

    if matches!(
        kind,
        ListingKind::CodeListing | ListingKind::CurrentContents | ListingKind::Diff
    ) {
        if let Some(title) = header.title {
            listing.target_file = Some(title.text);
            listing.commit_label = title.commit_label;
            state.named_file_seen = true;
        } else if kind != ListingKind::Diff && !state.named_file_seen && !skip {
            return Err(BookTesterError::parse(
                address.start,
                format!("{} has no file name and no earlier listing names one", kind.as_str()),
            ));
        }
    } else if let Some(title) = header.title {
        listing.commit_label = title.commit_label;
    }

    Ok(vec![listing])
}

fn split_commands(body: &[&str], address: LineRange) -> Result<Vec<Listing>, BookTesterError> {
    let body_start = address.start + 1;
    let mut commands = Vec::new();
    let mut idx = 0;

    while idx < body.len() {
        let line = body[idx];
        if line.trim().is_empty() {
            idx += 1;
            continue;
        }
        let Some(first) = line.strip_prefix(PROMPT) else {
            return Err(BookTesterError::parse(
                body_start + idx,
                "command block text must start with a `$ ` prompt line",
            ));
        };

        let start = idx;
        let mut command = first.trim().to_string();
        while command.ends_with('\\') && idx + 1 < body.len() {
            command.pop();
            idx += 1;
            command = format!("{} {}", command.trim_end(), body[idx].trim());
        }
        idx += 1;

        let output_start = idx;
        while idx < body.len() && !body[idx].starts_with(PROMPT) {
            idx += 1;
        }
        let mut output_lines = &body[output_start..idx];
        while output_lines.last().is_some_and(|line| line.trim().is_empty()) {
            output_lines = &output_lines[..output_lines.len() - 1];
        }

        // output_start is at least one past the prompt line.
        let end = output_start + output_lines.len() - 1;
        let mut listing = Listing::new(
            ListingKind::Command,
            command,
            LineRange::new(body_start + start, body_start + end),
        );
        if !output_lines.is_empty() {
            listing.expected_output = Some(output_lines.join("\n"));
        }
        commands.push(listing);
    }

    if commands.is_empty() {
        return Err(BookTesterError::parse(
            address.start,
            "command block contains no `$ ` prompt line",
        ));
    }
    Ok(commands)
}
