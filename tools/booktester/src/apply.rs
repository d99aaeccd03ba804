//! Turning a code listing into new file contents.
//!
//! Books rarely print whole files after the first listing. A listing that
//! contains `[...]` lines is a partial: each run of lines between elisions is
//! anchored on its first line and replaces that line plus the indented block
//! beneath it in the existing file.

use crate::oracle::ELISION;

pub fn merge_listing(existing: Option<&str>, listing: &str, append: bool) -> String {
    let existing = existing.unwrap_or_default();
    if append {
        return append_listing(existing, listing);
    }
    let chunks = split_chunks(listing);
    if chunks.len() <= 1 && !has_elision(listing) {
        return with_trailing_newline(listing.trim_end_matches('\n'));
    }
    if existing.trim().is_empty() {
        let lines = chunks.into_iter().flatten().collect::<Vec<_>>();
        return with_trailing_newline(&lines.join("\n"));
    }

    let mut lines = existing.lines().map(str::to_string).collect::<Vec<_>>();
    let mut cursor = 0;
    for chunk in chunks {
        let Some(anchor) = chunk.first() else { continue };
        let found = find_line(&lines, anchor, cursor).or_else(|| find_line(&lines, anchor, 0));
        match found {
            Some(start) => {
                let end = block_end(&lines, start);
                let inserted = chunk.len();
                lines.splice(start..end, chunk.into_iter().map(str::to_string));
                cursor = start + inserted;
            }
            None if cursor > 0 => {
                let inserted = chunk.len();
                lines.splice(cursor..cursor, chunk.into_iter().map(str::to_string));
                cursor += inserted;
            }
            None => {
                if lines.last().is_some_and(|line| !line.trim().is_empty()) {
                    lines.push(String::new());
                }
                lines.extend(chunk.into_iter().map(str::to_string));
                cursor = lines.len();
            }
        }
    }
    with_trailing_newline(&lines.join("\n"))
}

/// Prefixes `---`/`+++` headers when a printed diff omits them.
pub fn with_file_headers(patch: &str, path: Option<&str>) -> String {
    let has_headers = patch
        .lines()
        .any(|line| line.starts_with("--- ") || line.starts_with("diff --git"));
    match path {
        Some(path) if !has_headers => format!("--- a/{path}\n+++ b/{path}\n{patch}"),
        _ => patch.to_string(),
    }
}

fn append_listing(existing: &str, listing: &str) -> String {
    let mut merged = existing.trim_end_matches('\n').to_string();
    if !merged.is_empty() {
        merged.push('\n');
    }
    merged.push_str(listing.trim_end_matches('\n'));
    with_trailing_newline(&merged)
}

fn has_elision(listing: &str) -> bool {
    listing.lines().any(|line| line.trim() == ELISION)
}

fn split_chunks(listing: &str) -> Vec<Vec<&str>> {
    let mut chunks = vec![Vec::new()];
    for line in listing.lines() {
        if line.trim() == ELISION {
            chunks.push(Vec::new());
        } else if let Some(current) = chunks.last_mut() {
            current.push(line);
        }
    }
    chunks
        .into_iter()
        .map(|mut chunk| {
            while chunk.first().is_some_and(|line| line.trim().is_empty()) {
                chunk.remove(0);
            }
            while chunk.last().is_some_and(|line| line.trim().is_empty()) {
                chunk.pop();
            }
            chunk
        })
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn find_line(lines: &[String], anchor: &str, from: usize) -> Option<usize> {
    let anchor = anchor.trim();
    lines
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, line)| line.trim() == anchor)
        .map(|(idx, _)| idx)
}

fn indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// One past the last line of the block headed by `lines[start]`.
fn block_end(lines: &[String], start: usize) -> usize {
    let head = indent(&lines[start]);
    let mut end = start + 1;
    let mut last_content = start + 1;
    while end < lines.len() {
        let line = &lines[end];
        if line.trim().is_empty() {
            end += 1;
            continue;
        }
        if indent(line) <= head {
            break;
        }
        end += 1;
        last_content = end;
    }
    last_content
}

fn with_trailing_newline(text: &str) -> String {
    let mut text = text.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEWS: &str = "\
from django.shortcuts import render

def home_page(request):
    return render(request, 'home.html')

def view_list(request):
    pass
";

    #[test]
    fn full_listing_replaces_file() {
        let merged = merge_listing(Some(VIEWS), "x = 1", false);
        assert_eq!(merged, "x = 1\n");
    }

    #[test]
    fn untitled_listing_appends_to_current_file() {
        let merged = merge_listing(Some("a = 1\n"), "b = 2\n", true);
        assert_eq!(merged, "a = 1\nb = 2\n");
        assert_eq!(merge_listing(None, "b = 2", true), "b = 2\n");
    }

    #[test]
    fn partial_listing_replaces_anchored_block() {
        let listing = "\
[...]
def home_page(request):
    if request.method == 'POST':
        return HttpResponse(request.POST['item_text'])
    return render(request, 'home.html')
[...]
";
        let merged = merge_listing(Some(VIEWS), listing, false);
        assert_eq!(
            merged,
            "\
from django.shortcuts import render

def home_page(request):
    if request.method == 'POST':
        return HttpResponse(request.POST['item_text'])
    return render(request, 'home.html')

def view_list(request):
    pass
"
        );
    }

    #[test]
    fn partial_listing_extends_single_line_anchor() {
        let listing = "\
from django.shortcuts import render
from lists.models import Item
[...]
";
        let merged = merge_listing(Some(VIEWS), listing, false);
        assert!(merged.starts_with(
            "from django.shortcuts import render\nfrom lists.models import Item\n\ndef home_page"
        ));
    }

    #[test]
    fn unanchored_chunk_is_appended() {
        let listing = "[...]\ndef new_list(request):\n    pass\n";
        let merged = merge_listing(Some(VIEWS), listing, false);
        assert!(merged.ends_with("    pass\n\ndef new_list(request):\n    pass\n"));
    }

    #[test]
    fn partial_listing_into_missing_file_drops_elisions() {
        let merged = merge_listing(None, "import os\n[...]\nprint(os.name)\n", false);
        assert_eq!(merged, "import os\nprint(os.name)\n");
    }

    #[test]
    fn diff_headers_are_added_only_when_missing() {
        let bare = "@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(
            with_file_headers(bare, Some("lists/views.py")),
            "--- a/lists/views.py\n+++ b/lists/views.py\n@@ -1 +1 @@\n-a\n+b\n"
        );
        let full = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(with_file_headers(full, Some("x")), full);
        assert_eq!(with_file_headers(bare, None), bare);
    }
}
