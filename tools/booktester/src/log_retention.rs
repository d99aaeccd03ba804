use crate::errors::BookTesterError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest run logs (`*.jsonl`) in `dir` until they fit
/// `budget_bytes`. Other files in the directory are never counted or removed.
pub fn enforce_total_budget(dir: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, BookTesterError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| BookTesterError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_run_log(path))
        .collect::<Vec<_>>();

    files.sort_by_key(|path| fs::metadata(path).ok().and_then(|m| m.modified().ok()));

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        let len = fs::metadata(&path)
            .map_err(|e| BookTesterError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| BookTesterError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

fn is_run_log(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jsonl")
}
