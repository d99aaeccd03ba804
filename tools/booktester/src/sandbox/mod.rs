//! The working copy a chapter is replayed against.
//!
//! The replay driver only talks to a [`Sandbox`]; [`git::GitSandbox`] backs it
//! with a clone of the book's example repository and [`memory::MemorySandbox`]
//! is a scripted in-memory stand-in.

pub mod git;
pub mod memory;

use crate::errors::BookTesterError;
use crate::oracle::DiffIgnore;
use crate::types::CommandOutput;

/// One writer per instance: every mutation takes `&mut self`.
pub trait Sandbox {
    /// Fails with `SandboxInit` when the chapter has no starting revision.
    fn start_with_checkout(&mut self, chapter_no: u32) -> Result<(), BookTesterError>;

    /// Runs a shell command; stdout and stderr come back interleaved.
    fn run_command(&mut self, command: &str) -> Result<CommandOutput, BookTesterError>;

    /// Fails with `UnknownCommitLabel` when the label maps to no revision.
    fn get_commit_spec(&self, label: &str) -> Result<String, BookTesterError>;

    fn checkout(&mut self, revision: &str) -> Result<(), BookTesterError>;

    /// Working tree against the end-of-chapter baseline.
    fn diff(&self, ignore: &[DiffIgnore]) -> Result<String, BookTesterError>;

    fn prep_database(&mut self) -> Result<(), BookTesterError>;

    /// `None` when the file does not exist yet.
    fn read_file(&self, path: &str) -> Result<Option<String>, BookTesterError>;

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), BookTesterError>;

    fn apply_patch(&mut self, patch: &str) -> Result<(), BookTesterError>;

    fn read_file_at(&self, revision: &str, path: &str) -> Result<String, BookTesterError>;
}

/// Rejects listing paths that would land outside the working copy.
pub fn validate_relative_path(path: &str) -> Result<(), BookTesterError> {
    let candidate = std::path::Path::new(path);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir));
    if path.trim().is_empty() || escapes {
        return Err(BookTesterError::Io(format!(
            "listing path `{path}` must be relative to the sandbox root"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_relative_path;

    #[test]
    fn relative_paths_stay_inside_the_sandbox() {
        assert!(validate_relative_path("lists/tests.py").is_ok());
        assert!(validate_relative_path("./functional_tests.py").is_ok());
        assert!(validate_relative_path("../outside.py").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("  ").is_err());
    }
}
