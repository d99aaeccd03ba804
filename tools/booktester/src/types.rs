use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Inclusive, 1-based line span of a listing in the chapter source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, line: usize) -> bool {
        (self.start..=self.end).contains(&line)
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    /// Source written to (or merged into) a named file.
    CodeListing,
    /// Unified diff applied to the working copy.
    Diff,
    /// Shell command run in the sandbox.
    Command,
    /// Expected console output of the preceding command.
    Output,
    /// Text the named file must already contain.
    CurrentContents,
    /// Documentation-only block, never executed.
    Illustration,
}

impl ListingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeListing => "code listing",
            Self::Diff => "diff",
            Self::Command => "command",
            Self::Output => "output",
            Self::CurrentContents => "current contents",
            Self::Illustration => "illustration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub kind: ListingKind,
    pub contents: String,
    pub address: LineRange,
    pub target_file: Option<String>,
    pub expected_output: Option<String>,
    pub commit_label: Option<String>,
    pub skip: bool,
    pub ignore_errors: bool,
}

impl Listing {
    pub fn new(kind: ListingKind, contents: impl Into<String>, address: LineRange) -> Self {
        Self {
            kind,
            contents: contents.into(),
            address,
            target_file: None,
            expected_output: None,
            commit_label: None,
            skip: false,
            ignore_errors: false,
        }
    }

    pub fn with_target_file(mut self, path: impl Into<String>) -> Self {
        self.target_file = Some(path.into());
        self
    }

    pub fn with_expected_output(mut self, output: impl Into<String>) -> Self {
        self.expected_output = Some(output.into());
        self
    }

    pub fn with_commit_label(mut self, label: impl Into<String>) -> Self {
        self.commit_label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeScope {
    pub process_cwd: PathBuf,
    pub config_dir: PathBuf,
}
