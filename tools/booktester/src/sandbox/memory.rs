use crate::errors::BookTesterError;
use crate::oracle::DiffIgnore;
use crate::sandbox::{validate_relative_path, Sandbox};
use crate::types::CommandOutput;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCall {
    StartWithCheckout(u32),
    RunCommand(String),
    GetCommitSpec(String),
    Checkout(String),
    Diff(Vec<DiffIgnore>),
    PrepDatabase,
    ReadFile(String),
    WriteFile(String),
    ApplyPatch(String),
    ReadFileAt(String, String),
}

/// Scripted sandbox: commands answer from queued responses, files live in a
/// map, and every call is recorded for assertions.
#[derive(Debug, Default)]
pub struct MemorySandbox {
    files: BTreeMap<String, String>,
    responses: HashMap<String, VecDeque<CommandOutput>>,
    commits: BTreeMap<String, String>,
    snapshots: BTreeMap<String, BTreeMap<String, String>>,
    checkout_points: Option<BTreeSet<u32>>,
    final_diff: String,
    calls: RefCell<Vec<SandboxCall>>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    /// Queue a response; the last one queued for a command keeps answering.
    pub fn respond(mut self, command: &str, output: CommandOutput) -> Self {
        self.responses
            .entry(command.to_string())
            .or_default()
            .push_back(output);
        self
    }

    pub fn with_commit(mut self, label: &str, revision: &str) -> Self {
        self.commits.insert(label.to_string(), revision.to_string());
        self
    }

    /// Files the working copy holds after `checkout(revision)`.
    pub fn with_snapshot(mut self, revision: &str, files: &[(&str, &str)]) -> Self {
        self.snapshots.insert(
            revision.to_string(),
            files
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        );
        self
    }

    pub fn with_checkout_points(mut self, chapters: &[u32]) -> Self {
        self.checkout_points = Some(chapters.iter().copied().collect());
        self
    }

    pub fn with_final_diff(mut self, diff: &str) -> Self {
        self.final_diff = diff.to_string();
        self
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.calls.borrow().clone()
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                SandboxCall::RunCommand(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    fn record(&self, call: SandboxCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl Sandbox for MemorySandbox {
    fn start_with_checkout(&mut self, chapter_no: u32) -> Result<(), BookTesterError> {
        self.record(SandboxCall::StartWithCheckout(chapter_no));
        match &self.checkout_points {
            Some(points) if !points.contains(&chapter_no) => Err(BookTesterError::SandboxInit {
                chapter: chapter_no,
                message: "no checkout point registered".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn run_command(&mut self, command: &str) -> Result<CommandOutput, BookTesterError> {
        self.record(SandboxCall::RunCommand(command.to_string()));
        let Some(queue) = self.responses.get_mut(command) else {
            return Ok(CommandOutput::failure(
                127,
                format!("sh: 1: {command}: not found"),
            ));
        };
        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        output.ok_or_else(|| BookTesterError::Process(format!("no response for `{command}`")))
    }

    fn get_commit_spec(&self, label: &str) -> Result<String, BookTesterError> {
        self.record(SandboxCall::GetCommitSpec(label.to_string()));
        self.commits
            .get(label)
            .cloned()
            .ok_or_else(|| BookTesterError::UnknownCommitLabel(label.to_string()))
    }

    fn checkout(&mut self, revision: &str) -> Result<(), BookTesterError> {
        self.record(SandboxCall::Checkout(revision.to_string()));
        if let Some(files) = self.snapshots.get(revision) {
            self.files = files.clone();
        }
        Ok(())
    }

    fn diff(&self, ignore: &[DiffIgnore]) -> Result<String, BookTesterError> {
        self.record(SandboxCall::Diff(ignore.to_vec()));
        Ok(self.final_diff.clone())
    }

    fn prep_database(&mut self) -> Result<(), BookTesterError> {
        self.record(SandboxCall::PrepDatabase);
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<String>, BookTesterError> {
        self.record(SandboxCall::ReadFile(path.to_string()));
        validate_relative_path(path)?;
        Ok(self.files.get(path).cloned())
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), BookTesterError> {
        self.record(SandboxCall::WriteFile(path.to_string()));
        validate_relative_path(path)?;
        self.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn apply_patch(&mut self, patch: &str) -> Result<(), BookTesterError> {
        self.record(SandboxCall::ApplyPatch(patch.to_string()));
        Ok(())
    }

    fn read_file_at(&self, revision: &str, path: &str) -> Result<String, BookTesterError> {
        self.record(SandboxCall::ReadFileAt(revision.to_string(), path.to_string()));
        self.snapshots
            .get(revision)
            .and_then(|files| files.get(path))
            .cloned()
            .ok_or_else(|| {
                BookTesterError::Process(format!("{path} does not exist at revision {revision}"))
            })
    }
}
