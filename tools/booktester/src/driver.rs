//! Sequential replay of a chapter's listings against a sandbox.
//!
//! Listings are processed strictly in source order: each one assumes the
//! cumulative effect of every listing before it. The only exception is an
//! operator fast-forward, which moves the cursor forward and checks the
//! sandbox out at the revision that embodies the bypassed listings.

use crate::apply::{merge_listing, with_file_headers};
use crate::directives::{FastForward, SkipDirectives};
use crate::errors::BookTesterError;
use crate::ledger::{CheckLedger, CheckReason};
use crate::logging::append_run_log;
use crate::oracle::{DiffIgnore, Oracle};
use crate::parser::parse_listings;
use crate::sandbox::Sandbox;
use crate::types::{CommandOutput, LineRange, Listing, ListingKind, RunState};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    pub chapter_no: u32,
    pub skips: SkipDirectives,
    pub fast_forward: Option<FastForward>,
    /// Accept fast-forwarded listings as checked without running them.
    pub trust_fast_forward: bool,
    pub prep_database: bool,
    /// Compare files written by labelled listings with the labelled revision.
    pub check_commits: bool,
    pub final_diff_ignore: Vec<DiffIgnore>,
    pub expected_final_diff: String,
}

impl ReplayOptions {
    pub fn new(chapter_no: u32) -> Self {
        Self {
            chapter_no,
            skips: SkipDirectives::default(),
            fast_forward: None,
            trust_fast_forward: false,
            prep_database: false,
            check_commits: false,
            final_diff_ignore: Vec::new(),
            expected_final_diff: String::new(),
        }
    }
}

/// Mutable state of one chapter run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayContext {
    pub state: RunState,
    pub pos: usize,
    pub ledger: CheckLedger,
    pub last_output: Option<CommandOutput>,
    pub current_file: Option<String>,
}

impl Default for ReplayContext {
    fn default() -> Self {
        Self {
            state: RunState::NotStarted,
            pos: 0,
            ledger: CheckLedger::default(),
            last_output: None,
            current_file: None,
        }
    }
}

impl ReplayContext {
    pub fn transition(&mut self, next: RunState) -> Result<(), BookTesterError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), BookTesterError> {
    use RunState as S;

    // Setup failures (bad directives, no checkout point) fail a run that never started.
    let allowed = match from {
        S::NotStarted => matches!(to, S::Running | S::Failed),
        S::Running => matches!(to, S::Completed | S::Failed),
        S::Completed | S::Failed => false,
    };
    if !allowed {
        return Err(BookTesterError::IllegalTransition {
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub chapter_no: u32,
    pub total: usize,
    pub context: ReplayContext,
    pub error: Option<BookTesterError>,
}

impl ReplayOutcome {
    pub fn passed(&self) -> bool {
        self.context.state == RunState::Completed && self.error.is_none()
    }
}

pub struct ReplayDriver<'a, S: Sandbox + ?Sized> {
    listings: &'a [Listing],
    sandbox: &'a mut S,
    oracle: &'a Oracle,
    options: ReplayOptions,
    skips: BTreeMap<usize, String>,
    context: ReplayContext,
}

impl<'a, S: Sandbox + ?Sized> ReplayDriver<'a, S> {
    pub fn new(
        listings: &'a [Listing],
        sandbox: &'a mut S,
        oracle: &'a Oracle,
        options: ReplayOptions,
    ) -> Self {
        Self {
            listings,
            sandbox,
            oracle,
            options,
            skips: BTreeMap::new(),
            context: ReplayContext::default(),
        }
    }

    pub fn context(&self) -> &ReplayContext {
        &self.context
    }

    /// Validates directives, checks the sandbox out and applies any
    /// fast-forward. Nothing touches the sandbox if the directives are bad.
    pub fn start(&mut self) -> Result<(), BookTesterError> {
        if self.context.state != RunState::NotStarted {
            return Err(BookTesterError::IllegalTransition {
                from: self.context.state.as_str(),
                to: RunState::Running.as_str(),
            });
        }
        self.skips = self.options.skips.resolve(self.listings)?;
        if let Some(ff) = &self.options.fast_forward {
            self.check_fast_forward(ff.index)?;
        }

        let chapter = self.options.chapter_no;
        self.sandbox.start_with_checkout(chapter)?;
        self.context.transition(RunState::Running)?;
        append_run_log(
            "info",
            "replay.started",
            json!({
                "chapter": chapter,
                "listings": self.listings.len(),
                "skips": self.skips.len()
            }),
        );

        if self.options.prep_database {
            self.sandbox.prep_database()?;
        }
        if let Some(ff) = self.options.fast_forward.clone() {
            self.fast_forward(ff.index, &ff.label)?;
        }
        Ok(())
    }

    /// Jumps the cursor to `target` and checks out the revision for `label`;
    /// the bypassed listings are marked checked as a batch.
    pub fn fast_forward(&mut self, target: usize, label: &str) -> Result<(), BookTesterError> {
        self.ensure_running()?;
        self.check_fast_forward(target)?;
        let from = self.context.pos;
        if target < from {
            return Err(BookTesterError::InvalidDirective(format!(
                "fast-forward may only move forward (cursor {from}, target {target})"
            )));
        }

        let revision = self.sandbox.get_commit_spec(label)?;
        self.sandbox.checkout(&revision)?;
        if let Some(path) = last_named_file(&self.listings[from..target]) {
            self.context.current_file = Some(path);
        }
        self.context
            .ledger
            .mark_range(from..target, CheckReason::FastForwarded);
        self.context.last_output = None;
        self.context.pos = target;
        append_run_log(
            "warn",
            "replay.fast_forward",
            json!({
                "chapter": self.options.chapter_no,
                "from": from,
                "to": target,
                "label": label,
                "revision": revision
            }),
        );
        Ok(())
    }

    /// Processes the listing at the cursor (a command also consumes the
    /// output listing that documents it).
    pub fn step(&mut self) -> Result<(), BookTesterError> {
        self.ensure_running()?;
        let index = self.context.pos;
        let listings = self.listings;
        let listing = listings.get(index).ok_or_else(|| {
            BookTesterError::Process(format!("no listing at position {index}"))
        })?;

        if let Some(reason) = self.skip_reason(index) {
            if let Some(path) = &listing.target_file {
                self.context.current_file = Some(path.clone());
            }
            // A skipped command takes the output listing that documents it along.
            let consumed = match self.documenting_output(index, listing) {
                Some(_) => 2,
                None => 1,
            };
            self.context
                .ledger
                .mark_range(index..index + consumed, CheckReason::Skipped);
            self.context.pos += consumed;
            append_run_log(
                "info",
                "replay.listing.skipped",
                json!({
                    "index": index,
                    "lines": listing.address.to_string(),
                    "consumed": consumed,
                    "reason": reason
                }),
            );
            return Ok(());
        }

        let consumed = match listing.kind {
            ListingKind::CodeListing => {
                self.apply_code(listing)?;
                1
            }
            ListingKind::Diff => {
                self.apply_diff(listing)?;
                1
            }
            ListingKind::Command => self.run_command(index, listing)?,
            ListingKind::Output => {
                self.verify_output(listing)?;
                1
            }
            ListingKind::CurrentContents => {
                self.check_contents(listing)?;
                1
            }
            ListingKind::Illustration => 1,
        };

        self.context
            .ledger
            .mark_range(index..index + consumed, CheckReason::Verified);
        self.context.pos += consumed;
        append_run_log(
            "debug",
            "replay.listing.checked",
            json!({
                "index": index,
                "kind": listing.kind.as_str(),
                "lines": listing.address.to_string(),
                "consumed": consumed
            }),
        );
        Ok(())
    }

    /// Coverage and final-diff checks; moves the run to `Completed`.
    pub fn finish(&mut self) -> Result<(), BookTesterError> {
        self.ensure_running()?;
        let missing = self.context.ledger.missing(self.listings.len());
        if !missing.is_empty() {
            return Err(BookTesterError::IncompleteCoverage { missing });
        }

        let diff = self.sandbox.diff(&self.options.final_diff_ignore)?;
        let end_line = self
            .listings
            .last()
            .map(|listing| listing.address.end)
            .unwrap_or_default();
        self.oracle
            .verify_diff(
                LineRange::new(end_line, end_line),
                &self.options.expected_final_diff,
                &diff,
                &self.options.final_diff_ignore,
            )?
            .into_result()?;

        self.context.transition(RunState::Completed)?;
        append_run_log(
            "info",
            "replay.completed",
            json!({
                "chapter": self.options.chapter_no,
                "verified": self.context.ledger.verified_count(),
                "skipped": self.context.ledger.skipped_count(),
                "fast_forwarded": self.context.ledger.fast_forwarded_count()
            }),
        );
        Ok(())
    }

    pub fn run(mut self) -> ReplayOutcome {
        let error = self.drive().err();
        if let Some(error) = &error {
            // Only a run already in a terminal state refuses the edge.
            let _ = self.context.transition(RunState::Failed);
            append_run_log(
                "error",
                "replay.failed",
                json!({
                    "chapter": self.options.chapter_no,
                    "pos": self.context.pos,
                    "lines": error.address().map(|address| address.to_string()),
                    "error": error.to_string()
                }),
            );
        }
        ReplayOutcome {
            chapter_no: self.options.chapter_no,
            total: self.listings.len(),
            context: self.context,
            error,
        }
    }

    fn drive(&mut self) -> Result<(), BookTesterError> {
        self.start()?;
        while self.context.pos < self.listings.len() {
            self.step()?;
        }
        self.finish()
    }

    fn ensure_running(&self) -> Result<(), BookTesterError> {
        if self.context.state != RunState::Running {
            return Err(BookTesterError::Process(format!(
                "replay is {}, not running",
                self.context.state.as_str()
            )));
        }
        Ok(())
    }

    fn check_fast_forward(&self, target: usize) -> Result<(), BookTesterError> {
        if !self.options.trust_fast_forward {
            return Err(BookTesterError::InvalidDirective(format!(
                "fast-forward to listing {target} would mark the bypassed listings checked \
                 without running them; enable trust_fast_forward to accept that"
            )));
        }
        if target > self.listings.len() {
            return Err(BookTesterError::InvalidDirective(format!(
                "fast-forward target {target} is past the last listing ({})",
                self.listings.len()
            )));
        }
        Ok(())
    }

    fn skip_reason(&self, index: usize) -> Option<String> {
        if let Some(reason) = self.skips.get(&index) {
            return Some(reason.clone());
        }
        let listing = self.listings.get(index)?;
        listing
            .skip
            .then(|| "marked skipme in the chapter".to_string())
    }

    /// The Output listing right after a command without inline output.
    fn documenting_output(&self, index: usize, listing: &Listing) -> Option<&'a Listing> {
        if listing.kind != ListingKind::Command || listing.expected_output.is_some() {
            return None;
        }
        let listings = self.listings;
        listings
            .get(index + 1)
            .filter(|next| next.kind == ListingKind::Output && self.skip_reason(index + 1).is_none())
    }

    fn target_path(&self, listing: &Listing) -> Result<String, BookTesterError> {
        listing
            .target_file
            .clone()
            .or_else(|| self.context.current_file.clone())
            .ok_or(BookTesterError::NoTargetFile {
                address: listing.address,
                kind: listing.kind.as_str(),
            })
    }

    fn apply_code(&mut self, listing: &Listing) -> Result<(), BookTesterError> {
        let path = self.target_path(listing)?;
        let existing = self.sandbox.read_file(&path)?;
        let merged = merge_listing(
            existing.as_deref(),
            &listing.contents,
            listing.target_file.is_none(),
        );
        self.sandbox.write_file(&path, &merged)?;
        self.context.current_file = Some(path.clone());

        if let (true, Some(label)) = (self.options.check_commits, &listing.commit_label) {
            let revision = self.sandbox.get_commit_spec(label)?;
            let reference = self.sandbox.read_file_at(&revision, &path)?;
            self.oracle
                .verify(
                    listing.address,
                    &format!("{path} compared with commit {label}"),
                    &reference,
                    &merged,
                )
                .into_result()?;
        }
        Ok(())
    }

    fn apply_diff(&mut self, listing: &Listing) -> Result<(), BookTesterError> {
        let path = listing
            .target_file
            .clone()
            .or_else(|| self.context.current_file.clone());
        let patch = with_file_headers(&listing.contents, path.as_deref());
        self.sandbox.apply_patch(&patch)?;
        if let Some(path) = path {
            self.context.current_file = Some(path);
        }
        Ok(())
    }

    fn run_command(&mut self, index: usize, listing: &Listing) -> Result<usize, BookTesterError> {
        let output = self.sandbox.run_command(&listing.contents)?;
        self.context.last_output = Some(output.clone());

        let (expected, address, consumed) = match (
            &listing.expected_output,
            self.documenting_output(index, listing),
        ) {
            (Some(inline), _) => (Some(inline.as_str()), listing.address, 1),
            (None, Some(next)) => (Some(next.contents.as_str()), next.address, 2),
            (None, None) => (None, listing.address, 1),
        };

        match expected {
            Some(expected) => self
                .oracle
                .verify(
                    address,
                    &format!("output of `{}`", listing.contents),
                    expected,
                    &output.output,
                )
                .into_result()?,
            None if output.exit_code != 0 && !listing.ignore_errors => {
                return Err(BookTesterError::CommandFailed {
                    address: listing.address,
                    command: listing.contents.clone(),
                    exit_code: output.exit_code,
                    output: output.output,
                })
            }
            None => {}
        }
        Ok(consumed)
    }

    fn verify_output(&mut self, listing: &Listing) -> Result<(), BookTesterError> {
        let (context, actual) = match &self.context.last_output {
            Some(output) => ("output of the most recent command", output.output.as_str()),
            None => ("output with no command run before it", ""),
        };
        self.oracle
            .verify(listing.address, context, &listing.contents, actual)
            .into_result()
    }

    fn check_contents(&mut self, listing: &Listing) -> Result<(), BookTesterError> {
        let path = self.target_path(listing)?;
        let actual = self.sandbox.read_file(&path)?;
        let context = match &actual {
            Some(_) => format!("current contents of {path}"),
            None => format!("current contents of {path} (file does not exist)"),
        };
        self.oracle
            .verify_contains(
                listing.address,
                &context,
                &listing.contents,
                actual.as_deref().unwrap_or_default(),
            )
            .into_result()
    }
}

fn last_named_file(listings: &[Listing]) -> Option<String> {
    listings
        .iter()
        .rev()
        .find_map(|listing| listing.target_file.clone())
}

/// Parses and replays one chapter. A parse failure never touches the sandbox.
pub fn replay_chapter<S: Sandbox + ?Sized>(
    text: &str,
    sandbox: &mut S,
    oracle: &Oracle,
    options: ReplayOptions,
) -> ReplayOutcome {
    let listings = match parse_listings(text) {
        Ok(listings) => listings,
        Err(error) => {
            append_run_log(
                "error",
                "replay.parse_failed",
                json!({ "chapter": options.chapter_no, "error": error.to_string() }),
            );
            return ReplayOutcome {
                chapter_no: options.chapter_no,
                total: 0,
                context: ReplayContext {
                    state: RunState::Failed,
                    ..ReplayContext::default()
                },
                error: Some(error),
            };
        }
    };
    ReplayDriver::new(&listings, sandbox, oracle, options).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::{SkipEntry, SkipTarget};
    use crate::sandbox::memory::{MemorySandbox, SandboxCall};

    fn code(path: &str, contents: &str, line: usize) -> Listing {
        Listing::new(ListingKind::CodeListing, contents, LineRange::new(line, line + 2))
            .with_target_file(path)
    }

    fn command(text: &str, line: usize) -> Listing {
        Listing::new(ListingKind::Command, text, LineRange::new(line, line))
    }

    fn output(text: &str, line: usize) -> Listing {
        Listing::new(ListingKind::Output, text, LineRange::new(line, line + 2))
    }

    #[test]
    fn transition_validator_rejects_invalid_edges() {
        assert!(validate_transition(RunState::NotStarted, RunState::Running).is_ok());
        assert!(validate_transition(RunState::Running, RunState::Completed).is_ok());
        let err = validate_transition(RunState::NotStarted, RunState::Completed)
            .expect_err("must reject");
        assert!(matches!(err, BookTesterError::IllegalTransition { from: "not_started", to: "completed" }));
        assert!(validate_transition(RunState::Completed, RunState::Failed).is_err());
        assert!(validate_transition(RunState::Failed, RunState::Running).is_err());
    }

    #[test]
    fn step_before_start_is_rejected() {
        let listings = vec![command("ls", 1)];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let mut driver = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(1));
        assert!(driver.step().is_err());
        assert_eq!(driver.context().pos, 0);
    }

    #[test]
    fn inline_expected_output_is_verified() {
        let listings = vec![command("git status", 4).with_expected_output("nothing to commit")];
        let mut sandbox = MemorySandbox::new().respond(
            "git status",
            CommandOutput::success("On branch main\nnothing to commit"),
        );
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(1)).run();
        assert!(outcome.error.is_some(), "inline output must match in full");

        let listings = vec![command("git status", 4).with_expected_output("[...]\nnothing to commit")];
        let mut sandbox = MemorySandbox::new().respond(
            "git status",
            CommandOutput::success("On branch main\nnothing to commit"),
        );
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(1)).run();
        assert!(outcome.passed(), "{:?}", outcome.error);
    }

    #[test]
    fn failing_command_without_expected_output_is_fatal() {
        let listings = vec![command("make", 7), command("ls", 9)];
        let mut sandbox = MemorySandbox::new()
            .respond("make", CommandOutput::failure(2, "no rule"))
            .respond("ls", CommandOutput::success(""));
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(3)).run();

        assert_eq!(outcome.context.state, RunState::Failed);
        assert!(matches!(
            outcome.error,
            Some(BookTesterError::CommandFailed { exit_code: 2, address, .. }) if address == LineRange::new(7, 7)
        ));
        assert_eq!(sandbox.commands_run(), vec!["make".to_string()]);
    }

    #[test]
    fn ignore_errors_tolerates_non_zero_exit() {
        let mut listing = command("rm missing.txt", 7);
        listing.ignore_errors = true;
        let listings = vec![listing];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(3)).run();
        assert!(outcome.passed(), "{:?}", outcome.error);
    }

    #[test]
    fn failing_tests_are_fine_when_the_book_shows_the_failure() {
        let listings = vec![command("python manage.py test", 3), output("FAILED (failures=1)", 5)];
        let mut sandbox = MemorySandbox::new().respond(
            "python manage.py test",
            CommandOutput::failure(1, "F\nFAILED (failures=1)"),
        );
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(3)).run();
        assert!(outcome.error.is_some());

        let listings = vec![command("python manage.py test", 3), output("F\nFAILED (failures=1)", 5)];
        let mut sandbox = MemorySandbox::new().respond(
            "python manage.py test",
            CommandOutput::failure(1, "F\nFAILED (failures=1)"),
        );
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(3)).run();
        assert!(outcome.passed(), "{:?}", outcome.error);
        assert_eq!(outcome.context.ledger.verified_count(), 2);
    }

    #[test]
    fn untitled_listing_appends_to_most_recent_file() {
        let listings = vec![
            code("lists/tests.py", "import unittest", 1),
            Listing::new(ListingKind::CodeListing, "class T(unittest.TestCase): pass", LineRange::new(5, 7)),
        ];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(2)).run();
        assert!(outcome.passed(), "{:?}", outcome.error);
        assert_eq!(
            sandbox.file("lists/tests.py"),
            Some("import unittest\nclass T(unittest.TestCase): pass\n")
        );
    }

    #[test]
    fn current_contents_must_be_present() {
        let mut check = Listing::new(ListingKind::CurrentContents, "import os", LineRange::new(9, 11));
        check.target_file = Some("settings.py".to_string());
        let listings = vec![check];
        let mut sandbox = MemorySandbox::new().with_file("settings.py", "import sys\n");
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(2)).run();
        let Some(BookTesterError::VerificationMismatch(mismatch)) = outcome.error else {
            panic!("expected mismatch");
        };
        assert_eq!(mismatch.address, LineRange::new(9, 11));
        assert!(mismatch.context.contains("settings.py"));
    }

    #[test]
    fn diff_listing_is_applied_as_patch_with_headers() {
        let mut diff = Listing::new(ListingKind::Diff, "@@ -1 +1 @@\n-a\n+b", LineRange::new(3, 7));
        diff.target_file = Some("a.py".to_string());
        let listings = vec![diff];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(2)).run();
        assert!(outcome.passed(), "{:?}", outcome.error);
        assert!(sandbox.calls().contains(&SandboxCall::ApplyPatch(
            "--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-a\n+b".to_string()
        )));
    }

    #[test]
    fn commit_check_compares_file_with_labelled_revision() {
        let listings = vec![code("a.py", "x = 1", 1).with_commit_label("ch02l001")];
        let mut options = ReplayOptions::new(2);
        options.check_commits = true;
        let oracle = Oracle::default();

        let mut sandbox = MemorySandbox::new()
            .with_commit("ch02l001", "abc")
            .with_snapshot("abc", &[("a.py", "x = 1\n")]);
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, options.clone()).run();
        assert!(outcome.passed(), "{:?}", outcome.error);

        let mut sandbox = MemorySandbox::new()
            .with_commit("ch02l001", "abc")
            .with_snapshot("abc", &[("a.py", "x = 2\n")]);
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, options).run();
        assert!(matches!(outcome.error, Some(BookTesterError::VerificationMismatch(_))));
    }

    #[test]
    fn document_skip_role_is_honoured_without_sandbox_calls() {
        let mut listing = command("rm -rf /", 2);
        listing.skip = true;
        let listings = vec![listing];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(1)).run();
        assert!(outcome.passed());
        assert!(sandbox.commands_run().is_empty());
        assert_eq!(outcome.context.ledger.skipped_count(), 1);
    }

    #[test]
    fn untrusted_fast_forward_is_rejected_before_checkout() {
        let listings = vec![command("ls", 1), command("ls", 2)];
        let mut options = ReplayOptions::new(11);
        options.fast_forward = Some(FastForward {
            index: 1,
            label: "ch11l030".to_string(),
        });
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, options).run();
        assert!(matches!(outcome.error, Some(BookTesterError::InvalidDirective(_))));
        assert_eq!(outcome.context.state, RunState::Failed);
        assert!(sandbox.calls().is_empty());
    }

    #[test]
    fn fast_forward_never_moves_backwards() {
        let listings = vec![Listing::new(ListingKind::Illustration, "", LineRange::new(1, 3)); 4];
        let mut options = ReplayOptions::new(11);
        options.trust_fast_forward = true;
        let mut sandbox = MemorySandbox::new().with_commit("ch11l030", "abc");
        let oracle = Oracle::default();
        let mut driver = ReplayDriver::new(&listings, &mut sandbox, &oracle, options);
        driver.start().expect("start");
        driver.step().expect("step");
        driver.step().expect("step");
        let err = driver.fast_forward(1, "ch11l030").expect_err("backwards");
        assert!(matches!(err, BookTesterError::InvalidDirective(_)));
        assert_eq!(driver.context().pos, 2);
        driver.fast_forward(4, "ch11l030").expect("forward");
        driver.finish().expect("finish");
        assert_eq!(driver.context().state, RunState::Completed);
    }

    #[test]
    fn unknown_fast_forward_label_fails_the_run() {
        let listings = vec![command("ls", 1)];
        let mut options = ReplayOptions::new(11);
        options.trust_fast_forward = true;
        options.fast_forward = Some(FastForward {
            index: 1,
            label: "ch11l999".to_string(),
        });
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, options).run();
        assert!(matches!(outcome.error, Some(BookTesterError::UnknownCommitLabel(_))));
        assert_eq!(outcome.context.state, RunState::Failed);
    }

    #[test]
    fn residual_final_diff_fails_completion() {
        let listings = vec![code("a.py", "x = 1", 1)];
        let mut sandbox = MemorySandbox::new().with_final_diff("--- a/a.py\n+++ b/a.py\n-x = 2\n+x = 1\n");
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(2)).run();
        let Some(BookTesterError::VerificationMismatch(mismatch)) = outcome.error else {
            panic!("expected final diff mismatch");
        };
        assert_eq!(mismatch.context, "final working-tree diff");
        assert_eq!(mismatch.address, LineRange::new(3, 3));
    }

    #[test]
    fn untitled_code_listing_with_no_earlier_file_fails_at_its_lines() {
        let listings = vec![Listing::new(ListingKind::CodeListing, "x = 1", LineRange::new(12, 15))];
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = ReplayDriver::new(&listings, &mut sandbox, &oracle, ReplayOptions::new(2)).run();

        let error = outcome.error.expect("must fail");
        assert!(matches!(error, BookTesterError::NoTargetFile { kind: "code listing", .. }));
        assert_eq!(error.address(), Some(LineRange::new(12, 15)));
    }

    #[test]
    fn skipping_a_command_with_inline_output_leaves_the_next_output_alone() {
        let listings = vec![
            command("python a.py", 3).with_expected_output("a"),
            output("b", 6),
        ];
        let mut options = ReplayOptions::new(1);
        options.skips.push(SkipEntry {
            target: SkipTarget::Index(0),
            reason: "slow".to_string(),
            expect_contains: None,
        });
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let mut driver = ReplayDriver::new(&listings, &mut sandbox, &oracle, options);
        driver.start().expect("start");
        driver.step().expect("skip");
        assert_eq!(driver.context().pos, 1);
        assert!(!driver.context().ledger.is_checked(1));
    }

    #[test]
    fn parse_failure_never_touches_the_sandbox() {
        let mut sandbox = MemorySandbox::new();
        let oracle = Oracle::default();
        let outcome = replay_chapter("----\nunterminated\n", &mut sandbox, &oracle, ReplayOptions::new(4));
        assert!(matches!(outcome.error, Some(BookTesterError::Parse { line: 1, .. })));
        assert_eq!(outcome.context.state, RunState::Failed);
        assert!(sandbox.calls().is_empty());
    }
}
