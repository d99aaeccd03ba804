use crate::errors::BookTesterError;
use crate::logging::append_run_log;
use crate::oracle::DiffIgnore;
use crate::runtime::{FileSystem, ProcessOutput, ProcessRequest, ProcessRunner};
use crate::sandbox::{validate_relative_path, Sandbox};
use crate::types::CommandOutput;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const PATCH_FILE: &str = ".git/booktester-listing.patch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSandboxSettings {
    /// Repository holding the example project and its per-chapter refs.
    pub source_repo: PathBuf,
    pub workdir_root: Option<PathBuf>,
    /// Ref templates; `{chapter}`, `{chapter:02}`, `{prev}` and `{prev:02}` expand.
    pub start_ref: String,
    pub end_ref: String,
    pub database_command: Option<String>,
    pub commits: BTreeMap<String, String>,
    /// Leave the working copy on disk after the run.
    pub keep: bool,
}

pub struct GitSandbox<'a> {
    runner: &'a dyn ProcessRunner,
    fs: &'a dyn FileSystem,
    settings: GitSandboxSettings,
    chapter: Option<u32>,
    workdir: Option<tempfile::TempDir>,
}

impl<'a> GitSandbox<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        fs: &'a dyn FileSystem,
        settings: GitSandboxSettings,
    ) -> Self {
        Self {
            runner,
            fs,
            settings,
            chapter: None,
            workdir: None,
        }
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(tempfile::TempDir::path)
    }

    fn cwd(&self) -> Result<PathBuf, BookTesterError> {
        self.workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| BookTesterError::Process("sandbox has not been checked out".to_string()))
    }

    fn git<I, S>(&self, args: I) -> Result<ProcessOutput, BookTesterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cwd = self.cwd()?;
        self.runner.run(ProcessRequest::new("git", args, Some(&cwd)))
    }

    fn git_checked<I, S>(&self, args: I, event: &str) -> Result<String, BookTesterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_string())
            .collect::<Vec<_>>();
        let out = self.git(&args)?;
        if out.exit_code != 0 {
            append_run_log(
                "error",
                event,
                json!({
                    "args": args,
                    "exit_code": out.exit_code,
                    "stderr": out.stderr
                }),
            );
            return Err(BookTesterError::Process(format!(
                "git {} failed ({}): {}",
                args.join(" "),
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    fn resolve_ref(&self, reference: &str) -> Option<String> {
        [reference.to_string(), format!("origin/{reference}")]
            .into_iter()
            .find_map(|candidate| {
                let out = self
                    .git([
                        "rev-parse",
                        "--verify",
                        "--quiet",
                        &format!("{candidate}^{{commit}}"),
                    ])
                    .ok()?;
                let sha = out.stdout.trim();
                (out.exit_code == 0 && !sha.is_empty()).then(|| sha.to_string())
            })
    }

    fn end_revision(&self) -> Result<String, BookTesterError> {
        let chapter = self
            .chapter
            .ok_or_else(|| BookTesterError::Process("sandbox has not been checked out".to_string()))?;
        let reference = render_ref(&self.settings.end_ref, chapter);
        self.resolve_ref(&reference).ok_or_else(|| {
            BookTesterError::Process(format!("end-of-chapter ref `{reference}` does not exist"))
        })
    }
}

/// Expands the chapter placeholders of a ref template.
pub fn render_ref(template: &str, chapter: u32) -> String {
    let prev = chapter.saturating_sub(1);
    template
        .replace("{chapter:02}", &format!("{chapter:02}"))
        .replace("{chapter}", &chapter.to_string())
        .replace("{prev:02}", &format!("{prev:02}"))
        .replace("{prev}", &prev.to_string())
}

impl Sandbox for GitSandbox<'_> {
    fn start_with_checkout(&mut self, chapter_no: u32) -> Result<(), BookTesterError> {
        let init_error = |message: String| BookTesterError::SandboxInit {
            chapter: chapter_no,
            message,
        };

        let mut builder = tempfile::Builder::new();
        let prefix = format!("booktester-chapter-{chapter_no:02}-");
        builder.prefix(&prefix).disable_cleanup(self.settings.keep);
        let dir = match &self.settings.workdir_root {
            Some(root) => {
                self.fs.create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| init_error(e.to_string()))?;

        let clone = self.runner.run(ProcessRequest::new(
            "git",
            [
                "clone".to_string(),
                "--quiet".to_string(),
                self.settings.source_repo.display().to_string(),
                dir.path().display().to_string(),
            ],
            None,
        ))?;
        if clone.exit_code != 0 {
            return Err(init_error(format!("git clone failed: {}", clone.stderr.trim())));
        }
        self.workdir = Some(dir);
        self.chapter = Some(chapter_no);

        let reference = render_ref(&self.settings.start_ref, chapter_no);
        let revision = self
            .resolve_ref(&reference)
            .ok_or_else(|| init_error(format!("no checkout point `{reference}`")))?;
        let branch = format!("booktester-chapter-{chapter_no:02}");
        self.git_checked(
            ["checkout", "--quiet", "-B", branch.as_str(), revision.as_str()],
            "sandbox.checkout.failed",
        )
        .map_err(|e| init_error(e.to_string()))?;

        append_run_log(
            "info",
            "sandbox.started",
            json!({
                "chapter": chapter_no,
                "workdir": self.workdir().map(|p| p.display().to_string()),
                "start_ref": reference,
                "revision": revision,
                "kept": self.settings.keep
            }),
        );
        Ok(())
    }

    fn run_command(&mut self, command: &str) -> Result<CommandOutput, BookTesterError> {
        let cwd = self.cwd()?;
        let script = format!("exec 2>&1\n{command}");
        let out = self
            .runner
            .run(ProcessRequest::new("sh", ["-c", script.as_str()], Some(&cwd)))?;
        let mut output = out.stdout;
        output.push_str(&out.stderr);
        append_run_log(
            "debug",
            "sandbox.command.finished",
            json!({
                "command": command,
                "exit_code": out.exit_code,
                "output": output
            }),
        );
        Ok(CommandOutput {
            exit_code: out.exit_code,
            output,
        })
    }

    fn get_commit_spec(&self, label: &str) -> Result<String, BookTesterError> {
        if let Some(revision) = self.settings.commits.get(label) {
            return Ok(revision.clone());
        }
        let out = self.git([
            "log",
            "--all",
            "--fixed-strings",
            &format!("--grep={label}"),
            "--format=%H",
        ])?;
        let matches = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        match matches.as_slice() {
            [] => Err(BookTesterError::UnknownCommitLabel(label.to_string())),
            [revision] => Ok(revision.to_string()),
            many => Err(BookTesterError::Process(format!(
                "commit label `{label}` matches {} commits",
                many.len()
            ))),
        }
    }

    fn checkout(&mut self, revision: &str) -> Result<(), BookTesterError> {
        self.git_checked(["reset", "--hard", "--quiet", revision], "sandbox.checkout.failed")?;
        append_run_log("info", "sandbox.checkout", json!({ "revision": revision }));
        Ok(())
    }

    fn diff(&self, ignore: &[DiffIgnore]) -> Result<String, BookTesterError> {
        let baseline = self.end_revision()?;
        // Intent-to-add makes files the listings created show up in the diff.
        self.git_checked(["add", "--intent-to-add", "--all"], "sandbox.diff.failed")?;
        let mut args = vec!["diff".to_string(), "--no-color".to_string()];
        if ignore.contains(&DiffIgnore::Whitespace) {
            args.push("--ignore-all-space".to_string());
        }
        if ignore.contains(&DiffIgnore::BlankLines) {
            args.push("--ignore-blank-lines".to_string());
        }
        args.push(baseline);
        self.git_checked(args, "sandbox.diff.failed")
    }

    fn prep_database(&mut self) -> Result<(), BookTesterError> {
        let Some(command) = self.settings.database_command.clone() else {
            append_run_log("debug", "sandbox.database.no_command", json!({}));
            return Ok(());
        };
        let out = self.run_command(&command)?;
        if out.exit_code != 0 {
            return Err(BookTesterError::Process(format!(
                "database preparation `{command}` exited with {}: {}",
                out.exit_code,
                out.output.trim()
            )));
        }
        append_run_log("info", "sandbox.database.prepared", json!({ "command": command }));
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<String>, BookTesterError> {
        validate_relative_path(path)?;
        let full = self.cwd()?.join(path);
        if !self.fs.exists(&full) {
            return Ok(None);
        }
        self.fs.read_to_string(&full).map(Some)
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), BookTesterError> {
        validate_relative_path(path)?;
        let full = self.cwd()?.join(path);
        if let Some(parent) = full.parent() {
            self.fs.create_dir_all(parent)?;
        }
        self.fs.write_string(&full, contents)
    }

    fn apply_patch(&mut self, patch: &str) -> Result<(), BookTesterError> {
        let patch_path = self.cwd()?.join(PATCH_FILE);
        let mut body = patch.to_string();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        self.fs.write_string(&patch_path, &body)?;
        self.git_checked(
            [
                "apply",
                "--recount",
                "--whitespace=nowarn",
                patch_path.display().to_string().as_str(),
            ],
            "sandbox.patch.failed",
        )?;
        Ok(())
    }

    fn read_file_at(&self, revision: &str, path: &str) -> Result<String, BookTesterError> {
        validate_relative_path(path)?;
        self.git_checked(
            ["show", format!("{revision}:{path}").as_str()],
            "sandbox.show.failed",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeFileSystem, FakeProcessRunner};

    fn settings() -> GitSandboxSettings {
        GitSandboxSettings {
            source_repo: PathBuf::from("/books/example"),
            workdir_root: None,
            start_ref: "chapter_{prev:02}".to_string(),
            end_ref: "chapter_{chapter:02}".to_string(),
            database_command: Some("python manage.py migrate --noinput".to_string()),
            commits: BTreeMap::from([("ch11l030".to_string(), "feedbeef".to_string())]),
            keep: false,
        }
    }

    #[test]
    fn ref_templates_expand_chapter_numbers() {
        assert_eq!(render_ref("chapter_{prev:02}", 11), "chapter_10");
        assert_eq!(render_ref("chapter_{chapter:02}", 2), "chapter_02");
        assert_eq!(render_ref("ch{chapter}-start-of-{prev}", 3), "ch3-start-of-2");
    }

    #[test]
    fn start_clones_resolves_ref_and_branches() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_ok("0123abcd\n");
        runner.push_ok("");

        let mut sandbox = GitSandbox::new(&runner, &fs, settings());
        sandbox.start_with_checkout(11).expect("started");

        let spawned = runner.spawned();
        assert_eq!(spawned.len(), 3);
        assert_eq!(spawned[0].args[0], "clone");
        assert_eq!(spawned[0].args[2], "/books/example");
        assert_eq!(spawned[1].args.last().map(String::as_str), Some("chapter_10^{commit}"));
        assert_eq!(
            spawned[2].args,
            vec!["checkout", "--quiet", "-B", "booktester-chapter-11", "0123abcd"]
        );
        assert!(sandbox.workdir().is_some());
    }

    #[test]
    fn kept_workdir_outlives_the_sandbox() {
        let root = tempfile::tempdir().expect("root");
        for keep in [true, false] {
            let runner = FakeProcessRunner::default();
            let fs = FakeFileSystem::default();
            runner.push_ok("");
            runner.push_ok("0123abcd\n");
            runner.push_ok("");
            let mut sandbox = GitSandbox::new(
                &runner,
                &fs,
                GitSandboxSettings {
                    workdir_root: Some(root.path().to_path_buf()),
                    keep,
                    ..settings()
                },
            );
            sandbox.start_with_checkout(4).expect("started");
            let workdir = sandbox.workdir().map(Path::to_path_buf).expect("workdir");
            drop(sandbox);
            assert_eq!(workdir.exists(), keep, "keep = {keep}");
        }
    }

    #[test]
    fn missing_start_ref_is_a_sandbox_init_error() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_exit(1, "");
        runner.push_exit(1, "");

        let err = GitSandbox::new(&runner, &fs, settings())
            .start_with_checkout(1)
            .expect_err("no chapter_00");
        assert!(
            matches!(err, BookTesterError::SandboxInit { chapter: 1, ref message } if message.contains("chapter_00"))
        );
    }

    #[test]
    fn commit_spec_prefers_registered_labels_then_history() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_ok("0123abcd\n");
        runner.push_ok("");
        let mut sandbox = GitSandbox::new(&runner, &fs, settings());
        sandbox.start_with_checkout(11).expect("started");

        assert_eq!(sandbox.get_commit_spec("ch11l030").expect("registered"), "feedbeef");

        runner.push_ok("c0ffee\n");
        assert_eq!(sandbox.get_commit_spec("ch11l031").expect("history"), "c0ffee");

        runner.push_ok("");
        let err = sandbox.get_commit_spec("ch11l099").expect_err("unknown");
        assert!(matches!(err, BookTesterError::UnknownCommitLabel(_)));

        runner.push_ok("aaa\nbbb\n");
        let err = sandbox.get_commit_spec("ch11l0").expect_err("ambiguous");
        assert!(matches!(err, BookTesterError::Process(message) if message.contains("2 commits")));
    }

    #[test]
    fn commands_merge_stderr_into_output() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_ok("0123abcd\n");
        runner.push_ok("");
        let mut sandbox = GitSandbox::new(&runner, &fs, settings());
        sandbox.start_with_checkout(11).expect("started");

        runner.push_response(Ok(ProcessOutput {
            exit_code: 1,
            stdout: "F\n".to_string(),
            stderr: "1 failed\n".to_string(),
        }));
        let out = sandbox.run_command("python manage.py test").expect("ran");
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.output, "F\n1 failed\n");
        let last = runner.spawned().pop().expect("spawned");
        assert_eq!(last.program, "sh");
        assert!(last.args[1].ends_with("python manage.py test"));
    }

    #[test]
    fn files_are_written_under_the_workdir() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_ok("0123abcd\n");
        runner.push_ok("");
        let mut sandbox = GitSandbox::new(&runner, &fs, settings());
        sandbox.start_with_checkout(2).expect("started");

        sandbox
            .write_file("lists/tests.py", "import unittest\n")
            .expect("write");
        assert_eq!(
            sandbox.read_file("lists/tests.py").expect("read").as_deref(),
            Some("import unittest\n")
        );
        assert_eq!(sandbox.read_file("lists/views.py").expect("read"), None);
        assert!(fs.created_dirs().iter().any(|dir| dir.ends_with("lists")));
        assert!(sandbox.write_file("../escape.py", "x").is_err());
    }

    #[test]
    fn diff_targets_end_of_chapter_ref() {
        let runner = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        runner.push_ok("");
        runner.push_ok("0123abcd\n");
        runner.push_ok("");
        let mut sandbox = GitSandbox::new(&runner, &fs, settings());
        sandbox.start_with_checkout(11).expect("started");

        runner.push_ok("99887766\n");
        runner.push_ok("");
        runner.push_ok("");
        sandbox
            .diff(&[DiffIgnore::Moves, DiffIgnore::Whitespace])
            .expect("diff");
        let spawned = runner.spawned();
        assert_eq!(spawned[3].args.last().map(String::as_str), Some("chapter_11^{commit}"));
        assert_eq!(
            spawned[5].args,
            vec!["diff", "--no-color", "--ignore-all-space", "99887766"]
        );
    }
}
