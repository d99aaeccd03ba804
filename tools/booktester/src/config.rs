use crate::directives::{FastForward, SkipDirectives, SkipEntry, SkipTarget};
use crate::driver::ReplayOptions;
use crate::errors::BookTesterError;
use crate::logging::DEFAULT_DISK_BUDGET_BYTES;
use crate::oracle::{DiffIgnore, Oracle};
use crate::runtime::FileSystem;
use crate::sandbox::git::{render_ref, GitSandboxSettings};
use crate::types::RuntimeScope;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub chapter: u32,
    pub chapter_file: Option<PathBuf>,
    pub skips: Vec<SkipEntry>,
    pub fast_forward: Option<FastForward>,
    pub trust_fast_forward: bool,
    pub prep_database: bool,
    pub keep_sandbox: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub book: BookConfig,
    pub sandbox: SandboxConfig,
    pub oracle: OracleConfig,
    pub verification: VerificationConfig,
    pub logging: LoggingConfig,
    /// Commit label -> revision; labels missing here are searched for in history.
    pub commits: BTreeMap<String, String>,
    /// Keyed by chapter number.
    pub chapters: BTreeMap<String, ChapterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookConfig {
    /// Chapter document path template (`{chapter}` / `{chapter:02}`).
    pub chapter_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxConfig {
    pub source_repo: Option<PathBuf>,
    pub workdir_root: Option<PathBuf>,
    pub start_ref: String,
    pub end_ref: String,
    pub database_command: Option<String>,
    pub keep: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OracleConfig {
    pub volatile_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationConfig {
    pub check_commits: bool,
    pub final_diff_ignore: Vec<DiffIgnore>,
    pub expected_final_diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: String,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChapterConfig {
    #[serde(default)]
    pub skip: Vec<SkipConfig>,
    pub fast_forward: Option<FastForwardConfig>,
    #[serde(default)]
    pub trust_fast_forward: bool,
    #[serde(default)]
    pub prep_database: bool,
    pub final_diff_ignore: Option<Vec<DiffIgnore>>,
    pub expected_final_diff: Option<String>,
}

/// Exactly one of `index` or `line` identifies the listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkipConfig {
    pub index: Option<usize>,
    pub line: Option<usize>,
    pub reason: String,
    pub expect_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FastForwardConfig {
    pub index: usize,
    pub label: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            book: BookConfig {
                chapter_path: "chapter_{chapter:02}.asciidoc".to_string(),
            },
            sandbox: SandboxConfig {
                source_repo: None,
                workdir_root: None,
                start_ref: "chapter_{prev:02}".to_string(),
                end_ref: "chapter_{chapter:02}".to_string(),
                database_command: None,
                keep: false,
            },
            oracle: OracleConfig {
                volatile_patterns: vec![
                    r"in \d+\.\d+s".to_string(),
                    r"0x[0-9a-fA-F]+".to_string(),
                ],
            },
            verification: VerificationConfig {
                check_commits: false,
                final_diff_ignore: Vec::new(),
                expected_final_diff: String::new(),
            },
            logging: LoggingConfig {
                path: ".booktester/logs/run.jsonl".to_string(),
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            commits: BTreeMap::new(),
            chapters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    book: Option<PartialBookConfig>,
    sandbox: Option<PartialSandboxConfig>,
    oracle: Option<PartialOracleConfig>,
    verification: Option<PartialVerificationConfig>,
    logging: Option<PartialLoggingConfig>,
    commits: Option<BTreeMap<String, String>>,
    chapters: Option<BTreeMap<String, ChapterConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBookConfig {
    chapter_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSandboxConfig {
    source_repo: Option<PathBuf>,
    workdir_root: Option<PathBuf>,
    start_ref: Option<String>,
    end_ref: Option<String>,
    database_command: Option<String>,
    keep: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialOracleConfig {
    volatile_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialVerificationConfig {
    check_commits: Option<bool>,
    final_diff_ignore: Option<Vec<DiffIgnore>>,
    expected_final_diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<String>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, RuntimeScope), BookTesterError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| BookTesterError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    let scope = resolve_scope(process_cwd, overrides);
    validate_config(&cfg)?;
    Ok((cfg, scope))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(book) = partial.book {
        if let Some(chapter_path) = book.chapter_path {
            cfg.book.chapter_path = chapter_path;
        }
    }

    if let Some(sandbox) = partial.sandbox {
        if let Some(value) = sandbox.source_repo {
            cfg.sandbox.source_repo = Some(value);
        }
        if let Some(value) = sandbox.workdir_root {
            cfg.sandbox.workdir_root = Some(value);
        }
        if let Some(value) = sandbox.start_ref {
            cfg.sandbox.start_ref = value;
        }
        if let Some(value) = sandbox.end_ref {
            cfg.sandbox.end_ref = value;
        }
        if let Some(value) = sandbox.database_command {
            cfg.sandbox.database_command = Some(value);
        }
        if let Some(value) = sandbox.keep {
            cfg.sandbox.keep = value;
        }
    }

    if let Some(oracle) = partial.oracle {
        if let Some(patterns) = oracle.volatile_patterns {
            cfg.oracle.volatile_patterns = patterns;
        }
    }

    if let Some(verification) = partial.verification {
        if let Some(value) = verification.check_commits {
            cfg.verification.check_commits = value;
        }
        if let Some(value) = verification.final_diff_ignore {
            cfg.verification.final_diff_ignore = value;
        }
        if let Some(value) = verification.expected_final_diff {
            cfg.verification.expected_final_diff = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(commits) = partial.commits {
        cfg.commits.extend(commits);
    }

    if let Some(chapters) = partial.chapters {
        cfg.chapters = chapters;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if overrides.keep_sandbox {
        cfg.sandbox.keep = true;
    }
}

/// Relative paths in the config file are anchored at the file's directory.
pub fn resolve_scope(process_cwd: &Path, overrides: &CliOverrides) -> RuntimeScope {
    let process_cwd = process_cwd.to_path_buf();
    let config_dir = overrides
        .config_path
        .as_ref()
        .map(|path| absolutize_path(&process_cwd, path))
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| process_cwd.clone());

    RuntimeScope {
        process_cwd,
        config_dir,
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), BookTesterError> {
    if cfg.book.chapter_path.trim().is_empty() {
        return Err(BookTesterError::InvalidConfig(
            "book.chapter_path must not be empty".to_string(),
        ));
    }

    if cfg.sandbox.start_ref.trim().is_empty() || cfg.sandbox.end_ref.trim().is_empty() {
        return Err(BookTesterError::InvalidConfig(
            "sandbox.start_ref and sandbox.end_ref must not be empty".to_string(),
        ));
    }

    if !cfg.logging.path.ends_with(".jsonl") {
        return Err(BookTesterError::InvalidConfig(
            "logging.path must name a .jsonl file".to_string(),
        ));
    }

    if cfg.logging.budget_bytes == 0 {
        return Err(BookTesterError::InvalidConfig(
            "logging.budget_bytes must be greater than zero".to_string(),
        ));
    }

    Oracle::new(&cfg.oracle.volatile_patterns)?;
    validate_diff_ignore("verification.final_diff_ignore", &cfg.verification.final_diff_ignore)?;

    for (key, chapter) in &cfg.chapters {
        if key.parse::<u32>().is_err() {
            return Err(BookTesterError::InvalidConfig(format!(
                "chapters.\"{key}\" must be keyed by chapter number"
            )));
        }
        for skip in &chapter.skip {
            if skip.index.is_some() == skip.line.is_some() {
                return Err(BookTesterError::InvalidConfig(format!(
                    "chapters.\"{key}\".skip entries need exactly one of `index` or `line`"
                )));
            }
            if skip.reason.trim().is_empty() {
                return Err(BookTesterError::InvalidConfig(format!(
                    "chapters.\"{key}\".skip entries need a reason"
                )));
            }
        }
        if let Some(ff) = &chapter.fast_forward {
            if ff.label.trim().is_empty() {
                return Err(BookTesterError::InvalidConfig(format!(
                    "chapters.\"{key}\".fast_forward.label must not be empty"
                )));
            }
        }
        if let Some(ignore) = &chapter.final_diff_ignore {
            validate_diff_ignore(&format!("chapters.\"{key}\".final_diff_ignore"), ignore)?;
        }
    }

    Ok(())
}

fn validate_diff_ignore(field: &str, ignore: &[DiffIgnore]) -> Result<(), BookTesterError> {
    for category in ignore {
        if let DiffIgnore::Matching(pattern) = category {
            Regex::new(pattern)
                .map_err(|e| BookTesterError::InvalidConfig(format!("{field} `{pattern}`: {e}")))?;
        }
    }
    Ok(())
}

pub fn chapter_config(cfg: &AppConfig, chapter: u32) -> ChapterConfig {
    cfg.chapters
        .iter()
        .find(|(key, _)| key.parse::<u32>().ok() == Some(chapter))
        .map(|(_, chapter)| chapter.clone())
        .unwrap_or_default()
}

/// `--chapter-file` wins over the `book.chapter_path` template.
pub fn resolve_chapter_path(
    cfg: &AppConfig,
    scope: &RuntimeScope,
    overrides: &CliOverrides,
) -> PathBuf {
    match &overrides.chapter_file {
        Some(path) => absolutize_path(&scope.process_cwd, path),
        None => absolutize_path(
            &scope.config_dir,
            Path::new(&render_ref(&cfg.book.chapter_path, overrides.chapter)),
        ),
    }
}

pub fn resolve_log_path(cfg: &AppConfig, scope: &RuntimeScope) -> PathBuf {
    absolutize_path(&scope.config_dir, Path::new(&cfg.logging.path))
}

pub fn sandbox_settings(
    cfg: &AppConfig,
    scope: &RuntimeScope,
) -> Result<GitSandboxSettings, BookTesterError> {
    let source_repo = cfg.sandbox.source_repo.as_ref().ok_or_else(|| {
        BookTesterError::InvalidConfig(
            "sandbox.source_repo is required to replay a chapter".to_string(),
        )
    })?;
    Ok(GitSandboxSettings {
        source_repo: absolutize_path(&scope.config_dir, source_repo),
        workdir_root: cfg
            .sandbox
            .workdir_root
            .as_ref()
            .map(|path| absolutize_path(&scope.config_dir, path)),
        start_ref: cfg.sandbox.start_ref.clone(),
        end_ref: cfg.sandbox.end_ref.clone(),
        database_command: cfg.sandbox.database_command.clone(),
        commits: cfg.commits.clone(),
        keep: cfg.sandbox.keep,
    })
}

/// Per-chapter directives from the config file merged with the command line.
/// Command-line skips are added to the configured ones; a command-line
/// fast-forward replaces the configured one.
pub fn replay_options(cfg: &AppConfig, overrides: &CliOverrides) -> ReplayOptions {
    let chapter = chapter_config(cfg, overrides.chapter);
    let mut skips = SkipDirectives::default();
    for skip in &chapter.skip {
        let target = match (skip.index, skip.line) {
            (Some(index), _) => SkipTarget::Index(index),
            (None, Some(line)) => SkipTarget::Line(line),
            (None, None) => continue,
        };
        skips.push(SkipEntry {
            target,
            reason: skip.reason.clone(),
            expect_contains: skip.expect_contains.clone(),
        });
    }
    for entry in &overrides.skips {
        skips.push(entry.clone());
    }

    let fast_forward = overrides.fast_forward.clone().or_else(|| {
        chapter.fast_forward.as_ref().map(|ff| FastForward {
            index: ff.index,
            label: ff.label.clone(),
        })
    });

    ReplayOptions {
        chapter_no: overrides.chapter,
        skips,
        fast_forward,
        trust_fast_forward: overrides.trust_fast_forward || chapter.trust_fast_forward,
        prep_database: overrides.prep_database || chapter.prep_database,
        check_commits: cfg.verification.check_commits,
        final_diff_ignore: chapter
            .final_diff_ignore
            .unwrap_or_else(|| cfg.verification.final_diff_ignore.clone()),
        expected_final_diff: chapter
            .expected_final_diff
            .unwrap_or_else(|| cfg.verification.expected_final_diff.clone()),
    }
}
