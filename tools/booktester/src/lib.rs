pub mod apply;
pub mod config;
pub mod directives;
pub mod driver;
pub mod errors;
pub mod ledger;
pub mod log_retention;
pub mod logging;
pub mod oracle;
pub mod parser;
pub mod report;
pub mod runtime;
pub mod sandbox;
pub mod types;

use clap::{error::ErrorKind, Parser};
use config::{
    load_config, replay_options, resolve_chapter_path, resolve_log_path, sandbox_settings,
    CliOverrides,
};
use directives::{parse_fast_forward_arg, parse_skip_arg};
use driver::replay_chapter;
use errors::BookTesterError;
use logging::{append_run_log, init_run_log, structured_fallback_line, JsonlLogger};
use oracle::Oracle;
use parser::parse_listings;
use report::{render_listing_table, render_outcome};
use runtime::ProductionRuntime;
use sandbox::git::GitSandbox;
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Parser)]
#[command(name = "booktester")]
#[command(version)]
#[command(about = "Replays a book chapter's listings against its example project")]
pub struct Cli {
    #[arg(long)]
    pub chapter: u32,
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// Chapter document to read instead of the configured path template.
    #[arg(long)]
    pub chapter_file: Option<std::path::PathBuf>,
    /// Skip the listing at a zero-based index.
    #[arg(long = "skip", value_name = "IDX:REASON")]
    pub skip: Vec<String>,
    /// Skip the listing that contains a source line.
    #[arg(long = "skip-line", value_name = "LINE:REASON")]
    pub skip_line: Vec<String>,
    #[arg(long, value_name = "IDX:LABEL")]
    pub fast_forward: Option<String>,
    #[arg(long, default_value_t = false)]
    pub trust_fast_forward: bool,
    #[arg(long, default_value_t = false)]
    pub prep_database: bool,
    #[arg(long, default_value_t = false)]
    pub keep_sandbox: bool,
    /// Print the parsed listings and exit without replaying.
    #[arg(long, default_value_t = false)]
    pub list: bool,
}

impl Cli {
    fn overrides(&self) -> Result<CliOverrides, BookTesterError> {
        let mut skips = Vec::new();
        for raw in &self.skip {
            skips.push(parse_skip_arg(raw, false)?);
        }
        for raw in &self.skip_line {
            skips.push(parse_skip_arg(raw, true)?);
        }
        Ok(CliOverrides {
            config_path: self.config.clone(),
            chapter: self.chapter,
            chapter_file: self.chapter_file.clone(),
            skips,
            fast_forward: self
                .fast_forward
                .as_deref()
                .map(parse_fast_forward_arg)
                .transpose()?,
            trust_fast_forward: self.trust_fast_forward,
            prep_database: self.prep_database,
            keep_sandbox: self.keep_sandbox,
        })
    }
}

pub fn run() -> Result<i32, BookTesterError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| BookTesterError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, BookTesterError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(BookTesterError::Cli(error.to_string())),
        },
    };

    let overrides = cli.overrides()?;
    let (cfg, scope) = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    let chapter_path = resolve_chapter_path(&cfg, &scope, &overrides);
    let text = runtime.file_system.read_to_string(&chapter_path)?;

    if cli.list {
        let listings = parse_listings(&text)?;
        for row in render_listing_table(&listings) {
            runtime.terminal.write_line(&row)?;
        }
        return Ok(0);
    }

    let mut logger = JsonlLogger::new(resolve_log_path(&cfg, &scope));
    logger.budget_bytes = cfg.logging.budget_bytes;
    init_run_log(logger)?;
    append_run_log(
        "info",
        "chapter.loaded",
        json!({
            "chapter": cli.chapter,
            "path": chapter_path.display().to_string(),
            "bytes": text.len(),
            "sha256": format!("{:x}", Sha256::digest(text.as_bytes()))
        }),
    );

    let oracle = Oracle::new(&cfg.oracle.volatile_patterns)?;
    let mut sandbox = GitSandbox::new(
        runtime.process_runner.as_ref(),
        runtime.file_system.as_ref(),
        sandbox_settings(&cfg, &scope)?,
    );
    let outcome = replay_chapter(&text, &mut sandbox, &oracle, replay_options(&cfg, &overrides));
    for line in render_outcome(&outcome) {
        runtime.terminal.write_line(&line)?;
    }
    if cfg.sandbox.keep {
        if let Some(workdir) = sandbox.workdir() {
            runtime.terminal.write_line(&structured_fallback_line(
                cli.chapter,
                outcome.context.state.as_str(),
                &format!("sandbox kept at {}", workdir.display()),
            ))?;
        }
    }

    Ok(if outcome.passed() { 0 } else { 1 })
}
