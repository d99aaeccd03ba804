use crate::oracle::Mismatch;
use crate::types::LineRange;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookTesterError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("sandbox init failed for chapter {chapter}: {message}")]
    SandboxInit { chapter: u32, message: String },
    #[error("unknown commit label: {0}")]
    UnknownCommitLabel(String),
    #[error("{0}")]
    VerificationMismatch(Box<Mismatch>),
    #[error("incomplete coverage: listings {missing:?} were never checked")]
    IncompleteCoverage { missing: Vec<usize> },
    #[error("command failed at lines {address}: `{command}` exited with {exit_code}")]
    CommandFailed {
        address: LineRange,
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("{kind} at lines {address} has no file to apply to")]
    NoTargetFile {
        address: LineRange,
        kind: &'static str,
    },
    #[error("invalid directive: {0}")]
    InvalidDirective(String),
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
}

impl BookTesterError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Source lines of the passage a failure points at, when it has one.
    pub fn address(&self) -> Option<LineRange> {
        match self {
            Self::Parse { line, .. } => Some(LineRange::new(*line, *line)),
            Self::VerificationMismatch(mismatch) => Some(mismatch.address),
            Self::CommandFailed { address, .. } | Self::NoTargetFile { address, .. } => {
                Some(*address)
            }
            _ => None,
        }
    }
}
