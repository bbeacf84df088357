use std::{fmt, path::PathBuf};
use thiserror::Error;

/// Outcome of an engine operation, reported to callers and queue handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpResult {
    Ok,
    Error,
    Abort,
}

impl OpResult {
    pub fn is_ok(self) -> bool {
        matches!(self, OpResult::Ok)
    }

    pub fn label(self) -> &'static str {
        match self {
            OpResult::Ok => "ok",
            OpResult::Error => "error",
            OpResult::Abort => "abort",
        }
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ModError {
    #[error("malformed definition: {0}")]
    Definition(String),

    #[error("definition is missing mandatory <{0}>")]
    MissingField(&'static str),

    #[error("unknown architecture: no entry under '{prefix}' in {path:?}")]
    UnknownArchitecture { path: PathBuf, prefix: String },

    #[error("identity mismatch between source '{source_ident}' and backup '{backup_ident}'")]
    IdentityMismatch {
        source_ident: String,
        backup_ident: String,
    },

    #[error("mod has no source")]
    NoSource,

    #[error("mod has no backup")]
    NoBackup,

    #[error("mod already has a backup")]
    AlreadyBackedUp,

    #[error("library is locked by a running operation")]
    Locked,

    #[error("mod not found: {0}")]
    NotFound(String),

    #[error("operation aborted")]
    Aborted,
}

/// Maps an error chain to a result code. Aborts and precondition
/// violations are caller-contract issues and report as `Abort`.
pub fn result_for(err: &anyhow::Error) -> OpResult {
    match err.downcast_ref::<ModError>() {
        Some(
            ModError::Aborted
            | ModError::NoSource
            | ModError::NoBackup
            | ModError::AlreadyBackedUp
            | ModError::Locked,
        ) => OpResult::Abort,
        _ => OpResult::Error,
    }
}

/// Flattens an error chain into the one-line message stored as `last_error`.
pub fn summarize(err: &anyhow::Error) -> String {
    let mut out = err.to_string();
    for cause in err.chain().skip(1) {
        out.push_str(": ");
        out.push_str(&cause.to_string());
    }
    out
}
