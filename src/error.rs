//! Error types for the configuration, store and supervisor seams

use std::path::PathBuf;
use thiserror::Error;

use crate::core::TaskId;

/// Configuration problems. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no config file found (looked in ./taskherd.yml and the user config directory)")]
    NotFound,

    #[error("no modules configured; define at least one entry under `modules`")]
    NoModules,

    #[error("module command for task type {0} is empty")]
    EmptyModule(u32),

    #[error("command template must contain the {{module}} placeholder")]
    MissingModulePlaceholder,

    #[error("unknown placeholder {{{0}}} in command template")]
    UnknownPlaceholder(String),

    #[error("command template is not valid shell syntax: {0}")]
    TemplateSyntax(#[source] shell_words::ParseError),

    #[error("module command for task type {task_type} is not valid shell syntax: {source}")]
    ModuleSyntax {
        task_type: u32,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("no launch command configured for task type {0}")]
    UnknownTaskType(u32),
}

/// Failures while starting a supervised process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("empty launch command")]
    EmptyCommand,

    #[error("cannot parse launch command `{command}`: {source}")]
    Syntax {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("cannot open process log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task {0} has no launch command bound")]
    NotBound(TaskId),
}

impl SupervisorError {
    /// Whether this failure means the configured command itself is unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyCommand | Self::Syntax { .. } | Self::Spawn { .. }
        )
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
