//! Workload lifecycle state machine.
//!
//! `AppState` is the single source of truth for which commands are legal
//! for a data app. The wire names (`REGISTERED`, `COMPILING`, ...) are what
//! gets persisted to the state file and returned by `/status`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a data app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppState {
    /// No record exists for the queried UUID.
    #[serde(rename = "UNKNOWN_DATA_APP")]
    UnknownDataApp,
    #[serde(rename = "REGISTERED")]
    Registered,
    #[serde(rename = "UPDATED")]
    Updated,
    #[serde(rename = "COMPILING")]
    Compiling,
    #[serde(rename = "COMPILED")]
    Compiled,
    #[serde(rename = "COMPILATION_ERROR")]
    CompilationError,
    #[serde(rename = "DEPLOYING")]
    Deploying,
    #[serde(rename = "DEPLOYED")]
    Deployed,
    #[serde(rename = "DEPLOYMENT_ERROR")]
    DeploymentError,
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "TERMINATING")]
    Terminating,
    #[serde(rename = "TERMINATED")]
    Terminated,
    #[serde(rename = "DELETED")]
    Deleted,
    /// Tracked on disk but missing from the state map, e.g. recovered
    /// after a crash.
    #[serde(rename = "UNKNOWN_STATE")]
    UnknownState,
}

impl AppState {
    /// The persisted/wire spelling of this state.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AppState::UnknownDataApp => "UNKNOWN_DATA_APP",
            AppState::Registered => "REGISTERED",
            AppState::Updated => "UPDATED",
            AppState::Compiling => "COMPILING",
            AppState::Compiled => "COMPILED",
            AppState::CompilationError => "COMPILATION_ERROR",
            AppState::Deploying => "DEPLOYING",
            AppState::Deployed => "DEPLOYED",
            AppState::DeploymentError => "DEPLOYMENT_ERROR",
            AppState::Starting => "STARTING",
            AppState::Running => "RUNNING",
            AppState::Terminating => "TERMINATING",
            AppState::Terminated => "TERMINATED",
            AppState::Deleted => "DELETED",
            AppState::UnknownState => "UNKNOWN_STATE",
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A control-plane command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    Update,
    Status,
    Delete,
    Compile,
    Deploy,
    Start,
    Dispatch,
    Stop,
}

/// States from which a data app may be updated or deleted: anything that
/// is not mid-transition, running, or already gone.
const SETTLED: &[AppState] = &[
    AppState::Registered,
    AppState::Updated,
    AppState::Compiled,
    AppState::CompilationError,
    AppState::Deployed,
    AppState::DeploymentError,
    AppState::Terminated,
    AppState::UnknownState,
];

impl Command {
    /// Whether this command is legal while the workload is in `state`.
    ///
    /// `register` and `status` are always allowed; `status` never mutates
    /// and `register` creates a fresh record.
    pub fn allows(self, state: AppState) -> bool {
        match self {
            Command::Register | Command::Status => true,
            Command::Update | Command::Delete => SETTLED.contains(&state),
            Command::Compile => {
                state != AppState::UnknownState && SETTLED.contains(&state)
            }
            Command::Deploy => {
                matches!(state, AppState::Compiled | AppState::Terminated)
            }
            Command::Start => {
                matches!(state, AppState::Deployed | AppState::Terminated)
            }
            Command::Dispatch | Command::Stop => state == AppState::Running,
        }
    }
}
