//! Launching and stopping the application bound to a tag.
//!
//! The [`Supervisor`] trait is the seam between the lifecycle controller and
//! the operating system; [`ProcessSupervisor`] is the real implementation.

mod process;
pub mod proc_tree;

pub use process::ProcessSupervisor;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A launched application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Pid of the shell running the command line. It leads its own process
    /// group, so this is also the group id.
    pub root_pid: u32,
    /// Start time of the root in clock ticks since boot, when known.
    pub start_time: Option<u64>,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// Why a command could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("executable {0:?} not found")]
    NotFound(String),

    #[error("failed to start {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("launch did not complete within {0:?}")]
    TimedOut(Duration),
}

/// Why a termination did not complete cleanly.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("processes still running after SIGKILL: {0:?}")]
    Survivors(Vec<u32>),

    #[error("termination did not complete within {0:?}")]
    TimedOut(Duration),
}

/// Settings for [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// How long to wait for a custom terminate command to finish.
    pub terminate_command_wait: Duration,
    /// Poll interval while waiting for processes to exit.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            terminate_command_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Launches, stops and watches applications.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Run `command` through the shell in a new process group.
    async fn launch(&self, command: &str) -> Result<ProcessHandle, LaunchError>;

    /// Stop a launched application. A non-empty `terminate_command` is run
    /// instead of signalling the process tree.
    async fn terminate(&self, handle: &ProcessHandle, terminate_command: &str) -> Result<(), TerminateError>;

    /// Whether anything started by the launch is still running.
    async fn is_alive(&self, handle: &ProcessHandle) -> bool;
}

// Compile-time assertion: Supervisor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Supervisor) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSupervisor;

    #[async_trait]
    impl Supervisor for NoopSupervisor {
        async fn launch(&self, command: &str) -> Result<ProcessHandle, LaunchError> {
            Ok(ProcessHandle {
                root_pid: 1,
                start_time: None,
                command: command.to_string(),
                started_at: Utc::now(),
            })
        }

        async fn terminate(&self, _handle: &ProcessHandle, _terminate_command: &str) -> Result<(), TerminateError> {
            Ok(())
        }

        async fn is_alive(&self, _handle: &ProcessHandle) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn noop_supervisor_as_trait_object() {
        let supervisor: Box<dyn Supervisor> = Box::new(NoopSupervisor);
        let handle = supervisor.launch("true").await.unwrap();
        assert_eq!(handle.command, "true");
        assert!(!supervisor.is_alive(&handle).await);
        supervisor.terminate(&handle, "").await.unwrap();
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.terminate_command_wait, Duration::from_secs(2));
    }
}
