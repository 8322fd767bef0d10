//! Desktop notifications.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Fire-and-forget notification sink. Failures are logged, never returned.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Sends notifications through `notify-send`.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    program: PathBuf,
    icon: Option<PathBuf>,
    timeout: Duration,
}

impl DesktopNotifier {
    pub fn new(icon: Option<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("notify-send"),
            icon,
            timeout: Duration::from_millis(3000),
        }
    }

    fn command(&self, title: &str, body: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(icon) = &self.icon {
            cmd.arg("-i").arg(icon);
        }
        cmd.arg(title)
            .arg(body)
            .arg("-t")
            .arg(self.timeout.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str) {
        // Requires a runtime; outside one there is nobody to reap the child.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(title, "no async runtime, dropping notification");
            return;
        };

        let mut cmd = self.command(title, body);
        let title = title.to_string();
        runtime.spawn(async move {
            match cmd.output().await {
                Ok(output) if output.status.success() => {
                    debug!(title = %title, "notification sent");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(title = %title, status = %output.status, stderr = %stderr.trim(), "notify-send failed");
                }
                Err(e) => {
                    warn!(title = %title, error = %e, "could not run notify-send");
                }
            }
        });
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, title: &str, _body: &str) {
        debug!(title, "notifications disabled");
    }
}
