//! [`Supervisor`] backed by real processes.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::proc_tree::{self, ProcSnapshot};
use super::{LaunchError, ProcessHandle, Supervisor, SupervisorConfig, TerminateError};

/// How long to wait for processes to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Leading words that are shell syntax or builtins rather than programs.
const SHELL_WORDS: &[&str] = &[
    "!", ".", "alias", "builtin", "case", "cd", "command", "eval", "exec", "export", "for", "if",
    "set", "source", "time", "trap", "ulimit", "umask", "unset", "until", "wait", "while",
];

/// Characters that make the first word something other than a plain
/// program name or path.
const SHELL_META: &[char] = &[
    '$', '`', '(', ')', '{', '}', ';', '&', '|', '<', '>', '*', '?', '[', ']', '~', '\'', '"', '\\',
];

/// Per-launch bookkeeping.
struct Tracked {
    child: Child,
    /// Descendants seen by liveness checks, pid -> start time. Survives the
    /// descendants being reparented away from the root.
    descendants: HashMap<u32, u64>,
}

/// Runs commands through `/bin/sh -c`, each in its own process group.
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    shell: PathBuf,
    processes: Arc<Mutex<HashMap<u32, Tracked>>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("shell", &self.shell)
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            shell: PathBuf::from("/bin/sh"),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn shell_command(&self, command_line: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command_line).stdin(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Run a custom terminate command and wait a bounded time for it.
    /// Returns an error only when it could not be started.
    async fn run_terminate_command(&self, command_line: &str) -> io::Result<()> {
        let mut child = self.shell_command(command_line).spawn()?;
        match tokio::time::timeout(self.config.terminate_command_wait, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(command = command_line, %status, "terminate command finished");
            }
            Ok(Err(e)) => {
                warn!(command = command_line, error = %e, "failed waiting for terminate command");
            }
            Err(_) => {
                debug!(command = command_line, "terminate command still running, not waiting further");
            }
        }
        Ok(())
    }

    /// SIGTERM the whole tree, then SIGKILL whatever outlives the grace
    /// period.
    async fn signal_tree(&self, handle: &ProcessHandle, mut tracked: Option<Tracked>) -> Result<(), TerminateError> {
        let root = handle.root_pid;
        let pgid = root;

        let snapshot = ProcSnapshot::capture();
        let mut targets: HashMap<u32, u64> = HashMap::new();
        if let Some(start) = handle.start_time.filter(|&start| snapshot.is_running(root, start)) {
            targets.insert(root, start);
        }
        let group = snapshot.launched_group(pgid, handle.start_time);
        for stat in snapshot.descendants_of(root).into_iter().chain(group.iter().copied()) {
            if !stat.is_zombie() {
                targets.insert(stat.pid, stat.start_time);
            }
        }
        if let Some(tracked) = &tracked {
            for (&pid, &start) in &tracked.descendants {
                if snapshot.is_running(pid, start) {
                    targets.insert(pid, start);
                }
            }
        }

        let root_running = match tracked.as_mut() {
            Some(tracked) => matches!(tracked.child.try_wait(), Ok(None)),
            None => targets.contains_key(&root),
        };
        if !root_running && targets.is_empty() {
            debug!(pid = root, "nothing left to terminate");
            return Ok(());
        }

        info!(pid = root, processes = targets.len(), "sending SIGTERM to process tree");
        let mut first_error = None;
        if group.iter().any(|s| !s.is_zombie()) {
            if let Err(source) = signal_group(pgid, Signal::Term) {
                first_error.get_or_insert(TerminateError::Signal { pid: pgid, source });
            }
        }
        for &pid in targets.keys() {
            if let Err(source) = signal_pid(pid, Signal::Term) {
                first_error.get_or_insert(TerminateError::Signal { pid, source });
            }
        }
        if root_running && !targets.contains_key(&root) {
            if let Err(source) = signal_pid(root, Signal::Term) {
                first_error.get_or_insert(TerminateError::Signal { pid: root, source });
            }
        }

        let survivors = self
            .wait_for_exit(&mut tracked, &targets, self.config.grace_period)
            .await;
        if survivors.is_empty() {
            debug!(pid = root, "process tree exited after SIGTERM");
            return Ok(());
        }

        warn!(pid = root, survivors = ?survivors, "process tree ignored SIGTERM, sending SIGKILL");
        let group_alive = ProcSnapshot::capture()
            .launched_group(pgid, handle.start_time)
            .iter()
            .any(|s| !s.is_zombie());
        if group_alive {
            if let Err(source) = signal_group(pgid, Signal::Kill) {
                first_error.get_or_insert(TerminateError::Signal { pid: pgid, source });
            }
        }
        for &pid in &survivors {
            if let Err(source) = signal_pid(pid, Signal::Kill) {
                first_error.get_or_insert(TerminateError::Signal { pid, source });
            }
        }

        let survivors = self.wait_for_exit(&mut tracked, &targets, KILL_WAIT).await;
        if survivors.is_empty() {
            return Ok(());
        }
        Err(first_error.unwrap_or(TerminateError::Survivors(survivors)))
    }

    /// Poll until every target has exited or `limit` elapses. Returns the
    /// pids still running.
    async fn wait_for_exit(
        &self,
        tracked: &mut Option<Tracked>,
        targets: &HashMap<u32, u64>,
        limit: Duration,
    ) -> Vec<u32> {
        let deadline = Instant::now() + limit;
        loop {
            let mut survivors: HashSet<u32> = HashSet::new();

            // Reap the root first so it does not linger as a zombie.
            if let Some(tracked) = tracked.as_mut() {
                if matches!(tracked.child.try_wait(), Ok(None)) {
                    survivors.insert(tracked.child.id().unwrap_or_default());
                }
            }
            let snapshot = ProcSnapshot::capture();
            survivors.extend(
                targets
                    .iter()
                    .filter(|&(&pid, &start)| snapshot.is_running(pid, start))
                    .map(|(&pid, _)| pid),
            );
            survivors.remove(&0);

            if survivors.is_empty() || Instant::now() >= deadline {
                let mut survivors: Vec<u32> = survivors.into_iter().collect();
                survivors.sort_unstable();
                return survivors;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn launch(&self, command: &str) -> Result<ProcessHandle, LaunchError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        if let Some(program) = leading_program(command) {
            if resolve_program(program).is_none() {
                return Err(LaunchError::NotFound(program.to_string()));
            }
        }

        let spawn_err = |source: io::Error| LaunchError::Spawn {
            command: command.to_string(),
            source,
        };
        let child = self.shell_command(command).spawn().map_err(spawn_err)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(io::Error::other("process exited before its pid was read")))?;
        let start_time = proc_tree::read_stat(pid).map(|stat| stat.start_time);

        self.processes.lock().await.insert(
            pid,
            Tracked {
                child,
                descendants: HashMap::new(),
            },
        );
        info!(pid, command, "launched");

        Ok(ProcessHandle {
            root_pid: pid,
            start_time,
            command: command.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn terminate(&self, handle: &ProcessHandle, terminate_command: &str) -> Result<(), TerminateError> {
        let tracked = self.processes.lock().await.remove(&handle.root_pid);

        let custom = terminate_command.trim();
        if !custom.is_empty() {
            match self.run_terminate_command(custom).await {
                Ok(()) => {
                    info!(pid = handle.root_pid, command = custom, "ran terminate command");
                    return Ok(());
                }
                Err(e) => {
                    warn!(command = custom, error = %e, "terminate command failed to start, signalling instead");
                }
            }
        }

        self.signal_tree(handle, tracked).await
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let root = handle.root_pid;
        let mut processes = self.processes.lock().await;

        let Some(tracked) = processes.get_mut(&root) else {
            return handle
                .start_time
                .is_some_and(|start| ProcSnapshot::capture().is_running(root, start));
        };

        let root_alive = match tracked.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = root, %status, "launched shell exited");
                false
            }
            Err(e) => {
                warn!(pid = root, error = %e, "error checking process status");
                false
            }
        };

        let snapshot = ProcSnapshot::capture();
        for stat in snapshot.descendants_of(root) {
            if !stat.is_zombie() {
                tracked.descendants.insert(stat.pid, stat.start_time);
            }
        }
        tracked
            .descendants
            .retain(|&pid, &mut start| snapshot.is_running(pid, start));
        let group_alive = snapshot
            .launched_group(root, handle.start_time)
            .iter()
            .any(|stat| !stat.is_zombie() && (root_alive || stat.pid != root));

        let alive = root_alive || !tracked.descendants.is_empty() || group_alive;
        if !alive {
            debug!(pid = root, "launched application has exited");
            processes.remove(&root);
        }
        alive
    }
}

// ---------------------------------------------------------------------------
// Command line inspection
// ---------------------------------------------------------------------------

/// The program a command line starts with, when it is a plain name or path.
/// `None` when the line starts with shell syntax that cannot be checked
/// without running it.
pub(crate) fn leading_program(command: &str) -> Option<&str> {
    let first = command
        .split_whitespace()
        .find(|word| !is_env_assignment(word))?;
    if first.contains(SHELL_META) || SHELL_WORDS.contains(&first) {
        return None;
    }
    Some(first)
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Resolve a program the way the shell would: paths as given, bare names
/// through `PATH`.
pub(crate) fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return is_executable(path).then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Signal one process. A process that is already gone is not an error.
#[cfg(unix)]
fn signal_pid(pid: u32, signal: Signal) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal.raw()) };
    check_signal_result(ret)
}

/// Signal every member of a process group.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    // SAFETY: killpg(3) has no memory-safety preconditions.
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, signal.raw()) };
    check_signal_result(ret)
}

#[cfg(unix)]
fn check_signal_result(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "signals are not supported on this platform"))
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "signals are not supported on this platform"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_program_skips_env_assignments() {
        assert_eq!(leading_program("SDL_VIDEODRIVER=x11 gzdoom -iwad DOOM.WAD"), Some("gzdoom"));
        assert_eq!(leading_program("/usr/bin/gzdoom"), Some("/usr/bin/gzdoom"));
    }

    #[test]
    fn leading_program_gives_up_on_shell_syntax() {
        assert_eq!(leading_program("cd /opt/game && ./run.sh"), None);
        assert_eq!(leading_program("$HOME/bin/game"), None);
        assert_eq!(leading_program("(sleep 1)"), None);
        assert_eq!(leading_program("exec gzdoom"), None);
    }

    #[test]
    fn env_assignment_detection() {
        assert!(is_env_assignment("FOO=bar"));
        assert!(is_env_assignment("WINEPREFIX="));
        assert!(!is_env_assignment("=bar"));
        assert!(!is_env_assignment("1X=bar"));
        assert!(!is_env_assignment("--opt=value"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_finds_sh() {
        assert!(resolve_program("sh").is_some());
        assert_eq!(resolve_program("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert!(resolve_program("rfidisk-no-such-program-xyz").is_none());
        assert!(resolve_program("/nonexistent/program").is_none());
    }
}
