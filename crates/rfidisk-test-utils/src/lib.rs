//! Shared test utilities for rfidisk integration tests.
//!
//! In-memory stand-ins for the pieces of the daemon that touch the outside
//! world: the process supervisor, the notification sink, the link handle and
//! the device connector.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use rfidisk_core::link::{Connector, DeviceIo, LinkError};
use rfidisk_core::supervisor::{LaunchError, ProcessHandle, Supervisor, TerminateError};
use rfidisk_core::{LinkHandle, LinkState, Notifier, TagRegistry};

// ===========================================================================
// Supervisor
// ===========================================================================

/// One call made to a [`FakeSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Launch { command: String },
    Terminate { pid: u32, terminate_command: String },
}

#[derive(Debug)]
struct FakeState {
    calls: Vec<SupervisorCall>,
    next_pid: u32,
    alive: HashSet<u32>,
    fail_launches: bool,
    terminate_delay: Option<Duration>,
}

/// Supervisor that records calls instead of running anything.
///
/// Launched "processes" stay alive until terminated or [`Self::exit`]ed.
#[derive(Debug)]
pub struct FakeSupervisor {
    state: Mutex<FakeState>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                next_pid: 1000,
                alive: HashSet::new(),
                fail_launches: false,
                terminate_delay: None,
            }),
        }
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Commands passed to `launch`, in order.
    pub fn launches(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SupervisorCall::Launch { command } => Some(command),
                SupervisorCall::Terminate { .. } => None,
            })
            .collect()
    }

    /// `(pid, terminate_command)` of every `terminate` call, in order.
    pub fn terminations(&self) -> Vec<(u32, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SupervisorCall::Terminate {
                    pid,
                    terminate_command,
                } => Some((pid, terminate_command)),
                SupervisorCall::Launch { .. } => None,
            })
            .collect()
    }

    /// Make subsequent launches fail.
    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().unwrap().fail_launches = fail;
    }

    /// Make `terminate` take this long before returning.
    pub fn set_terminate_delay(&self, delay: Duration) {
        self.state.lock().unwrap().terminate_delay = Some(delay);
    }

    /// Simulate the application exiting on its own.
    pub fn exit(&self, pid: u32) {
        self.state.lock().unwrap().alive.remove(&pid);
    }
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn launch(&self, command: &str) -> Result<ProcessHandle, LaunchError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SupervisorCall::Launch {
            command: command.to_string(),
        });
        if command.trim().is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        if state.fail_launches {
            let program = command.split_whitespace().next().unwrap_or_default();
            return Err(LaunchError::NotFound(program.to_string()));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        state.alive.insert(pid);
        Ok(ProcessHandle {
            root_pid: pid,
            start_time: Some(u64::from(pid)),
            command: command.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn terminate(&self, handle: &ProcessHandle, terminate_command: &str) -> Result<(), TerminateError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(SupervisorCall::Terminate {
                pid: handle.root_pid,
                terminate_command: terminate_command.to_string(),
            });
            state.terminate_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().alive.remove(&handle.root_pid);
        Ok(())
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.state.lock().unwrap().alive.contains(&handle.root_pid)
    }
}

// ===========================================================================
// Notifier
// ===========================================================================

/// Notifier that remembers every `(title, body)` it was given.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.notifications().into_iter().map(|(title, _)| title).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

// ===========================================================================
// Link handle
// ===========================================================================

/// A [`LinkHandle`] with no link task behind it. Lines the controller sends
/// are collected in `outbound`.
#[derive(Debug)]
pub struct FakeLink {
    pub handle: LinkHandle,
    pub outbound: mpsc::Receiver<String>,
    pub state: watch::Sender<LinkState>,
}

impl FakeLink {
    /// A link that reports itself connected under epoch 1.
    pub fn connected() -> Self {
        let (tx, outbound) = mpsc::channel(64);
        let (state, state_rx) = watch::channel(LinkState {
            connected: true,
            epoch: 1,
            last_seen: None,
        });
        Self {
            handle: LinkHandle::new(tx, state_rx),
            outbound,
            state,
        }
    }

    /// Drain and return everything sent so far.
    pub fn sent(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.outbound.try_recv() {
            lines.push(line);
        }
        lines
    }

    pub fn set_connected(&self, connected: bool, epoch: u64) {
        self.state.send_modify(|state| {
            state.connected = connected;
            state.epoch = epoch;
        });
    }
}

// ===========================================================================
// Device connector
// ===========================================================================

/// Feeds lines into one scripted connection. Dropping it (or calling
/// [`Self::close`]) ends the connection with EOF.
#[derive(Debug, Clone)]
pub struct DeviceFeed {
    tx: mpsc::UnboundedSender<String>,
}

impl DeviceFeed {
    pub fn send_line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    pub fn close(self) {}
}

struct ScriptedDevice {
    rx: mpsc::UnboundedReceiver<String>,
    written: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DeviceIo for ScriptedDevice {
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.written.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Connector that hands out pre-arranged connections and failures in
/// order. Once the script runs out every attempt fails.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Option<ScriptedDevice>>>,
    attempts: AtomicUsize,
    written: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connection and return its feed.
    pub fn push_device(&self) -> DeviceFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Some(ScriptedDevice {
            rx,
            written: Arc::clone(&self.written),
        }));
        DeviceFeed { tx }
    }

    /// Queue a failed connection attempt.
    pub fn push_failure(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every line written to any connection, in order.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceIo>, LinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Some(device)) => Ok(Box::new(device)),
            _ => Err(LinkError::DeviceMissing(PathBuf::from("/dev/scripted"))),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

// ===========================================================================
// Registry
// ===========================================================================

/// A registry backed by a file in a fresh temp dir. Keep the dir alive for
/// as long as the registry is used.
pub fn temp_registry() -> (tempfile::TempDir, Arc<TagRegistry>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let registry = TagRegistry::open(dir.path().join("tags.json")).expect("failed to open registry");
    (dir, Arc::new(registry))
}
