//! Lifecycle controller: the state machine that turns link events into
//! launches, terminations and display updates.
//!
//! ```text
//!            TagOn(A)                 TagOff(A)
//!   Idle -------------> Active(A) ---------------> PendingRemoval(A)
//!    ^                   ^   |                         |      |
//!    |                   |   | TagOn(B): terminate A,  |      |
//!    |                   |   | then activate B         |      |
//!    |                   +---|------- TagOn(A) --------+      |
//!    |                       |                                |
//!    +-- app exited ---------+------ deadline: terminate -----+
//! ```
//!
//! The controller is the single owner of the session. It runs as one
//! sequential loop over link events, the removal deadline, a liveness tick
//! and late termination outcomes.

mod session;

pub use session::{ControllerState, Phase, Session};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::DeviceEvent;
use crate::display::Display;
use crate::link::LinkEvent;
use crate::notify::Notifier;
use crate::registry::{TagEntry, TagRegistry};
use crate::supervisor::{LaunchError, ProcessHandle, Supervisor, TerminateError};
use crate::tag::TagId;

/// Notification titles.
const TITLE_INSERTED: &str = "RFIDisk Inserted";
const TITLE_NEW_TAG: &str = "New Tag";
const TITLE_ERROR: &str = "Error";

/// Settings for [`LifecycleController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Debounce between `TagOff` and termination. Zero terminates at once.
    pub removal_delay: Duration,
    /// How often to check whether the launched application is still running.
    pub liveness_interval: Duration,
    /// Upper bound on a launch.
    pub launch_timeout: Duration,
    /// How long the loop waits for a termination before force-clearing the
    /// session.
    pub terminate_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            removal_delay: Duration::ZERO,
            liveness_interval: Duration::from_secs(2),
            launch_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a termination that finished after the controller stopped
/// waiting for it.
#[derive(Debug)]
struct LateOutcome {
    tag: TagId,
    pid: u32,
    result: Result<(), TerminateError>,
}

/// The tag lifecycle state machine.
pub struct LifecycleController {
    config: ControllerConfig,
    registry: Arc<TagRegistry>,
    supervisor: Arc<dyn Supervisor>,
    notifier: Arc<dyn Notifier>,
    display: Display,
    state: ControllerState,
    /// Latest connected epoch. Device events from older epochs are stale.
    epoch: u64,
    late_tx: mpsc::UnboundedSender<LateOutcome>,
    late_rx: mpsc::UnboundedReceiver<LateOutcome>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl LifecycleController {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<TagRegistry>,
        supervisor: Arc<dyn Supervisor>,
        notifier: Arc<dyn Notifier>,
        display: Display,
    ) -> Self {
        let (late_tx, late_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            supervisor,
            notifier,
            display,
            state: ControllerState::Idle,
            epoch: 0,
            late_tx,
            late_rx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.state.session()
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    /// Latest connected epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drive the controller until `cancel` fires or the event stream ends.
    ///
    /// The launched application, if any, is left running on return.
    pub async fn run<S>(mut self, mut events: S, cancel: CancellationToken) -> anyhow::Result<()>
    where
        S: Stream<Item = LinkEvent> + Unpin,
    {
        self.display.show_idle();

        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ended = loop {
            let deadline = self.state.deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break false,
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break true,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.on_removal_deadline().await;
                }
                Some(outcome) = self.late_rx.recv() => self.on_late_outcome(outcome),
                _ = liveness.tick() => self.check_liveness().await,
            }
        };

        if let Some(session) = self.state.session() {
            info!(
                tag = %session.tag,
                pid = session.process.as_ref().map(|p| p.root_pid),
                "controller stopping, leaving application running"
            );
        }
        if ended {
            anyhow::bail!("link event stream ended unexpectedly");
        }
        Ok(())
    }

    /// Apply one link event.
    pub async fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { epoch } => self.on_connected(epoch),
            LinkEvent::Disconnected { epoch } => {
                info!(epoch, phase = %self.phase(), "device disconnected, keeping session");
            }
            LinkEvent::Device { epoch, event } => {
                if epoch < self.epoch {
                    debug!(epoch, current = self.epoch, event = %event, "dropping event from superseded connection");
                    return;
                }
                self.epoch = epoch;
                match event {
                    DeviceEvent::TagOn(tag) => self.on_tag_on(tag, epoch).await,
                    DeviceEvent::TagOff(tag) => self.on_tag_off(tag).await,
                    DeviceEvent::Ready => {
                        info!(epoch, "device reset, restoring display");
                        self.display.resync();
                    }
                }
            }
        }
    }

    /// Terminate the session if its removal deadline has passed.
    pub async fn on_removal_deadline(&mut self) {
        let expired = matches!(
            self.state,
            ControllerState::PendingRemoval { deadline, .. } if Instant::now() >= deadline
        );
        if !expired {
            return;
        }
        if let ControllerState::PendingRemoval { session, .. } = std::mem::take(&mut self.state) {
            info!(tag = %session.tag, "removal confirmed");
            self.end_session(session, true).await;
        }
    }

    /// Return to idle if the launched application exited on its own.
    pub async fn check_liveness(&mut self) {
        let Some(session) = self.state.session() else {
            return;
        };
        let Some(process) = &session.process else {
            return;
        };
        // The real workload of these entries is not the process we launched.
        if session.entry.has_terminate_command() {
            return;
        }
        if self.supervisor.is_alive(process).await {
            return;
        }

        info!(tag = %session.tag, pid = process.root_pid, "application exited, returning to idle");
        self.state = ControllerState::Idle;
        self.display.show_idle();
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn on_connected(&mut self, epoch: u64) {
        let previous = self.epoch;
        self.epoch = self.epoch.max(epoch);

        // A pending removal keeps its deadline across reconnects.
        if previous == 0 {
            info!(epoch, "device connected");
        } else {
            info!(epoch, previous, phase = %self.phase(), "device reconnected, keeping session");
        }
        self.display.resync();
    }

    async fn on_tag_on(&mut self, tag: TagId, epoch: u64) {
        // An expired removal is processed before the new event.
        self.on_removal_deadline().await;

        match std::mem::take(&mut self.state) {
            ControllerState::Idle => self.activate(tag, epoch).await,
            ControllerState::Active(mut session) if session.tag == tag => {
                debug!(tag = %tag, epoch, "tag still inserted, ignoring repeat announcement");
                session.epoch = epoch;
                self.state = ControllerState::Active(session);
            }
            ControllerState::PendingRemoval { mut session, .. } if session.tag == tag => {
                info!(tag = %tag, "tag reinserted, cancelling removal");
                session.epoch = epoch;
                self.state = ControllerState::Active(session);
            }
            ControllerState::Active(session) | ControllerState::PendingRemoval { session, .. } => {
                info!(old = %session.tag, new = %tag, "different tag inserted, replacing session");
                self.end_session(session, false).await;
                self.activate(tag, epoch).await;
            }
        }
    }

    async fn on_tag_off(&mut self, tag: TagId) {
        match std::mem::take(&mut self.state) {
            ControllerState::Active(session) if session.tag == tag => {
                if self.config.removal_delay.is_zero() {
                    info!(tag = %tag, "tag removed");
                    self.end_session(session, true).await;
                } else {
                    let deadline = Instant::now() + self.config.removal_delay;
                    info!(tag = %tag, delay_ms = self.config.removal_delay.as_millis() as u64, "tag removed, waiting before terminating");
                    self.state = ControllerState::PendingRemoval { session, deadline };
                }
            }
            other => {
                debug!(tag = %tag, phase = %other.phase(), "ignoring removal of a tag that is not active");
                self.state = other;
            }
        }
    }

    /// Start a session for a newly inserted tag. Expects the state to be
    /// idle.
    async fn activate(&mut self, tag: TagId, epoch: u64) {
        // Creates and persists a stub before anything is shown for it.
        let registry = Arc::clone(&self.registry);
        let id = tag.clone();
        let lookup = match tokio::task::spawn_blocking(move || registry.lookup(&id)).await {
            Ok(lookup) => lookup,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!(tag = %tag, error = %e, "tag lookup did not complete");
                return;
            }
        };
        let is_new = lookup.is_new();
        let entry = lookup.into_entry();

        self.display.show(entry.display_frame());
        if is_new {
            self.notifier.notify(TITLE_NEW_TAG, &format!("Tag {tag} added"));
        } else {
            self.notifier
                .notify(TITLE_INSERTED, &format!("{}\n{}", entry.line1, entry.line2));
        }

        let process = if entry.has_command() {
            self.launch(&entry).await
        } else {
            debug!(tag = %tag, "entry has no command, display only");
            None
        };

        info!(tag = %tag, epoch, pid = process.as_ref().map(|p| p.root_pid), "session started");
        self.state = ControllerState::Active(Session {
            tag,
            entry,
            process,
            started_at: Utc::now(),
            epoch,
        });
    }

    async fn launch(&self, entry: &TagEntry) -> Option<ProcessHandle> {
        let result = match tokio::time::timeout(self.config.launch_timeout, self.supervisor.launch(&entry.command)).await {
            Ok(result) => result,
            Err(_) => Err(LaunchError::TimedOut(self.config.launch_timeout)),
        };
        match result {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(tag = %entry.id, command = %entry.command, error = %e, "launch failed");
                self.notifier
                    .notify(TITLE_ERROR, &format!("Failed: {}", entry.line1));
                None
            }
        }
    }

    /// Terminate the session's process (if any) and return to idle.
    ///
    /// The termination itself runs in its own task and always runs to
    /// completion; the controller waits for it only up to the terminate
    /// timeout.
    async fn end_session(&mut self, session: Session, show_idle: bool) {
        self.state = ControllerState::Idle;

        if let Some(process) = session.process {
            let supervisor = Arc::clone(&self.supervisor);
            let terminate = session.entry.terminate.clone();
            let late_tx = self.late_tx.clone();
            let tag = session.tag.clone();
            let pid = process.root_pid;
            let (done_tx, done_rx) = oneshot::channel();

            tokio::spawn(async move {
                let result = supervisor.terminate(&process, &terminate).await;
                if let Err(result) = done_tx.send(result) {
                    let _ = late_tx.send(LateOutcome { tag, pid, result });
                }
            });

            match tokio::time::timeout(self.config.terminate_timeout, done_rx).await {
                Ok(Ok(Ok(()))) => info!(tag = %session.tag, pid, "application terminated"),
                Ok(Ok(Err(e))) => {
                    warn!(tag = %session.tag, pid, error = %e, "termination incomplete, clearing session anyway");
                }
                Ok(Err(_)) => {
                    error!(tag = %session.tag, pid, "termination task died, clearing session");
                }
                Err(_) => {
                    let e = TerminateError::TimedOut(self.config.terminate_timeout);
                    warn!(tag = %session.tag, pid, error = %e, "clearing session, termination continues in background");
                }
            }
        } else {
            debug!(tag = %session.tag, "no process to terminate");
        }

        if show_idle {
            self.display.show_idle();
        }
    }

    fn on_late_outcome(&self, outcome: LateOutcome) {
        match outcome.result {
            Ok(()) => info!(tag = %outcome.tag, pid = outcome.pid, "background termination finished"),
            Err(e) => warn!(tag = %outcome.tag, pid = outcome.pid, error = %e, "background termination failed"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
