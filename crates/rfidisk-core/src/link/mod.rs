//! One logical connection to the reader across physical reconnects.
//!
//! The link runs as its own task. It owns the device, reconnects with
//! exponential backoff when the device goes away, and reports everything it
//! sees as [`LinkEvent`]s tagged with the connection epoch. The epoch is
//! incremented each time a connection completes, so consumers can tell a
//! fresh connection from the one they were talking to before.

mod backoff;
mod device;

pub use backoff::Backoff;
pub use device::{Connector, DeviceIo, LinkError, SerialConnector};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, DeviceEvent};

/// Outbound lines buffered while the link task is busy.
const OUTBOUND_BUFFER: usize = 16;

/// Settings for [`SerialLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub device_path: PathBuf,
    pub baud_rate: u32,
    /// Wait after opening the port before reading (the board resets on open).
    pub settle: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Declare the link dead after this long without any line. `None`
    /// disables the check.
    pub liveness_timeout: Option<Duration>,
    /// `OK` lines within this long after a connect are boot banners.
    pub banner_window: Duration,
    /// How often to check that the device node still exists.
    pub presence_poll: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/rfidisk"),
            baud_rate: 9600,
            settle: Duration::from_secs(2),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            liveness_timeout: None,
            banner_window: Duration::from_secs(3),
            presence_poll: Duration::from_secs(1),
        }
    }
}

/// Published connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub connected: bool,
    /// Epoch of the current (or most recent) connection. Zero before the
    /// first connection.
    pub epoch: u64,
    /// When the device last sent a line.
    pub last_seen: Option<Instant>,
}

/// What the link observed, tagged with the epoch it was observed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { epoch: u64 },
    Disconnected { epoch: u64 },
    Device { epoch: u64, event: DeviceEvent },
}

impl LinkEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Connected { epoch } | Self::Disconnected { epoch } | Self::Device { epoch, .. } => {
                *epoch
            }
        }
    }
}

/// Stream of link events. Ends only when the link task stops.
///
/// Unbounded: the link keeps reading, writing and polling while the
/// consumer is busy with a termination.
pub type LinkEvents = UnboundedReceiverStream<LinkEvent>;

/// Cheap, cloneable sending side of a running link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn new(outbound: mpsc::Sender<String>, state: watch::Receiver<LinkState>) -> Self {
        Self { outbound, state }
    }

    /// Best-effort write. Returns `false` when the line was dropped because
    /// the device is disconnected or the outbound queue is full.
    pub fn send(&self, line: impl Into<String>) -> bool {
        if !self.state.borrow().connected {
            trace!("link disconnected, dropping outbound line");
            return false;
        }
        match self.outbound.try_send(line.into()) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping outbound line");
                false
            }
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }
}

/// A running link: the handle for writes, the event stream and the task.
pub struct RunningLink {
    pub handle: LinkHandle,
    pub events: LinkEvents,
    pub task: JoinHandle<()>,
}

/// The serial link to the reader.
pub struct SerialLink {
    connector: Arc<dyn Connector>,
    config: LinkConfig,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("device", &self.connector.describe())
            .field("config", &self.config)
            .finish()
    }
}

impl SerialLink {
    /// Link to the serial device named in `config`.
    pub fn new(config: LinkConfig) -> Self {
        let connector = SerialConnector::new(config.device_path.clone(), config.baud_rate, config.settle);
        Self::with_connector(Arc::new(connector), config)
    }

    /// Link over a custom connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// First connection attempt, reported to the caller instead of retried.
    pub async fn open(&self) -> Result<Box<dyn DeviceIo>, LinkError> {
        self.connector.connect().await
    }

    /// Spawn the link task and start reading events.
    ///
    /// `initial` is a connection obtained from [`Self::open`]; without one
    /// the task starts by connecting (with backoff). The task runs until
    /// `cancel` fires or the event stream is dropped.
    pub fn start(self, initial: Option<Box<dyn DeviceIo>>, cancel: CancellationToken) -> RunningLink {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (state_tx, state_rx) = watch::channel(LinkState::default());

        let backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let worker = LinkWorker {
            connector: self.connector,
            config: self.config,
            events: events_tx,
            outbound: outbound_rx,
            state: state_tx,
            epoch: 0,
            backoff,
        };
        let task = tokio::spawn(worker.run(initial, cancel));

        RunningLink {
            handle: LinkHandle::new(outbound_tx, state_rx),
            events: UnboundedReceiverStream::new(events_rx),
            task,
        }
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Why a connection stopped pumping.
enum Stop {
    Cancelled,
    Lost(String),
}

struct LinkWorker {
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    outbound: mpsc::Receiver<String>,
    state: watch::Sender<LinkState>,
    epoch: u64,
    backoff: Backoff,
}

impl LinkWorker {
    async fn run(mut self, mut initial: Option<Box<dyn DeviceIo>>, cancel: CancellationToken) {
        loop {
            let device = match initial.take() {
                Some(device) => device,
                None => match self.connect(&cancel).await {
                    Some(device) => device,
                    None => break,
                },
            };

            self.backoff.reset();
            self.epoch += 1;
            let epoch = self.epoch;

            // Display updates queued for the previous connection are stale.
            while self.outbound.try_recv().is_ok() {}

            self.state.send_replace(LinkState {
                connected: true,
                epoch,
                last_seen: None,
            });
            info!(epoch, device = %self.connector.describe(), "device connected");
            if !self.emit(LinkEvent::Connected { epoch }) {
                break;
            }

            let stop = self.pump(device, epoch, &cancel).await;
            self.state.send_modify(|state| state.connected = false);

            match stop {
                Stop::Cancelled => break,
                Stop::Lost(reason) => {
                    warn!(epoch, reason = %reason, "device disconnected");
                    if !self.emit(LinkEvent::Disconnected { epoch }) {
                        break;
                    }
                }
            }
        }
        debug!("link task stopped");
    }

    /// Connect, retrying with backoff. `None` when cancelled.
    async fn connect(&mut self, cancel: &CancellationToken) -> Option<Box<dyn DeviceIo>> {
        let mut failures: u32 = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = self.connector.connect() => result,
            };

            let error = match result {
                Ok(device) => {
                    if failures > 0 {
                        info!(attempts = failures + 1, "device reconnected");
                    }
                    return Some(device);
                }
                Err(e) => e,
            };

            failures += 1;
            let delay = self.backoff.next_delay();
            if failures == 1 {
                warn!(error = %error, retry_in_ms = delay.as_millis() as u64, "cannot reach device, retrying");
            } else {
                debug!(error = %error, failures, retry_in_ms = delay.as_millis() as u64, "device still unreachable");
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Move lines both ways until the connection fails or the task is
    /// cancelled.
    async fn pump(&mut self, mut device: Box<dyn DeviceIo>, epoch: u64, cancel: &CancellationToken) -> Stop {
        let connected_at = Instant::now();
        let mut last_seen = connected_at;

        let mut presence = tokio::time::interval(self.config.presence_poll);
        presence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let silence_deadline = self.config.liveness_timeout.map(|timeout| last_seen + timeout);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Stop::Cancelled,
                read = device.read_line() => match read {
                    Ok(Some(line)) => {
                        last_seen = Instant::now();
                        self.state.send_modify(|state| state.last_seen = Some(last_seen));

                        let Some(event) = codec::decode(&line) else {
                            continue;
                        };
                        if event == DeviceEvent::Ready
                            && last_seen.duration_since(connected_at) < self.config.banner_window
                        {
                            debug!(epoch, "discarding boot banner");
                            continue;
                        }
                        trace!(epoch, event = %event, "device event");
                        if !self.emit(LinkEvent::Device { epoch, event }) {
                            return Stop::Cancelled;
                        }
                    }
                    Ok(None) => return Stop::Lost("end of stream".to_string()),
                    Err(e) => return Stop::Lost(format!("read failed: {e}")),
                },
                Some(line) = self.outbound.recv() => {
                    if let Err(e) = device.write_line(&line).await {
                        return Stop::Lost(format!("write failed: {e}"));
                    }
                    trace!(epoch, line = %line, "sent to device");
                }
                _ = presence.tick() => {
                    if !device.is_present() {
                        return Stop::Lost("device node disappeared".to_string());
                    }
                }
                _ = sleep_until_opt(silence_deadline), if silence_deadline.is_some() => {
                    return Stop::Lost("no data within liveness timeout".to_string());
                }
            }
        }
    }

    /// Deliver an event. `false` when the consumer is gone.
    fn emit(&self, event: LinkEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
