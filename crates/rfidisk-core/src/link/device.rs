//! Physical device access behind the [`Connector`] / [`DeviceIo`] seam.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// How long a blocking read waits before checking whether the link still
/// wants data.
const READ_POLL: Duration = Duration::from_millis(200);

/// Lines buffered between the reader thread and the link task.
const LINE_BUFFER: usize = 64;

/// Errors from opening or talking to the device.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("device {} is not present", .0.display())]
    DeviceMissing(PathBuf),

    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: serialport::Error,
    },

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens connections to the device.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one physical connection.
    async fn connect(&self) -> Result<Box<dyn DeviceIo>, LinkError>;

    /// Human-readable name of the device, for logs.
    fn describe(&self) -> String;
}

/// One open connection to the device.
#[async_trait]
pub trait DeviceIo: Send {
    /// Next line from the device without its terminator. `Ok(None)` means the
    /// connection reached end of stream. Must be cancel-safe.
    async fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Write one line; the terminator is appended.
    async fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Whether the underlying device node still exists.
    fn is_present(&self) -> bool {
        true
    }
}

// Compile-time check: both traits must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Connector, _: &dyn DeviceIo) {}
};

// ---------------------------------------------------------------------------
// Serial port implementation
// ---------------------------------------------------------------------------

/// Connects to a USB serial device (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: PathBuf,
    baud_rate: u32,
    settle: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32, settle: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            settle,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceIo>, LinkError> {
        if !self.path.exists() {
            return Err(LinkError::DeviceMissing(self.path.clone()));
        }

        let open_err = |source: serialport::Error| LinkError::Open {
            path: self.path.clone(),
            source,
        };

        let name = self.path.to_string_lossy().into_owned();
        let baud_rate = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_POLL)
                .open()
        })
        .await
        .map_err(io::Error::other)?
        .map_err(open_err)?;

        // Opening the port resets the microcontroller; let it boot, then drop
        // whatever it printed meanwhile.
        tokio::time::sleep(self.settle).await;
        port.clear(ClearBuffer::Input).map_err(open_err)?;

        let reader = port.try_clone().map_err(open_err)?;
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        std::thread::Builder::new()
            .name("rfidisk-serial-reader".to_string())
            .spawn(move || read_lines(reader, tx))?;

        debug!(device = %self.path.display(), baud_rate, "serial port open");

        Ok(Box::new(SerialDevice {
            path: self.path.clone(),
            lines: rx,
            port: Arc::new(Mutex::new(port)),
        }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Blocking reader loop. Runs on its own thread until the port fails or the
/// receiving side is dropped.
fn read_lines(port: Box<dyn SerialPort>, tx: mpsc::Sender<io::Result<String>>) {
    let mut reader = BufReader::new(port);
    let mut buf = Vec::new();

    loop {
        if tx.is_closed() {
            break;
        }
        match reader.read_until(b'\n', &mut buf) {
            // End of stream; dropping `tx` reports it.
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                buf.clear();
                if tx.blocking_send(Ok(line)).is_err() || !complete {
                    break;
                }
            }
            // A timeout keeps any partial line in `buf` for the next round.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    trace!("serial reader thread exiting");
}

/// An open serial connection.
struct SerialDevice {
    path: PathBuf,
    lines: mpsc::Receiver<io::Result<String>>,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[async_trait]
impl DeviceIo for SerialDevice {
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.lines.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = Arc::clone(&self.port);
        let mut data = line.to_owned();
        data.push('\n');
        tokio::task::spawn_blocking(move || {
            let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
            port.write_all(data.as_bytes())?;
            port.flush()
        })
        .await
        .map_err(io::Error::other)?
    }

    fn is_present(&self) -> bool {
        self.path.exists()
    }
}
