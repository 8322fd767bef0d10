//! Core of the rfidisk daemon: turns tag insert/remove events from a serial
//! RFID reader into application launches and terminations.
//!
//! ```text
//! SerialLink --LinkEvent--> LifecycleController --lookup--> TagRegistry
//!     ^                          |        |
//!     |  D|..|..|..|..|n         |        +--launch/terminate--> Supervisor
//!     +------- Display <---------+
//!                                +--notify--> Notifier
//! ```

pub mod codec;
pub mod controller;
pub mod display;
pub mod link;
pub mod notify;
pub mod registry;
pub mod supervisor;
pub mod tag;

pub use codec::{DeviceEvent, DisplayFrame, IconType};
pub use controller::{ControllerConfig, LifecycleController, Phase};
pub use display::Display;
pub use link::{LinkConfig, LinkEvent, LinkEvents, LinkHandle, LinkState, RunningLink, SerialLink};
pub use notify::{DesktopNotifier, Notifier, NullNotifier};
pub use registry::{Lookup, TagEntry, TagRegistry};
pub use supervisor::{LaunchError, ProcessHandle, ProcessSupervisor, Supervisor, SupervisorConfig, TerminateError};
pub use tag::TagId;

/// Text shown on the last display line while no tag is inserted.
pub const IDLE_VERSION_LINE: &str = concat!("RFIDisk v", env!("CARGO_PKG_VERSION"));
