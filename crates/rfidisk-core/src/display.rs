//! Keeps the device display in sync with the session.

use tracing::{debug, trace};

use crate::IDLE_VERSION_LINE;
use crate::codec::{self, DisplayFrame, IconType};
use crate::link::LinkHandle;
use crate::registry::fit_display_lines;

/// The frame shown while no tag is inserted.
pub fn idle_frame() -> DisplayFrame {
    DisplayFrame::new(
        fit_display_lines(["Ready", "Insert Disk", "", IDLE_VERSION_LINE]),
        IconType::None,
    )
}

/// Display adapter over the link.
///
/// Remembers the frame that should be on screen so it can be re-sent after a
/// reconnect or firmware reset, and skips sending a frame identical to the
/// last one delivered.
#[derive(Debug)]
pub struct Display {
    link: LinkHandle,
    current: DisplayFrame,
    last_sent: Option<DisplayFrame>,
}

impl Display {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            link,
            current: idle_frame(),
            last_sent: None,
        }
    }

    /// Make `frame` the current frame and send it unless it is already on
    /// screen.
    pub fn show(&mut self, frame: DisplayFrame) {
        self.current = frame;
        if self.last_sent.as_ref() == Some(&self.current) {
            trace!("display unchanged, not resending");
            return;
        }
        self.transmit();
    }

    pub fn show_idle(&mut self) {
        self.show(idle_frame());
    }

    /// Send the current frame again, e.g. after the device reset and lost
    /// its screen contents.
    pub fn resync(&mut self) {
        debug!("resynchronising display");
        self.last_sent = None;
        self.transmit();
    }

    pub fn current(&self) -> &DisplayFrame {
        &self.current
    }

    fn transmit(&mut self) {
        if self.link.send(codec::encode(&self.current)) {
            self.last_sent = Some(self.current.clone());
        } else {
            // Not delivered; the next show or resync must send it.
            self.last_sent = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use tokio::sync::{mpsc, watch};

    fn connected_link() -> (LinkHandle, mpsc::Receiver<String>, watch::Sender<LinkState>) {
        let (tx, rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(LinkState {
            connected: true,
            epoch: 1,
            last_seen: None,
        });
        (LinkHandle::new(tx, state_rx), rx, state_tx)
    }

    #[test]
    fn idle_frame_text() {
        let frame = idle_frame();
        assert_eq!(frame.lines[0], "Ready");
        assert_eq!(frame.lines[1], "Insert Disk");
        assert_eq!(frame.lines[2], "");
        assert!(frame.lines[3].starts_with("RFIDisk v"));
        assert_eq!(frame.icon, IconType::None);
    }

    #[test]
    fn identical_frames_are_sent_once() {
        let (link, mut rx, _state) = connected_link();
        let mut display = Display::new(link);
        display.show_idle();
        display.show_idle();
        assert!(rx.try_recv().unwrap().starts_with("D|Ready|Insert Disk||RFIDisk v"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resync_resends_current_frame() {
        let (link, mut rx, _state) = connected_link();
        let mut display = Display::new(link);
        display.show_idle();
        display.resync();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn undelivered_frame_is_sent_after_reconnect() {
        let (link, mut rx, state) = connected_link();
        let mut display = Display::new(link);
        state.send_modify(|s| s.connected = false);
        display.show_idle();
        assert!(rx.try_recv().is_err());

        state.send_modify(|s| s.connected = true);
        display.show_idle();
        assert!(rx.try_recv().is_ok());
    }
}
