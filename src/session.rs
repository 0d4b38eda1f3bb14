//! Device session state and outbound message emission.
//!
//! One `Session` lives for the whole agent process. It owns the device
//! status, the wrapping message counter, the one-time hello, the inbound
//! dedup window, and the flush bookkeeping for the display and monitor
//! streams. Emission helpers return encoded messages; the reactor performs
//! the actual publish, so only messages that really go out consume a
//! counter id.
//!
//! Every transition and every no-op command path re-emits the current
//! status: the link is lossy and a subscriber must never be left with a
//! stale view.

use tracing::debug;

use crate::dedup::DedupWindow;
use crate::display::FlushTracker;
use crate::transport::protocol::{
    encode_display, encode_flush, encode_hello, encode_monitor_line, encode_status,
    DeviceStatus, IpcMessage, OutTopic, Outbound,
};

/// Monitor lines per flush record.
const MONITOR_FLUSH_EVERY: u32 = 4;

/// Process-wide session state, owned by the reactor.
pub struct Session {
    status: DeviceStatus,
    counter: u32,
    hello_sent: bool,
    nonce: u32,

    dedup: DedupWindow,
    display: FlushTracker,
    monitor: FlushTracker,
    monitor_lines: u32,
}

impl Session {
    pub fn new() -> Self {
        Self {
            status: DeviceStatus::Idle,
            counter: 0,
            hello_sent: false,
            nonce: rand::random(),
            dedup: DedupWindow::new(),
            display: FlushTracker::new(),
            monitor: FlushTracker::new(),
            monitor_lines: 0,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn is_idle(&self) -> bool {
        self.status == DeviceStatus::Idle
    }

    /// Dedup an inbound command id. `false` means drop the message.
    pub fn accept_inbound(&mut self, id: u32) -> bool {
        let fresh = self.dedup.accept(id);
        if !fresh {
            debug!(id, "Dropping duplicate inbound message");
        }
        fresh
    }

    fn take_id(&mut self) -> u32 {
        let id = self.counter;
        self.counter = self.counter.wrapping_add(1);
        id
    }

    /// Start an emission batch, prepending the one-time hello if this is the
    /// first message of the process lifetime.
    fn begin_emission(&mut self) -> Vec<Outbound> {
        if self.hello_sent {
            return Vec::new();
        }
        self.hello_sent = true;
        let id = self.take_id();
        vec![Outbound {
            topic: OutTopic::Hello,
            payload: encode_hello(id, self.nonce),
        }]
    }

    /// Re-emit the current status (ping, rejected run, stop no-op, and every
    /// real transition).
    pub fn status_refresh(&mut self) -> Vec<Outbound> {
        let mut out = self.begin_emission();
        let id = self.take_id();
        out.push(Outbound {
            topic: OutTopic::Status,
            payload: encode_status(id, self.status),
        });
        out
    }

    pub fn set_running(&mut self) -> Vec<Outbound> {
        self.status = DeviceStatus::Running;
        self.status_refresh()
    }

    pub fn set_idle(&mut self) -> Vec<Outbound> {
        self.status = DeviceStatus::Idle;
        self.status_refresh()
    }

    /// Relay one decoded IPC message from the VM host.
    ///
    /// Value-bearing messages are stamped and published individually; a
    /// self-flushing one also closes its run. A flush marker closing an
    /// empty run is dropped without consuming an id; otherwise it is
    /// rewritten into a flush record carrying the run's starting id.
    pub fn relay_ipc(&mut self, msg: IpcMessage) -> Vec<Outbound> {
        match msg {
            IpcMessage::FlushMarker => {
                if self.display.run_is_empty() {
                    debug!("Dropping flush marker for empty run");
                    return Vec::new();
                }
                let mut out = self.begin_emission();
                let id = self.take_id();
                let starting = self.display.run_start();
                out.push(Outbound {
                    topic: OutTopic::Display,
                    payload: encode_flush(id, starting, id.wrapping_sub(starting)),
                });
                self.display.note_flush(id);
                out
            }
            IpcMessage::Display(display) => {
                let mut out = self.begin_emission();
                let id = self.take_id();
                self.display.note_value(id, display.self_flushing);
                out.push(Outbound {
                    topic: OutTopic::Display,
                    payload: encode_display(id, &display),
                });
                out
            }
        }
    }

    /// Emit one peripheral telemetry line; every fourth line is followed by
    /// a monitor flush record mirroring the display flush.
    pub fn monitor_line(&mut self, line: &str) -> Vec<Outbound> {
        let mut out = self.begin_emission();
        let id = self.take_id();
        self.monitor.note_value(id, false);
        out.push(Outbound {
            topic: OutTopic::Monitor,
            payload: encode_monitor_line(id, line),
        });

        self.monitor_lines += 1;
        if self.monitor_lines == MONITOR_FLUSH_EVERY {
            self.monitor_lines = 0;
            let flush_id = self.take_id();
            let starting = self.monitor.run_start();
            out.push(Outbound {
                topic: OutTopic::Monitor,
                payload: encode_flush(flush_id, starting, flush_id.wrapping_sub(starting)),
            });
            self.monitor.note_flush(flush_id);
        }
        out
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
