//! Channel and client registries (spec.md 3, 4.3)

use indexmap::IndexSet;
use std::time::Instant;

use crate::protocol::ClientId;

/// Server-wide mode, broadcast to clients as `STA` (REDESIGN FLAG (a): canonicalized, no "stoped" typo)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Started,
    Focused,
}

impl ServerStatus {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Started => "started",
            ServerStatus::Focused => "focused",
        }
    }
}

/// One logical laser bound to a fiber switch position and DAC output (spec.md 3)
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub fiber_switch: u8,
    pub dac_channel: u32,

    // Structural fields: mutated only by the Controller task
    pub target_frequency: f64,
    pub pp: f64,
    pub ii: f64,
    pub dd: f64,
    pub gain: f64,
    pub auto_exposure_on: bool,
    pub pid_on: bool,
    pub monitor_list: IndexSet<String>,

    // Measurement fields: mutated only by the PID worker
    pub current_frequency: f64,
    pub weighted_frequency: f64,
    pub exposure_time: u32,
    pub accumulator: f64,
    pub proportional: f64,
    pub differentiator: f64,
    pub recent_output_voltage: f64,
    pub current_time: Instant,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        fiber_switch: u8,
        dac_channel: u32,
        target_frequency: f64,
        exposure_time: u32,
        pp: f64,
        ii: f64,
        dd: f64,
        gain: f64,
    ) -> Self {
        Self {
            name: name.into(),
            fiber_switch,
            dac_channel,
            target_frequency,
            pp,
            ii,
            dd,
            gain,
            auto_exposure_on: false,
            pid_on: false,
            monitor_list: IndexSet::new(),
            current_frequency: 0.0,
            weighted_frequency: 0.0,
            exposure_time,
            accumulator: 0.0,
            proportional: 0.0,
            differentiator: 0.0,
            recent_output_voltage: 0.0,
            current_time: Instant::now(),
        }
    }

    /// Invariant: an empty monitor list forces auto-exposure and PID off (spec.md 3, P3)
    pub fn unsubscribe(&mut self, client_name: &str) {
        self.monitor_list.shift_remove(client_name);
        if self.monitor_list.is_empty() {
            self.auto_exposure_on = false;
            self.pid_on = false;
        }
    }
}

/// A connected client and its subscriptions (spec.md 3)
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub handle: tokio::sync::mpsc::UnboundedSender<crate::protocol::Frame>,
    pub channel_list: IndexSet<String>,
    /// Duplicate-name suffix index assigned at `CON` time (0 = no clash), kept for `DCN` consistency
    pub duplicate_index: u32,
    /// Consecutive failed sends on `handle`; reaching 10 drops the client as in `DCN` (spec.md 7, `SendError`)
    pub consecutive_send_failures: u32,
}
