//! The request dispatch state machine (spec.md 4.1)
//!
//! A single task consumes [`WorkItem`]s from a bounded queue fed by the session layer and
//! [`ControllerEvent`]s fed by the PID worker, mutates the channel/client registries, and is the
//! only writer of client-facing frames — this is what makes per-client fan-out ordering (P7)
//! provable: one task, one place where `handle.send()` is called.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::common::wavelength_to_frequency;
use crate::config::{self, PidParams};
use crate::driver::{DacDriver, WavemeterDriver};
use crate::monitoring;
use crate::protocol::{ClientId, Frame, Value};
use crate::registry::{Channel, ClientRecord, ServerStatus};

pub type ClientHandle = mpsc::UnboundedSender<Frame>;
pub type ChannelTable = Arc<IndexMap<String, Arc<Mutex<Channel>>>>;

/// One item pulled off the work queue: the 3-tuple `(control, command, data)` of spec.md 4.1,
/// already validated and typed by the session layer's frame parser, plus the originating client.
#[derive(Debug)]
pub enum WorkItem {
    Con {
        id: ClientId,
        name: String,
        handle: ClientHandle,
    },
    Dcn {
        id: ClientId,
    },
    Srt {
        id: ClientId,
    },
    Stp {
        id: ClientId,
    },
    Kil {
        id: ClientId,
    },
    Uon {
        id: ClientId,
        channel: String,
    },
    Uof {
        id: ClientId,
        channel: String,
    },
    Pon {
        id: ClientId,
        channel: String,
    },
    Pof {
        id: ClientId,
        channel: String,
    },
    Fon {
        id: ClientId,
        channel: String,
    },
    Fof {
        id: ClientId,
        channel: String,
    },
    Aen {
        id: ClientId,
        channel: String,
    },
    Aef {
        id: ClientId,
        channel: String,
    },
    Wms {
        id: ClientId,
    },
    Scf {
        id: ClientId,
        file: String,
    },
    Twl {
        id: ClientId,
        channel: String,
        wavelength: f64,
    },
    Tfr {
        id: ClientId,
        channel: String,
        frequency: f64,
    },
    Exp {
        id: ClientId,
        channel: String,
        exposure: u32,
    },
    Vlt {
        id: ClientId,
        channel: String,
        volts: f64,
    },
    Ppp {
        id: ClientId,
        channel: String,
        value: f64,
    },
    Iii {
        id: ClientId,
        channel: String,
        value: f64,
    },
    Ddd {
        id: ClientId,
        channel: String,
        value: f64,
    },
    Gan {
        id: ClientId,
        channel: String,
        value: f64,
    },
}

/// Reported by the PID worker after a measurement step; the Controller turns these into fan-out
#[derive(Debug)]
pub enum ControllerEvent {
    Measured { channel: String, frequency: f64 },
    ExposureAdjusted { channel: String, exposure_time: u32 },
    OutputCommanded {
        channel: String,
        volts: f64,
        accumulator: f64,
        proportional: f64,
        differentiator: f64,
    },
    FocusedChannelEmpty { channel: String },
    SweepFoundNoSubscribers,
    DriverError { channel: Option<String>, message: String },
}

/// Shared handles the PID worker needs; constructed once alongside the Controller
pub struct PidHandles {
    pub channels: ChannelTable,
    pub status_rx: watch::Receiver<ServerStatus>,
    pub focused_rx: watch::Receiver<Option<String>>,
    pub active: Arc<AtomicBool>,
    pub notify: Arc<Notify>,
    pub events: mpsc::UnboundedSender<ControllerEvent>,
    pub wavemeter: Arc<dyn WavemeterDriver>,
    pub dac: Arc<dyn DacDriver>,
    pub params: Arc<PidParams>,
}

pub struct Controller {
    channels: ChannelTable,
    clients: IndexMap<ClientId, ClientRecord>,
    status: ServerStatus,
    status_tx: watch::Sender<ServerStatus>,
    focused: Option<String>,
    focused_tx: watch::Sender<Option<String>>,
    pid_active: Arc<AtomicBool>,
    pid_notify: Arc<Notify>,
    wavemeter: Arc<dyn WavemeterDriver>,
    dac: Arc<dyn DacDriver>,
    params: Arc<PidParams>,
    config_dir: PathBuf,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: ChannelTable,
        wavemeter: Arc<dyn WavemeterDriver>,
        dac: Arc<dyn DacDriver>,
        params: Arc<PidParams>,
        config_dir: PathBuf,
    ) -> (Self, PidHandles, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (status_tx, status_rx) = watch::channel(ServerStatus::Stopped);
        let (focused_tx, focused_rx) = watch::channel(None);
        let pid_active = Arc::new(AtomicBool::new(false));
        let pid_notify = Arc::new(Notify::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handles = PidHandles {
            channels: channels.clone(),
            status_rx,
            focused_rx,
            active: pid_active.clone(),
            notify: pid_notify.clone(),
            events: event_tx.clone(),
            wavemeter: wavemeter.clone(),
            dac: dac.clone(),
            params: params.clone(),
        };

        let controller = Self {
            channels,
            clients: IndexMap::new(),
            status: ServerStatus::Stopped,
            status_tx,
            focused: None,
            focused_tx,
            pid_active,
            pid_notify,
            wavemeter,
            dac,
            params,
            config_dir,
        };

        (controller, handles, event_rx)
    }

    /// Drives the dispatch loop until shutdown is signalled. `event_rx` is the receiver returned
    /// by [`Controller::new`] for the PID worker's outgoing [`ControllerEvent`] channel.
    pub async fn run(
        mut self,
        mut work_rx: mpsc::Receiver<WorkItem>,
        mut event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Controller dispatch loop starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Controller stopping");
                    break;
                }
                Some(item) = work_rx.recv() => {
                    monitoring::dispatch_queue_depth().set(work_rx.len() as i64);
                    self.dispatch(item);
                }
                Some(event) = event_rx.recv() => {
                    self.handle_event(event);
                }
                else => break,
            }
        }
    }

    fn activate_pid(&self) {
        self.pid_active.store(true, Ordering::SeqCst);
        self.pid_notify.notify_one();
    }

    fn deactivate_pid(&self) {
        self.pid_active.store(false, Ordering::SeqCst);
    }

    fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        let _ = self.status_tx.send(status);
    }

    fn set_focused(&mut self, focused: Option<String>) {
        self.focused = focused.clone();
        let _ = self.focused_tx.send(focused);
    }

    /// `SendError` handling (spec.md 7): a failed send increments the client's consecutive-failure
    /// counter; reaching 10 drops the client exactly as `DCN` would.
    const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 10;

    fn record_send(&mut self, id: ClientId, ok: bool) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        if ok {
            client.consecutive_send_failures = 0;
            false
        } else {
            client.consecutive_send_failures += 1;
            debug!(?id, failures = client.consecutive_send_failures, "client send failed");
            client.consecutive_send_failures >= Self::MAX_CONSECUTIVE_SEND_FAILURES
        }
    }

    fn send_to(&mut self, id: ClientId, frame: Frame) {
        let ok = self.clients.get(&id).is_some_and(|c| c.handle.send(frame).is_ok());
        if self.record_send(id, ok) {
            warn!(?id, "client exceeded consecutive send failures, disconnecting");
            self.on_dcn(id);
        }
    }

    fn fanout(&mut self, monitor_list: &indexmap::IndexSet<String>, frame: Frame) {
        let mut to_drop = Vec::new();
        for name in monitor_list {
            let Some(id) = self.find_client_id_by_name(name) else {
                continue;
            };
            let ok = self.clients.get(&id).is_some_and(|c| c.handle.send(frame.clone()).is_ok());
            if self.record_send(id, ok) {
                to_drop.push(id);
            }
        }
        for id in to_drop {
            warn!(?id, "client exceeded consecutive send failures, disconnecting");
            self.on_dcn(id);
        }
    }

    /// Send `frame` to every connected client, applying the same `SendError` accounting as
    /// [`Controller::fanout`].
    fn broadcast_all(&mut self, frame: Frame) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        let mut to_drop = Vec::new();
        for id in ids {
            let ok = self.clients.get(&id).is_some_and(|c| c.handle.send(frame.clone()).is_ok());
            if self.record_send(id, ok) {
                to_drop.push(id);
            }
        }
        for id in to_drop {
            warn!(?id, "client exceeded consecutive send failures, disconnecting");
            self.on_dcn(id);
        }
    }

    fn find_client_id_by_name(&self, name: &str) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| *id)
    }

    /// `(control, command, data)` dispatch; an exhaustive match plus a terminal NAK for anything
    /// not covered by the protocol layer's own exhaustiveness (spec.md 4.1: "unknown combinations
    /// respond with NAK").
    fn dispatch(&mut self, item: WorkItem) {
        match item {
            WorkItem::Con { id, name, handle } => self.on_con(id, name, handle),
            WorkItem::Dcn { id } => self.on_dcn(id),
            WorkItem::Srt { id } => self.on_srt(id),
            WorkItem::Stp { id } => self.on_stp(id),
            WorkItem::Kil { id } => self.on_kil(id),
            WorkItem::Uon { id, channel } => self.on_uon(id, &channel),
            WorkItem::Uof { id, channel } => self.on_uof(id, &channel),
            WorkItem::Pon { id, channel } => self.on_pid_toggle(id, &channel, true),
            WorkItem::Pof { id, channel } => self.on_pid_toggle(id, &channel, false),
            WorkItem::Fon { id, channel } => self.on_fon(id, &channel),
            WorkItem::Fof { id, channel } => self.on_fof(id, &channel),
            WorkItem::Aen { id, channel } => self.on_auto_exposure_toggle(id, &channel, true),
            WorkItem::Aef { id, channel } => self.on_auto_exposure_toggle(id, &channel, false),
            WorkItem::Wms { id } => self.on_wms(id),
            WorkItem::Scf { id, file } => self.on_scf(id, &file),
            WorkItem::Twl { id, channel, wavelength } => self.on_twl(id, &channel, wavelength),
            WorkItem::Tfr { id, channel, frequency } => self.on_tfr(id, &channel, frequency),
            WorkItem::Exp { id, channel, exposure } => self.on_exp(id, &channel, exposure),
            WorkItem::Vlt { id, channel, volts } => self.on_vlt(id, &channel, volts),
            WorkItem::Ppp { id, channel, value } => self.on_pid_coeff(id, &channel, "PPP", value, |c, v| c.pp = v),
            WorkItem::Iii { id, channel, value } => self.on_pid_coeff(id, &channel, "III", value, |c, v| c.ii = v),
            WorkItem::Ddd { id, channel, value } => self.on_pid_coeff(id, &channel, "DDD", value, |c, v| c.dd = v),
            WorkItem::Gan { id, channel, value } => self.on_pid_coeff(id, &channel, "GAN", value, |c, v| c.gain = v),
        }
    }

    fn on_con(&mut self, id: ClientId, requested_name: String, handle: ClientHandle) {
        let mut name = requested_name.clone();
        let mut duplicate_index = 0u32;
        loop {
            if self.clients.values().any(|c| c.name == name) {
                duplicate_index += 1;
                name = format!("{requested_name}({duplicate_index})");
            } else {
                break;
            }
        }
        info!(client = %name, "client connected");
        monitoring::clients_connected().inc();
        self.clients.insert(
            id,
            ClientRecord {
                id,
                name,
                handle,
                channel_list: indexmap::IndexSet::new(),
                duplicate_index,
                consecutive_send_failures: 0,
            },
        );
        self.send_to(id, Frame::control("STA", vec![Value::Str(self.status.as_wire_str().to_string())]));
    }

    fn on_dcn(&mut self, id: ClientId) {
        let Some(client) = self.clients.shift_remove(&id) else {
            return; // idempotent: already removed
        };
        // Consistency check: a nonzero `duplicate_index` must show up as that exact "(n)" suffix
        // on the name `on_con` assigned it.
        if client.duplicate_index > 0 {
            debug_assert!(
                client.name.ends_with(&format!("({})", client.duplicate_index)),
                "client {:?} name {:?} doesn't match its duplicate_index {}",
                client.id,
                client.name,
                client.duplicate_index
            );
        }
        for channel_name in &client.channel_list {
            if let Some(channel) = self.channels.get(channel_name) {
                channel.lock().unwrap().unsubscribe(&client.name);
            }
            monitoring::active_subscriptions().dec();
        }
        monitoring::clients_connected().dec();
        info!(client = %client.name, "client disconnected");
    }

    fn on_srt(&mut self, id: ClientId) {
        if self.status != ServerStatus::Stopped {
            self.send_to(id, Frame::control("STA", vec![Value::Str(self.status.as_wire_str().to_string())]));
            return;
        }
        if let Err(e) = self.wavemeter.start_measurement() {
            warn!(error = %e, "failed to start wavemeter measurement");
            self.send_to(id, Frame::nak(format!("driver error: {e}")));
            return;
        }
        self.set_status(ServerStatus::Started);
        self.activate_pid();
        self.broadcast_status();
    }

    fn on_stp(&mut self, id: ClientId) {
        if self.status == ServerStatus::Stopped {
            self.send_to(id, Frame::control("STA", vec![Value::Str(self.status.as_wire_str().to_string())]));
            return;
        }
        if let Err(e) = self.wavemeter.stop_measurement() {
            warn!(error = %e, "failed to stop wavemeter measurement");
        }
        self.set_status(ServerStatus::Stopped);
        self.set_focused(None);
        self.deactivate_pid();
        self.broadcast_status();
    }

    fn on_kil(&mut self, id: ClientId) {
        // REDESIGN FLAG (b): KIL is STP plus a driver shutdown, final for the process.
        self.on_stp(id);
        if let Err(e) = self.wavemeter.stop_measurement() {
            warn!(error = %e, "driver shutdown reported an error during KIL");
        }
        info!("KIL received, controller considers the process terminal");
    }

    fn broadcast_status(&mut self) {
        let frame = Frame::control("STA", vec![Value::Str(self.status.as_wire_str().to_string())]);
        self.broadcast_all(frame);
    }

    fn channel_allowed_for_status(&self, channel: &str) -> bool {
        match self.status {
            ServerStatus::Focused => self.focused.as_deref() == Some(channel),
            _ => true,
        }
    }

    fn on_uon(&mut self, id: ClientId, channel_name: &str) {
        if !self.channels.contains_key(channel_name) {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        }
        if !self.channel_allowed_for_status(channel_name) {
            self.send_to(id, Frame::nak("server is focused on a different channel"));
            return;
        }
        let Some(client_name) = self.clients.get(&id).map(|c| c.name.clone()) else {
            return;
        };
        self.channels
            .get(channel_name)
            .unwrap()
            .lock()
            .unwrap()
            .monitor_list
            .insert(client_name.clone());
        if let Some(client) = self.clients.get_mut(&id) {
            client.channel_list.insert(channel_name.to_string());
        }
        monitoring::active_subscriptions().inc();
        self.activate_pid();
    }

    fn on_uof(&mut self, id: ClientId, channel_name: &str) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        };
        let Some(client_name) = self.clients.get(&id).map(|c| c.name.clone()) else {
            return;
        };
        channel.lock().unwrap().unsubscribe(&client_name);
        if let Some(client) = self.clients.get_mut(&id) {
            if client.channel_list.shift_remove(channel_name) {
                monitoring::active_subscriptions().dec();
            }
        }
    }

    fn on_pid_toggle(&mut self, id: ClientId, channel_name: &str, on: bool) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        };
        if !self.channel_allowed_for_status(channel_name) {
            self.send_to(id, Frame::nak("another channel is focused"));
            return;
        }
        let mut ch = channel.lock().unwrap();
        ch.pid_on = on;
        let frame = if on {
            Frame::control(
                "PON",
                vec![
                    Value::Str(channel_name.to_string()),
                    Value::Float(ch.target_frequency),
                    Value::Float(ch.pp),
                    Value::Float(ch.ii),
                    Value::Float(ch.dd),
                    Value::Float(ch.gain),
                ],
            )
        } else {
            Frame::control("POF", vec![Value::Str(channel_name.to_string())])
        };
        let monitor_list = ch.monitor_list.clone();
        drop(ch);
        self.fanout(&monitor_list, frame);
    }

    fn on_fon(&mut self, id: ClientId, channel_name: &str) {
        if !self.channels.contains_key(channel_name) {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        }
        // REDESIGN FLAG (c): FON requires the server to already be started.
        if self.status != ServerStatus::Started {
            self.send_to(id, Frame::nak("FON requires the server to be started"));
            return;
        }
        self.set_focused(Some(channel_name.to_string()));
        self.set_status(ServerStatus::Focused);
        self.activate_pid();
        self.broadcast_all(Frame::control("FON", vec![Value::Str(channel_name.to_string())]));
    }

    fn on_fof(&mut self, id: ClientId, channel_name: &str) {
        if self.focused.as_deref() != Some(channel_name) {
            self.send_to(id, Frame::nak("that channel is not focused"));
            return;
        }
        self.set_focused(None);
        self.set_status(ServerStatus::Started);
        self.broadcast_all(Frame::control("FOF", vec![Value::Str(channel_name.to_string())]));
    }

    fn on_auto_exposure_toggle(&mut self, id: ClientId, channel_name: &str, on: bool) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        };
        if !self.channel_allowed_for_status(channel_name) {
            self.send_to(id, Frame::nak("another channel is focused"));
            return;
        }
        let mut ch = channel.lock().unwrap();
        ch.auto_exposure_on = on;
        let monitor_list = ch.monitor_list.clone();
        drop(ch);
        let command = if on { "AEN" } else { "AEF" };
        self.fanout(&monitor_list, Frame::control(command, vec![Value::Str(channel_name.to_string())]));
    }

    fn on_wms(&mut self, id: ClientId) {
        let mut data = vec![Value::Str(self.status.as_wire_str().to_string())];
        for (name, channel) in self.channels.iter() {
            let ch = channel.lock().unwrap();
            data.push(Value::List(vec![
                Value::Str(name.clone()),
                Value::Float(ch.target_frequency),
                Value::Float(ch.current_frequency),
                Value::Int(ch.exposure_time as i64),
                Value::Int(ch.pid_on as i64),
                Value::Int(ch.auto_exposure_on as i64),
            ]));
        }
        self.send_to(id, Frame::data_update("WMS", data));
    }

    fn on_scf(&mut self, id: ClientId, file: &str) {
        let path = config::resolve_snapshot_path(&self.config_dir, file);
        let snapshot: Vec<_> = self
            .channels
            .iter()
            .map(|(_, c)| c.lock().unwrap().clone())
            .collect();
        match config::write_snapshot(&path, &self.params, &snapshot) {
            Ok(()) => info!(path = %path.display(), "configuration snapshot written"),
            Err(e) => {
                warn!(error = %e, "failed to write configuration snapshot");
                self.send_to(id, Frame::nak(format!("could not write snapshot: {e}")));
            }
        }
    }

    fn on_twl(&mut self, id: ClientId, channel_name: &str, wavelength: f64) {
        let frequency = wavelength_to_frequency(wavelength);
        self.on_tfr(id, channel_name, frequency);
    }

    fn on_tfr(&mut self, id: ClientId, channel_name: &str, frequency: f64) {
        self.update_channel_field(id, channel_name, "TFR", Value::Float(frequency), |c| {
            c.target_frequency = frequency
        });
    }

    fn on_exp(&mut self, id: ClientId, channel_name: &str, exposure: u32) {
        let clamped = exposure.clamp(self.wavemeter.exposure_min(), self.wavemeter.exposure_max());
        self.update_channel_field(id, channel_name, "EXP", Value::Int(clamped as i64), |c| {
            c.exposure_time = clamped
        });
    }

    fn on_vlt(&mut self, id: ClientId, channel_name: &str, volts: f64) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        };
        if let Err(e) = self.dac.set_voltage(channel.lock().unwrap().dac_channel, volts) {
            warn!(error = %e, channel = channel_name, "DAC command failed");
            self.send_to(id, Frame::nak(format!("DAC error: {e}")));
            return;
        }
        // REDESIGN FLAG (d): VLT is authoritative over `recent_output_voltage`.
        let mut ch = channel.lock().unwrap();
        ch.recent_output_voltage = volts;
        let monitor_list = ch.monitor_list.clone();
        drop(ch);
        self.fanout(
            &monitor_list,
            Frame::data_update("VLT", vec![Value::Str(channel_name.to_string()), Value::Float(volts)]),
        );
    }

    fn on_pid_coeff(
        &mut self,
        id: ClientId,
        channel_name: &str,
        command: &'static str,
        value: f64,
        apply: impl FnOnce(&mut Channel, f64),
    ) {
        self.update_channel_field(id, channel_name, command, Value::Float(value), move |c| apply(c, value));
    }

    fn update_channel_field(
        &mut self,
        id: ClientId,
        channel_name: &str,
        command: &'static str,
        value: Value,
        apply: impl FnOnce(&mut Channel),
    ) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.send_to(id, Frame::nak(format!("unknown channel {channel_name}")));
            return;
        };
        let mut ch = channel.lock().unwrap();
        apply(&mut ch);
        let monitor_list = ch.monitor_list.clone();
        drop(ch);
        self.fanout(
            &monitor_list,
            Frame::data_update(command, vec![Value::Str(channel_name.to_string()), value]),
        );
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Measured { channel, frequency } => {
                if let Some(c) = self.channels.get(&channel) {
                    let monitor_list = c.lock().unwrap().monitor_list.clone();
                    self.fanout(
                        &monitor_list,
                        Frame::data_update("CFR", vec![Value::Str(channel), Value::Float(frequency)]),
                    );
                }
            }
            ControllerEvent::ExposureAdjusted { channel, exposure_time } => {
                if let Some(c) = self.channels.get(&channel) {
                    let monitor_list = c.lock().unwrap().monitor_list.clone();
                    self.fanout(
                        &monitor_list,
                        Frame::data_update("EXP", vec![Value::Str(channel), Value::Int(exposure_time as i64)]),
                    );
                }
            }
            ControllerEvent::OutputCommanded {
                channel,
                volts,
                accumulator,
                proportional,
                differentiator,
            } => {
                if let Some(c) = self.channels.get(&channel) {
                    let monitor_list = c.lock().unwrap().monitor_list.clone();
                    self.fanout(
                        &monitor_list,
                        Frame::data_update("VLT", vec![Value::Str(channel.clone()), Value::Float(volts)]),
                    );
                    self.fanout(
                        &monitor_list,
                        Frame::data_update(
                            "APD",
                            vec![
                                Value::Str(channel),
                                Value::Float(accumulator),
                                Value::Float(proportional),
                                Value::Float(differentiator),
                            ],
                        ),
                    );
                }
            }
            ControllerEvent::FocusedChannelEmpty { channel } => {
                if self.focused.as_deref() == Some(channel.as_str()) {
                    self.set_focused(None);
                    self.set_status(ServerStatus::Started);
                    self.broadcast_all(Frame::control("FOF", vec![Value::Str(channel)]));
                }
            }
            ControllerEvent::SweepFoundNoSubscribers => {
                debug!("PID sweep found no subscribed channels, loop going idle");
            }
            ControllerEvent::DriverError { channel, message } => {
                warn!(channel = ?channel, error = %message, "driver error reported by PID loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimulatedDac, SimulatedWavemeter};
    use std::sync::Arc;

    fn test_controller() -> (Controller, PidHandles, mpsc::UnboundedReceiver<ControllerEvent>) {
        let mut channels = IndexMap::new();
        channels.insert(
            "Ch1".to_string(),
            Arc::new(Mutex::new(Channel::new("Ch1", 0, 0, 300.0, 10, 0.0, 0.0, 0.0, 1.0))),
        );
        let channels: ChannelTable = Arc::new(channels);
        let wavemeter = Arc::new(SimulatedWavemeter::new(50, 1, 1000));
        let dac = Arc::new(SimulatedDac::new());
        let params = Arc::new(PidParams::default());
        Controller::new(channels, wavemeter, dac, params, PathBuf::from("."))
    }

    #[test]
    fn con_dedupes_client_names() {
        let (mut controller, _handles, _rx) = test_controller();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        controller.on_con(ClientId(1), "alice".to_string(), tx1);
        controller.on_con(ClientId(2), "alice".to_string(), tx2);
        assert_eq!(controller.clients.get(&ClientId(1)).unwrap().name, "alice");
        assert_eq!(controller.clients.get(&ClientId(2)).unwrap().name, "alice(1)");
    }

    #[test]
    fn unknown_channel_is_nacked() {
        let (mut controller, _handles, _rx) = test_controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.on_con(ClientId(1), "alice".to_string(), tx);
        rx.try_recv().unwrap(); // STA from CON
        controller.on_uon(ClientId(1), "NoSuchChannel");
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, "NAK");
    }

    #[test]
    fn dcn_unsubscribes_from_all_channels_and_is_idempotent() {
        let (mut controller, _handles, _rx) = test_controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.on_con(ClientId(1), "alice".to_string(), tx);
        rx.try_recv().unwrap();
        controller.on_uon(ClientId(1), "Ch1");
        assert!(controller.channels["Ch1"].lock().unwrap().monitor_list.contains("alice"));
        controller.on_dcn(ClientId(1));
        assert!(!controller.channels["Ch1"].lock().unwrap().monitor_list.contains("alice"));
        // idempotent: second DCN on an already-removed client is a no-op, not a panic
        controller.on_dcn(ClientId(1));
    }

    #[test]
    fn unsubscribing_last_monitor_clears_pid_and_auto_exposure() {
        let (mut controller, _handles, _rx) = test_controller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.on_con(ClientId(1), "alice".to_string(), tx);
        rx.try_recv().unwrap();
        controller.on_uon(ClientId(1), "Ch1");
        controller.on_pid_toggle(ClientId(1), "Ch1", true);
        controller.on_uof(ClientId(1), "Ch1");
        let ch = controller.channels["Ch1"].lock().unwrap();
        assert!(!ch.pid_on);
        assert!(!ch.auto_exposure_on);
    }
}
