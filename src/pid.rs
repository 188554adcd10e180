//! Periodic measurement scheduler (spec.md 4.2)
//!
//! Normal mode sweeps every channel with at least one subscriber once per second; focused mode
//! narrows the sweep to a single channel and drops the one-second pacing so that channel can be
//! serviced as fast as the hardware allows. Either way, this task never touches the client
//! registry — it reports what it measured via [`ControllerEvent`] and lets the Controller turn
//! that into fan-out frames, which is what keeps the Controller the sole writer of client queues.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::common::ROUND_DURATION;
use crate::controller::{ControllerEvent, PidHandles};
use crate::driver::{SENTINEL_NO_SIGNAL, SENTINEL_OVER_EXPOSED, SENTINEL_UNDER_EXPOSED};
use crate::monitoring;
use crate::registry::{Channel, ServerStatus};

pub async fn run(handles: PidHandles, mut shutdown: broadcast::Receiver<()>) {
    debug!("PID loop starting");
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        let status = *handles.status_rx.borrow();
        if !handles.active.load(Ordering::SeqCst) || status == ServerStatus::Stopped {
            tokio::select! {
                _ = handles.notify.notified() => {}
                _ = shutdown.recv() => break,
            }
            continue;
        }

        let focused = handles.focused_rx.borrow().clone();
        if let Some(channel_name) = focused {
            let Some(channel) = handles.channels.get(&channel_name) else {
                sleep(ROUND_DURATION).await;
                continue;
            };
            let has_subscribers = !channel.lock().unwrap().monitor_list.is_empty();
            if !has_subscribers {
                let _ = handles.events.send(ControllerEvent::FocusedChannelEmpty {
                    channel: channel_name,
                });
                sleep(ROUND_DURATION).await;
                continue;
            }
            measure_channel(&channel_name, channel, &handles).await;
        } else {
            let round_start = Instant::now();
            let mut any_subscribed = false;
            for (name, channel) in handles.channels.iter() {
                let has_subscribers = !channel.lock().unwrap().monitor_list.is_empty();
                if !has_subscribers {
                    continue;
                }
                any_subscribed = true;
                measure_channel(name, channel, &handles).await;
            }
            if !any_subscribed {
                handles.active.store(false, Ordering::SeqCst);
                let _ = handles.events.send(ControllerEvent::SweepFoundNoSubscribers);
                continue;
            }
            let elapsed = round_start.elapsed();
            monitoring::pid_round_duration().set(elapsed.as_secs_f64());
            if elapsed < ROUND_DURATION {
                sleep(ROUND_DURATION - elapsed).await;
            }
        }
    }
    debug!("PID loop stopping");
}

/// Frequency jump (THz) above which `weighted_frequency` snaps to the new reading instead of
/// EWMA-blending it (spec.md 4.2 step 4: "1 GHz jump")
const WEIGHTED_FREQUENCY_JUMP_THZ: f64 = 0.001;
/// Weight given to the new reading in the `weighted_frequency` EWMA (spec.md 4.2 step 4)
const EWMA_NEW_WEIGHT: f64 = 0.9;

/// One measurement step for a single channel (spec.md 4.2's `channel_measure`): switch, settle,
/// expose, read, emit `CFR` unconditionally, then (unless the reading is a sentinel) update the
/// weighted average and, if PID is enabled, the DAC output.
pub async fn measure_channel(name: &str, channel: &Arc<std::sync::Mutex<Channel>>, handles: &PidHandles) {
    let (fiber_switch, exposure_time, pid_on, auto_exposure_on, target_frequency, pp, ii, dd, gain, dac_channel) = {
        let ch = channel.lock().unwrap();
        (
            ch.fiber_switch,
            ch.exposure_time,
            ch.pid_on,
            ch.auto_exposure_on,
            ch.target_frequency,
            ch.pp,
            ch.ii,
            ch.dd,
            ch.gain,
            ch.dac_channel,
        )
    };

    if let Err(e) = handles.wavemeter.set_switch_channel(fiber_switch) {
        let _ = handles.events.send(ControllerEvent::DriverError {
            channel: Some(name.to_string()),
            message: e.to_string(),
        });
        return;
    }
    sleep(std::time::Duration::from_millis(handles.params.switch_safe)).await;

    if let Err(e) = handles.wavemeter.set_exposure(fiber_switch, exposure_time) {
        warn!(channel = name, error = %e, "failed to set exposure");
    }
    sleep(std::time::Duration::from_millis(
        (exposure_time + handles.wavemeter.switch_delay_ms()) as u64,
    ))
    .await;

    let reading = match handles.wavemeter.get_frequency(fiber_switch) {
        Ok(r) => r,
        Err(e) => {
            let _ = handles.events.send(ControllerEvent::DriverError {
                channel: Some(name.to_string()),
                message: e.to_string(),
            });
            return;
        }
    };

    let previous_weighted = channel.lock().unwrap().weighted_frequency;
    let now = Instant::now();
    let previous_time = {
        let mut ch = channel.lock().unwrap();
        let previous_time = ch.current_time;
        ch.current_time = now;
        previous_time
    };
    let _ = handles.events.send(ControllerEvent::Measured {
        channel: name.to_string(),
        frequency: reading,
    });

    if reading == SENTINEL_NO_SIGNAL {
        debug!(channel = name, "no signal on this exposure");
        return;
    }
    if reading == SENTINEL_UNDER_EXPOSED || reading == SENTINEL_OVER_EXPOSED {
        if auto_exposure_on {
            adjust_exposure(name, channel, handles, reading == SENTINEL_UNDER_EXPOSED).await;
        }
        return;
    }

    let weighted = if (reading - previous_weighted).abs() > WEIGHTED_FREQUENCY_JUMP_THZ {
        reading
    } else {
        reading * EWMA_NEW_WEIGHT + previous_weighted * (1.0 - EWMA_NEW_WEIGHT)
    };

    {
        let mut ch = channel.lock().unwrap();
        ch.current_frequency = reading;
        ch.weighted_frequency = weighted;
    }

    if !pid_on {
        return;
    }

    let mut offset = weighted - target_frequency;
    if offset > handles.params.max_frequency_offset {
        offset = handles.params.max_frequency_offset;
    }
    let dt = now.saturating_duration_since(previous_time).as_secs_f64().max(1e-6);
    let mut delta_f = weighted - previous_weighted;
    if delta_f > handles.params.max_frequency_change {
        delta_f = handles.params.max_frequency_change;
    }

    let (accumulator, proportional, differentiator, output) = {
        let mut ch = channel.lock().unwrap();
        let accumulator = ch.accumulator + ii * offset * dt;
        let proportional = pp * offset;
        let differentiator = dd * delta_f / dt;
        let output = ch.recent_output_voltage + (accumulator + proportional + differentiator) * gain;
        ch.accumulator = accumulator;
        ch.proportional = proportional;
        ch.differentiator = differentiator;
        ch.recent_output_voltage = output;
        (accumulator, proportional, differentiator, output)
    };

    if let Err(e) = handles.dac.set_voltage(dac_channel, output) {
        let _ = handles.events.send(ControllerEvent::DriverError {
            channel: Some(name.to_string()),
            message: e.to_string(),
        });
    } else {
        let _ = handles.events.send(ControllerEvent::OutputCommanded {
            channel: name.to_string(),
            volts: output,
            accumulator,
            proportional,
            differentiator,
        });
    }
}

async fn adjust_exposure(name: &str, channel: &Arc<std::sync::Mutex<Channel>>, handles: &PidHandles, increase: bool) {
    let new_exposure = {
        let mut ch = channel.lock().unwrap();
        let step = handles.params.auto_exposure_step;
        let candidate = if increase {
            (ch.exposure_time as f64 * step).round() as u32
        } else {
            (ch.exposure_time as f64 / step).round() as u32
        };
        let candidate = candidate.clamp(handles.wavemeter.exposure_min(), handles.wavemeter.exposure_max());
        ch.exposure_time = candidate;
        candidate
    };
    let _ = handles.events.send(ControllerEvent::ExposureAdjusted {
        channel: name.to_string(),
        exposure_time: new_exposure,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FIBER_SWITCH_POSITIONS;
    use crate::driver::{DacDriver, SimulatedDac, SimulatedWavemeter, WavemeterDriver};
    use indexmap::IndexMap;
    use tokio::sync::{mpsc, watch, Notify};

    fn handles_for(channel: Arc<std::sync::Mutex<Channel>>) -> (PidHandles, mpsc::UnboundedReceiver<ControllerEvent>) {
        let mut map = IndexMap::new();
        map.insert("Ch1".to_string(), channel);
        let (status_tx, status_rx) = watch::channel(ServerStatus::Started);
        let (_focused_tx, focused_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = status_tx;
        let handles = PidHandles {
            channels: Arc::new(map),
            status_rx,
            focused_rx,
            active: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
            events: event_tx,
            wavemeter: Arc::new(SimulatedWavemeter::new(1, 1, 1000)),
            dac: Arc::new(SimulatedDac::new()),
            params: Arc::new(crate::config::PidParams::default()),
        };
        (handles, event_rx)
    }

    #[tokio::test]
    async fn measuring_a_subscribed_channel_reports_frequency() {
        let channel = Arc::new(std::sync::Mutex::new(Channel::new(
            "Ch1", 0, 0, 300.0, 10, 1.0, 0.0, 0.0, 1.0,
        )));
        channel.lock().unwrap().monitor_list.insert("alice".to_string());
        let (handles, mut events) = handles_for(channel.clone());
        handles.wavemeter.start_measurement().unwrap();
        measure_channel("Ch1", &channel, &handles).await;
        let event = events.try_recv().unwrap();
        match event {
            ControllerEvent::Measured { channel, frequency } => {
                assert_eq!(channel, "Ch1");
                assert_eq!(frequency, 300.0);
            }
            other => panic!("expected Measured, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pid_enabled_channel_commands_the_dac() {
        let channel = Arc::new(std::sync::Mutex::new(Channel::new(
            "Ch1", 0, 7, 300.0, 10, 1.0, 0.0, 0.0, 1.0,
        )));
        {
            let mut ch = channel.lock().unwrap();
            ch.monitor_list.insert("alice".to_string());
            ch.pid_on = true;
        }
        let (handles, mut events) = handles_for(channel.clone());
        handles.wavemeter.start_measurement().unwrap();
        let sim_wavemeter = &handles.wavemeter;
        sim_wavemeter.set_switch_channel(0).unwrap();
        measure_channel("Ch1", &channel, &handles).await;
        let _ = events.try_recv(); // Measured
        let event = events.try_recv().unwrap();
        assert!(matches!(event, ControllerEvent::OutputCommanded { .. }));
        assert!(handles.dac.last_voltage(7).is_some());
    }

    #[test]
    fn fiber_switch_positions_constant_matches_driver_bounds() {
        assert_eq!(FIBER_SWITCH_POSITIONS, 9);
    }
}
