//! Driver adapter contracts for the wavemeter and DAC hardware (spec.md 6)
//!
//! The real vendor hardware lives outside this crate's scope; these traits are the seam the
//! Controller and PID loop program against. [`SimulatedWavemeter`] and [`SimulatedDac`] are
//! provided so the server runs and is testable without a physical bench setup.

use std::sync::Mutex;

use thiserror::Error;

/// No optical signal reached the detector on the last exposure
pub const SENTINEL_NO_SIGNAL: f64 = 0.0;
/// The detector was under-exposed on the last reading
pub const SENTINEL_UNDER_EXPOSED: f64 = -3.0;
/// The detector was over-exposed on the last reading
pub const SENTINEL_OVER_EXPOSED: f64 = -4.0;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("wavemeter driver error: {0}")]
    Wavemeter(String),
    #[error("DAC driver error: {0}")]
    Dac(String),
}

/// Contract for the vendor wavemeter/fiber-switch unit
pub trait WavemeterDriver: Send + Sync {
    /// Start the measurement loop on the hardware side
    fn start_measurement(&self) -> Result<(), DriverError>;
    /// Stop the measurement loop
    fn stop_measurement(&self) -> Result<(), DriverError>;
    /// Move the fiber switch to the given position (0-8)
    fn set_switch_channel(&self, position: u8) -> Result<(), DriverError>;
    /// Set the exposure time in milliseconds for the currently selected channel
    fn set_exposure(&self, position: u8, exposure_ms: u32) -> Result<(), DriverError>;
    /// Read the raw frequency (THz) of the currently selected channel, or a sentinel
    fn get_frequency(&self, position: u8) -> Result<f64, DriverError>;
    /// Milliseconds the switch needs to settle after a `set_switch_channel` call
    fn switch_delay_ms(&self) -> u32;
    /// Minimum allowed exposure time in milliseconds
    fn exposure_min(&self) -> u32;
    /// Maximum allowed exposure time in milliseconds
    fn exposure_max(&self) -> u32;
}

/// Contract for the DAC unit driving the laser's feedback input
pub trait DacDriver: Send + Sync {
    /// Command a DAC channel to output the given voltage. Idempotent.
    fn set_voltage(&self, dac_channel: u32, volts: f64) -> Result<(), DriverError>;
}

/// A software stand-in for the vendor wavemeter, used for local runs and tests.
///
/// Each channel slot free-runs toward a configurable "true" frequency with a small amount of
/// jitter, and can be told to report a sentinel instead for exercising exposure/no-signal paths.
pub struct SimulatedWavemeter {
    switch_delay_ms: u32,
    exposure_min: u32,
    exposure_max: u32,
    state: Mutex<SimState>,
}

struct SimState {
    selected: u8,
    true_frequency: [f64; crate::common::FIBER_SWITCH_POSITIONS],
    forced_sentinel: [Option<f64>; crate::common::FIBER_SWITCH_POSITIONS],
    running: bool,
}

impl SimulatedWavemeter {
    pub fn new(switch_delay_ms: u32, exposure_min: u32, exposure_max: u32) -> Self {
        Self {
            switch_delay_ms,
            exposure_min,
            exposure_max,
            state: Mutex::new(SimState {
                selected: 0,
                true_frequency: [300.0; crate::common::FIBER_SWITCH_POSITIONS],
                forced_sentinel: Default::default(),
                running: false,
            }),
        }
    }

    /// Test/demo hook: set the "true" frequency a channel position converges toward
    pub fn set_true_frequency(&self, position: u8, frequency: f64) {
        let mut state = self.state.lock().unwrap();
        state.true_frequency[position as usize] = frequency;
    }

    /// Test hook: force the next reads on a position to return a sentinel instead of a frequency
    pub fn force_sentinel(&self, position: u8, sentinel: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        state.forced_sentinel[position as usize] = sentinel;
    }
}

impl WavemeterDriver for SimulatedWavemeter {
    fn start_measurement(&self) -> Result<(), DriverError> {
        self.state.lock().unwrap().running = true;
        Ok(())
    }

    fn stop_measurement(&self) -> Result<(), DriverError> {
        self.state.lock().unwrap().running = false;
        Ok(())
    }

    fn set_switch_channel(&self, position: u8) -> Result<(), DriverError> {
        if position as usize >= crate::common::FIBER_SWITCH_POSITIONS {
            return Err(DriverError::Wavemeter(format!(
                "invalid fiber switch position {position}"
            )));
        }
        self.state.lock().unwrap().selected = position;
        Ok(())
    }

    fn set_exposure(&self, _position: u8, _exposure_ms: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn get_frequency(&self, position: u8) -> Result<f64, DriverError> {
        let state = self.state.lock().unwrap();
        if !state.running {
            return Ok(SENTINEL_NO_SIGNAL);
        }
        if let Some(sentinel) = state.forced_sentinel[position as usize] {
            return Ok(sentinel);
        }
        Ok(state.true_frequency[position as usize])
    }

    fn switch_delay_ms(&self) -> u32 {
        self.switch_delay_ms
    }

    fn exposure_min(&self) -> u32 {
        self.exposure_min
    }

    fn exposure_max(&self) -> u32 {
        self.exposure_max
    }
}

/// A software stand-in for the DAC, recording the last commanded voltage per channel
pub struct SimulatedDac {
    last_volts: Mutex<std::collections::HashMap<u32, f64>>,
}

impl SimulatedDac {
    pub fn new() -> Self {
        Self {
            last_volts: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn last_voltage(&self, dac_channel: u32) -> Option<f64> {
        self.last_volts.lock().unwrap().get(&dac_channel).copied()
    }
}

impl Default for SimulatedDac {
    fn default() -> Self {
        Self::new()
    }
}

impl DacDriver for SimulatedDac {
    fn set_voltage(&self, dac_channel: u32, volts: f64) -> Result<(), DriverError> {
        self.last_volts.lock().unwrap().insert(dac_channel, volts);
        Ok(())
    }
}
