//! Constants shared across the controller, PID loop, protocol, and driver layers

use std::time::Duration;

/// Speed of light in m/s, used to convert target wavelength to target frequency (`TWL`)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Standard timeout used when a worker blocks on an internal channel it expects traffic on
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Target wall-clock duration of one PID round outside of focused mode
pub const ROUND_DURATION: Duration = Duration::from_secs(1);

/// Number of physical fiber switch positions (0-8)
pub const FIBER_SWITCH_POSITIONS: usize = 9;

/// Convert a target wavelength to a target frequency via `f = c / lambda` (`TWL` command)
pub fn wavelength_to_frequency(lambda: f64) -> f64 {
    SPEED_OF_LIGHT / lambda
}
