//! Startup channel registry and configuration snapshots (spec.md 6, `SCF`)
//!
//! Both the startup load and the `SCF` on-demand snapshot speak the same INI shape: a `[PID]`
//! section for the server-wide scheduling constants and one `[CH<n>]` section per channel.

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use crate::registry::Channel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write configuration file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required section [{section}] in {path}")]
    MissingSection { path: PathBuf, section: String },
    #[error("missing required key {key:?} in section [{section}]")]
    MissingKey { section: String, key: String },
    #[error("could not parse {key:?} in section [{section}]: {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Server-wide PID scheduling constants, fixed for the process lifetime (spec.md 4.2, 4.4)
#[derive(Debug, Clone, Copy)]
pub struct PidParams {
    /// Milliseconds to wait after switching the fiber before trusting a reading
    pub switch_safe: u64,
    /// Multiplier applied to `exposure_time` when auto-exposure nudges it up or down
    pub auto_exposure_step: f64,
    /// Upper bound on the clamped `offset = weighted - target` fed into the PID accumulator
    pub max_frequency_offset: f64,
    /// Upper bound on the clamped `Δf = weighted - previous` fed into the PID differentiator
    pub max_frequency_change: f64,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            switch_safe: 50,
            auto_exposure_step: 1.5,
            max_frequency_offset: 0.01,
            max_frequency_change: 0.01,
        }
    }
}

fn get_key<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str, ConfigError> {
    ini.section(Some(section))
        .ok_or_else(|| ConfigError::MissingSection {
            path: PathBuf::new(),
            section: section.to_string(),
        })?
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
}

fn parse_key<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str) -> Result<T, ConfigError> {
    let raw = get_key(ini, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Loaded at startup: the `[PID]` constants plus the fixed channel list (spec.md 3's "channel
/// set is fixed for process lifetime").
pub struct StartupConfig {
    pub params: PidParams,
    pub channels: Vec<Channel>,
}

/// Load the `[PID]` section and one `[CH<n>]` section per channel, in ascending `n` order.
/// `[PID]` missing is fatal (spec.md 7: mandatory-section failure aborts startup); an individual
/// malformed `[CH<n>]` section is also fatal since the channel set can't grow after startup.
pub fn load_startup_config(path: &Path) -> Result<StartupConfig, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;

    if ini.section(Some("PID")).is_none() {
        return Err(ConfigError::MissingSection {
            path: path.to_path_buf(),
            section: "PID".to_string(),
        });
    }
    let params = PidParams {
        switch_safe: parse_key(&ini, "PID", "switch_safe")?,
        auto_exposure_step: parse_key(&ini, "PID", "auto_exposure_step")?,
        max_frequency_offset: parse_key(&ini, "PID", "max_frequency_offset")?,
        max_frequency_change: parse_key(&ini, "PID", "max_frequency_change")?,
    };

    let mut channels = Vec::new();
    let mut index = 0;
    loop {
        let section = format!("CH{index}");
        if ini.section(Some(section.as_str())).is_none() {
            break;
        }
        let name: String = get_key(&ini, &section, "name")?.to_string();
        let fiber_switch: u8 = parse_key(&ini, &section, "fiber_switch")?;
        let dac_channel: u32 = parse_key(&ini, &section, "dac_channel")?;
        let target_frequency: f64 = parse_key(&ini, &section, "target_frequency")?;
        let exposure_time: u32 = parse_key(&ini, &section, "exposure_time")?;
        let pp: f64 = parse_key(&ini, &section, "pp").unwrap_or(0.0);
        let ii: f64 = parse_key(&ini, &section, "ii").unwrap_or(0.0);
        let dd: f64 = parse_key(&ini, &section, "dd").unwrap_or(0.0);
        let gain: f64 = parse_key(&ini, &section, "gain").unwrap_or(1.0);
        channels.push(Channel::new(
            name,
            fiber_switch,
            dac_channel,
            target_frequency,
            exposure_time,
            pp,
            ii,
            dd,
            gain,
        ));
        index += 1;
    }

    Ok(StartupConfig { params, channels })
}

/// Resolve a client-supplied `SCF` filename against the configured snapshot directory, rejecting
/// any path component that would escape it.
pub fn resolve_snapshot_path(config_dir: &Path, file: &str) -> PathBuf {
    let name = Path::new(file)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("snapshot.cfg"));
    config_dir.join(name)
}

/// Write the current channel state to an INI file in the same shape [`load_startup_config`]
/// reads, so a snapshot can be fed straight back in as a startup config.
pub fn write_snapshot(path: &Path, params: &PidParams, channels: &[Channel]) -> Result<(), ConfigError> {
    let mut ini = Ini::new();
    ini.with_section(Some("PID"))
        .set("switch_safe", params.switch_safe.to_string())
        .set("auto_exposure_step", params.auto_exposure_step.to_string())
        .set("max_frequency_offset", params.max_frequency_offset.to_string())
        .set("max_frequency_change", params.max_frequency_change.to_string());

    for (index, channel) in channels.iter().enumerate() {
        let section = format!("CH{index}");
        ini.with_section(Some(section.as_str()))
            .set("name", channel.name.clone())
            .set("fiber_switch", channel.fiber_switch.to_string())
            .set("dac_channel", channel.dac_channel.to_string())
            .set("target_frequency", channel.target_frequency.to_string())
            .set("exposure_time", channel.exposure_time.to_string())
            .set("pp", channel.pp.to_string())
            .set("ii", channel.ii.to_string())
            .set("dd", channel.dd.to_string())
            .set("gain", channel.gain.to_string());
    }

    ini.write_to_file(path).map_err(|e| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_path::TempPath {
        tempfile_path::TempPath::with_contents(contents)
    }

    // Minimal self-contained temp-file helper: avoids pulling in a `tempfile` dependency the
    // teacher's stack doesn't carry, for a module that only needs throwaway files in tests.
    mod tempfile_path {
        use std::path::{Path, PathBuf};

        pub struct TempPath(PathBuf);

        impl TempPath {
            pub fn with_contents(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("wavemeter_server_test_{}.ini", std::process::id()));
                std::fs::write(&path, contents).unwrap();
                Self(path)
            }
        }

        impl AsRef<Path> for TempPath {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn loads_pid_params_and_channels_in_order() {
        let temp = write_temp(
            "[PID]\nswitch_safe=75\nauto_exposure_step=1.5\nmax_frequency_offset=0.02\nmax_frequency_change=0.02\n\n\
             [CH0]\nname=Ch1\nfiber_switch=0\ndac_channel=0\ntarget_frequency=300.0\nexposure_time=10\n\n\
             [CH1]\nname=Ch2\nfiber_switch=1\ndac_channel=1\ntarget_frequency=310.0\nexposure_time=20\n",
        );
        let config = load_startup_config(temp.as_ref()).unwrap();
        assert_eq!(config.params.switch_safe, 75);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].name, "Ch1");
        assert_eq!(config.channels[1].name, "Ch2");
    }

    #[test]
    fn missing_pid_section_is_an_error() {
        let temp = write_temp("[CH0]\nname=Ch1\nfiber_switch=0\ndac_channel=0\ntarget_frequency=300.0\nexposure_time=10\n");
        assert!(matches!(
            load_startup_config(temp.as_ref()),
            Err(ConfigError::MissingSection { .. })
        ));
    }

    #[test]
    fn snapshot_round_trips_through_load() {
        let params = PidParams::default();
        let channels = vec![Channel::new("Ch1", 0, 0, 300.0, 10, 1.0, 2.0, 3.0, 4.0)];
        let mut path = std::env::temp_dir();
        path.push(format!("wavemeter_server_snapshot_{}.ini", std::process::id()));
        write_snapshot(&path, &params, &channels).unwrap();
        let loaded = load_startup_config(&path).unwrap();
        assert_eq!(loaded.channels[0].name, "Ch1");
        assert_eq!(loaded.channels[0].pp, 1.0);
        let _ = std::fs::remove_file(&path);
    }
}
