//! Hardware output volume through the ALSA mixer.
//!
//! The board's amplifier control is inverted: a larger raw value is quieter.
//! Percentages map linearly onto the configured raw range and every computed
//! raw value is clamped back into it.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::VolumeConfig;
use crate::error::{AssistantError, Result};
use crate::intent::VolumeCommand;

/// Applies spoken volume requests to the output device.
#[async_trait]
pub trait VolumeControl: Send + Sync {
    /// Apply `command`. Returns the resulting volume in percent.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Volume`] if the mixer cannot be read or
    /// written.
    async fn apply(&self, command: VolumeCommand) -> Result<u8>;
}

/// Linear percent ↔ raw mapping over a mixer control's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    /// Lowest raw value.
    pub min: i64,
    /// Highest raw value.
    pub max: i64,
    /// Whether a larger raw value means quieter output.
    pub inverted: bool,
}

impl RawRange {
    /// Range described by the mixer config.
    pub fn from_config(config: &VolumeConfig) -> Self {
        Self {
            min: config.raw_min.min(config.raw_max),
            max: config.raw_max.max(config.raw_min),
            inverted: config.inverted,
        }
    }

    fn span(&self) -> i64 {
        self.max - self.min
    }

    /// Clamp a raw value into the range.
    pub fn clamp(&self, raw: i64) -> i64 {
        raw.clamp(self.min, self.max)
    }

    /// Raw value for `percent` (clamped to 0–100).
    pub fn percent_to_raw(&self, percent: u8) -> i64 {
        let delta = self.span() * i64::from(percent.min(100)) / 100;
        let raw = if self.inverted {
            self.max - delta
        } else {
            self.min + delta
        };
        self.clamp(raw)
    }

    /// Percentage a raw value represents, rounded to nearest.
    pub fn raw_to_percent(&self, raw: i64) -> u8 {
        if self.span() == 0 {
            return 0;
        }
        let raw = self.clamp(raw);
        let offset = if self.inverted {
            self.max - raw
        } else {
            raw - self.min
        };
        ((offset * 100 + self.span() / 2) / self.span()).clamp(0, 100) as u8
    }

    /// Raw distance for a `percent` step. Never zero for a non-zero step.
    pub fn step(&self, percent: u8) -> i64 {
        if percent == 0 {
            return 0;
        }
        (self.span() * i64::from(percent.min(100)) / 100).max(1)
    }

    /// Raw value after moving `current` by `percent`, louder when `up`.
    pub fn adjust(&self, current: i64, up: bool, percent: u8) -> i64 {
        let step = self.step(percent);
        let louder_is_smaller = self.inverted;
        let next = if up == louder_is_smaller {
            current - step
        } else {
            current + step
        };
        self.clamp(next)
    }
}

/// Extract the first `: values=N` reading from `amixer cget` output.
pub fn parse_values(output: &str) -> Option<i64> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix(": values=")?;
        value.split(',').next()?.trim().parse().ok()
    })
}

/// Volume control backed by `amixer`.
#[derive(Debug, Clone)]
pub struct AmixerVolume {
    program: String,
    card: u32,
    get_control: String,
    set_control: String,
    range: RawRange,
}

impl AmixerVolume {
    /// Control configured from the mixer section.
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            program: config.program.clone(),
            card: config.card,
            get_control: config.get_control.clone(),
            set_control: config.set_control.clone(),
            range: RawRange::from_config(config),
        }
    }

    /// Arguments for reading the current raw value.
    pub fn get_args(&self) -> Vec<String> {
        vec![
            "-c".to_owned(),
            self.card.to_string(),
            "cget".to_owned(),
            format!("name={}", self.get_control),
        ]
    }

    /// Arguments for writing `raw`.
    pub fn set_args(&self, raw: i64) -> Vec<String> {
        vec![
            "-c".to_owned(),
            self.card.to_string(),
            "sset".to_owned(),
            self.set_control.clone(),
            self.range.clamp(raw).to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| AssistantError::Volume(format!("cannot run {}: {e}", self.program)))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(AssistantError::Volume(format!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                text.trim()
            )));
        }
        Ok(text)
    }

    async fn read_raw(&self) -> Result<i64> {
        let output = self.run(self.get_args()).await?;
        parse_values(&output)
            .map(|raw| self.range.clamp(raw))
            .ok_or_else(|| AssistantError::Volume("no `: values=` line in mixer output".into()))
    }
}

#[async_trait]
impl VolumeControl for AmixerVolume {
    async fn apply(&self, command: VolumeCommand) -> Result<u8> {
        let raw = match command {
            VolumeCommand::Set(percent) => self.range.percent_to_raw(percent),
            VolumeCommand::Adjust { up, percent } => {
                let current = self.read_raw().await?;
                debug!(current, up, percent, "adjusting volume");
                self.range.adjust(current, up, percent)
            }
        };
        self.run(self.set_args(raw)).await?;
        let percent = self.range.raw_to_percent(raw);
        info!(raw, percent, "volume set");
        Ok(percent)
    }
}
