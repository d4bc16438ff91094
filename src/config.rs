use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ascii_ramp::Ramp;
use crate::error::ConfigError;

pub const DEFAULT_WIDTH: u32 = 120;
pub const MIN_WIDTH: u32 = 40;
pub const MAX_WIDTH: u32 = 200;
pub const DEFAULT_CONTRAST: f32 = 0.1;
pub const MIN_CONTRAST: f32 = -0.5;
pub const MAX_CONTRAST: f32 = 0.8;

pub const DEFAULT_CAPTURE_FPS: u32 = 30;
pub const DEFAULT_EXPORT_FPS: u32 = 15;
pub const DEFAULT_REFRESH_HZ: u32 = 60;
pub const DEFAULT_SEEK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DECODE_WIDTH: u32 = 640;
pub const DEFAULT_CELL_SCALE: u32 = 2;
pub const DEFAULT_FONT_SIZE: f32 = 12.0;

/// Per-frame rendering settings. Read once per sampling pass and never
/// mutated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsciiConfig {
    pub width: u32,
    pub contrast: f32,
    pub inverted: bool,
    pub color: bool,
}

impl Default for AsciiConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            contrast: DEFAULT_CONTRAST,
            inverted: false,
            color: false,
        }
    }
}

impl AsciiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.width) {
            return Err(ConfigError::Width {
                value: self.width,
                min: MIN_WIDTH,
                max: MAX_WIDTH,
            });
        }
        if !self.contrast.is_finite() || !(MIN_CONTRAST..=MAX_CONTRAST).contains(&self.contrast) {
            return Err(ConfigError::Contrast {
                value: self.contrast,
                min: MIN_CONTRAST,
                max: MAX_CONTRAST,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ContainerPreference {
    #[default]
    Auto,
    Mp4,
    Webm,
}

/// Preset file contents. Every field is optional; anything missing falls
/// back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeckConfig {
    pub width: Option<u32>,
    pub contrast: Option<f32>,
    pub inverted: Option<bool>,
    pub color: Option<bool>,
    pub ramp: Option<String>,
    pub cell_scale: Option<u32>,
    pub font: Option<PathBuf>,
    pub font_size: Option<f32>,
    pub decode_width: Option<u32>,
    #[serde(rename = "loop")]
    pub looping: Option<bool>,
    pub capture: CaptureSection,
    pub export: ExportSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSection {
    pub fps: Option<u32>,
    pub container: Option<ContainerPreference>,
    pub refresh_hz: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportSection {
    pub fps: Option<u32>,
    pub seek_timeout_ms: Option<u64>,
}

impl DeckConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|error| ConfigError::Read(format!("{}: {error}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.ascii().validate()?;
        if let Some(ramp) = &self.ramp {
            Ramp::resolve(ramp)?;
        }
        let positive = [
            ("cell_scale", self.cell_scale.map(u64::from)),
            ("decode_width", self.decode_width.map(u64::from)),
            ("capture.fps", self.capture.fps.map(u64::from)),
            ("capture.refresh_hz", self.capture.refresh_hz.map(u64::from)),
            ("export.fps", self.export.fps.map(u64::from)),
            ("export.seek_timeout_ms", self.export.seek_timeout_ms),
        ];
        for (field, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if let Some(size) = self.font_size {
            if !size.is_finite() || size <= 0.0 {
                return Err(ConfigError::NotPositive { field: "font_size" });
            }
        }
        Ok(())
    }

    pub fn ascii(&self) -> AsciiConfig {
        let defaults = AsciiConfig::default();
        AsciiConfig {
            width: self.width.unwrap_or(defaults.width),
            contrast: self.contrast.unwrap_or(defaults.contrast),
            inverted: self.inverted.unwrap_or(defaults.inverted),
            color: self.color.unwrap_or(defaults.color),
        }
    }

    pub fn ramp(&self) -> Result<Ramp, ConfigError> {
        match &self.ramp {
            Some(raw) => Ramp::resolve(raw),
            None => Ok(Ramp::standard()),
        }
    }
}
