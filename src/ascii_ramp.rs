use crate::error::ConfigError;

pub const SHORT_RAMP: &str = " .:-=+*#%@";
pub const STANDARD_RAMP: &str =
    " .'`^\",:;Il!i~+_-?][}{1)(|\\/tfjrxnuvczXYUJCLQ0OZmwqpdbkhao*#MW&8%B@$";
pub const BLOCK_RAMP: &str = " ░▒▓█";

/// Ordered glyphs from visually sparse to visually dense.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ramp {
    glyphs: Vec<char>,
}

impl Ramp {
    pub fn new(glyphs: &str) -> Result<Self, ConfigError> {
        let glyphs = glyphs.chars().collect::<Vec<_>>();
        if glyphs.len() < 2 {
            return Err(ConfigError::RampTooShort(glyphs.len()));
        }
        Ok(Self { glyphs })
    }

    pub fn standard() -> Self {
        Self {
            glyphs: STANDARD_RAMP.chars().collect(),
        }
    }

    pub fn short() -> Self {
        Self {
            glyphs: SHORT_RAMP.chars().collect(),
        }
    }

    pub fn blocks() -> Self {
        Self {
            glyphs: BLOCK_RAMP.chars().collect(),
        }
    }

    /// Accepts a preset name or, failing that, a literal glyph string.
    /// Literal strings must be prefixed with `=` when they collide with a
    /// preset name.
    pub fn resolve(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "short" | "simple" => Ok(Self::short()),
            "standard" => Ok(Self::standard()),
            "blocks" => Ok(Self::blocks()),
            _ => match raw.strip_prefix('=') {
                Some(literal) => Self::new(literal),
                None if raw.chars().all(|c| c.is_ascii_alphabetic()) && raw.len() > 1 => {
                    Err(ConfigError::UnknownRamp(raw.to_owned()))
                }
                None => Self::new(raw),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn glyphs(&self) -> &[char] {
        &self.glyphs
    }

    pub fn glyph(&self, index: usize) -> char {
        self.glyphs[index.min(self.glyphs.len() - 1)]
    }

    pub fn densest(&self) -> char {
        self.glyphs[self.glyphs.len() - 1]
    }

    pub fn index_for(&self, brightness: u8) -> usize {
        quantize_index(brightness, self.glyphs.len())
    }

    pub fn index_for_level(&self, level: f32) -> usize {
        quantize_level(level, self.glyphs.len())
    }

    pub fn glyph_for(&self, brightness: u8) -> char {
        self.glyphs[self.index_for(brightness)]
    }
}

/// `floor(brightness / 255 * (len - 1))` in integer arithmetic.
pub fn quantize_index(brightness: u8, ramp_len: usize) -> usize {
    if ramp_len <= 1 {
        return 0;
    }
    let levels = (ramp_len - 1) as u32;
    ((u32::from(brightness) * levels / 255) as usize).min(ramp_len - 1)
}

/// `floor(level / 255 * (len - 1))` for an unrounded level. Agrees with
/// [`quantize_index`] on whole numbers.
pub fn quantize_level(level: f32, ramp_len: usize) -> usize {
    if ramp_len <= 1 || level.is_nan() {
        return 0;
    }
    let scaled = (level.clamp(0.0, 255.0) * (ramp_len - 1) as f32 / 255.0).floor();
    (scaled as usize).min(ramp_len - 1)
}
