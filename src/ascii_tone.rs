//! Luminance and contrast transfer.
//!
//! Both the live and the batch path go through [`ToneCurve::cell_tone`], so
//! the order is fixed: BT.709 luma of the raw sample, then the contrast
//! curve, then optional inversion. The quantizer sees the unrounded level;
//! only the fill colors are rounded to bytes.

use crate::config::AsciiConfig;

const BT709_R_WEIGHT: u32 = 2126;
const BT709_G_WEIGHT: u32 = 7152;
const BT709_B_WEIGHT: u32 = 722;
const BT709_WEIGHT_SUM: u32 = 10_000;
const MID_GRAY: f32 = 128.0;

pub fn bt709_luma_u8(r: u8, g: u8, b: u8) -> u8 {
    let weighted = BT709_R_WEIGHT * u32::from(r)
        + BT709_G_WEIGHT * u32::from(g)
        + BT709_B_WEIGHT * u32::from(b);
    ((weighted + (BT709_WEIGHT_SUM / 2)) / BT709_WEIGHT_SUM) as u8
}

/// Slope of the contrast curve around mid-gray. `contrast_factor(0.0)` is
/// exactly 1.
pub fn contrast_factor(contrast: f32) -> f32 {
    let c = contrast * 255.0;
    (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
}

/// Tone output for one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellTone {
    /// Adjusted brightness in `[0, 255]` before rounding, fed to the
    /// quantizer.
    pub level: f32,
    /// `level` rounded to a byte.
    pub brightness: u8,
    /// Contrast-adjusted color, used as the fill in color mode.
    pub rgb: [u8; 3],
}

/// Precomputed transfer table for one configuration snapshot.
#[derive(Debug, Clone)]
pub struct ToneCurve {
    levels: [f32; 256],
    table: [u8; 256],
    inverted: bool,
}

impl ToneCurve {
    pub fn new(contrast: f32, inverted: bool) -> Self {
        let factor = contrast_factor(contrast);
        let mut levels = [0_f32; 256];
        let mut table = [0_u8; 256];
        for (value, (level, byte)) in levels.iter_mut().zip(table.iter_mut()).enumerate() {
            *level = (factor * (value as f32 - MID_GRAY) + MID_GRAY).clamp(0.0, 255.0);
            *byte = level.round() as u8;
        }
        Self {
            levels,
            table,
            inverted,
        }
    }

    pub fn from_config(config: &AsciiConfig) -> Self {
        Self::new(config.contrast, config.inverted)
    }

    pub fn adjust(&self, value: u8) -> u8 {
        self.table[usize::from(value)]
    }

    /// Unrounded form of [`ToneCurve::adjust`].
    pub fn level(&self, value: u8) -> f32 {
        self.levels[usize::from(value)]
    }

    pub fn inverted(&self) -> bool {
        self.inverted
    }

    pub fn cell_tone(&self, r: u8, g: u8, b: u8) -> CellTone {
        let luma = bt709_luma_u8(r, g, b);
        let (mut level, mut brightness) = (self.level(luma), self.adjust(luma));
        if self.inverted {
            level = 255.0 - level;
            brightness = 255 - brightness;
        }
        CellTone {
            level,
            brightness,
            rgb: [self.adjust(r), self.adjust(g), self.adjust(b)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_matches_reference_points() {
        assert_eq!(bt709_luma_u8(0, 0, 0), 0);
        assert_eq!(bt709_luma_u8(255, 255, 255), 255);
        assert_eq!(bt709_luma_u8(255, 0, 0), 54);
        assert_eq!(bt709_luma_u8(0, 255, 0), 182);
        assert_eq!(bt709_luma_u8(0, 0, 255), 18);
    }

    #[test]
    fn zero_contrast_is_identity() {
        let curve = ToneCurve::new(0.0, false);
        for value in 0..=255_u8 {
            assert_eq!(curve.adjust(value), value);
        }
    }

    #[test]
    fn positive_contrast_spreads_away_from_mid_gray() {
        let curve = ToneCurve::new(0.5, false);
        assert!(curve.adjust(64) < 64);
        assert!(curve.adjust(192) > 192);
        assert_eq!(curve.adjust(128), 128);
        assert_eq!(curve.adjust(0), 0);
        assert_eq!(curve.adjust(255), 255);
    }

    #[test]
    fn negative_contrast_flattens_toward_mid_gray() {
        let curve = ToneCurve::new(-0.5, false);
        assert!(curve.adjust(0) > 0);
        assert!(curve.adjust(255) < 255);
        assert!(curve.adjust(64) > 64);
    }

    #[test]
    fn curve_is_monotonic_across_the_domain() {
        for contrast in [-0.5_f32, -0.2, 0.0, 0.1, 0.4, 0.8] {
            let curve = ToneCurve::new(contrast, false);
            for value in 1..=255_u8 {
                assert!(curve.adjust(value) >= curve.adjust(value - 1), "contrast={contrast}");
            }
        }
    }

    #[test]
    fn inversion_applies_after_contrast_and_leaves_color_alone() {
        let plain = ToneCurve::new(0.3, false).cell_tone(200, 40, 90);
        let inverted = ToneCurve::new(0.3, true).cell_tone(200, 40, 90);
        assert_eq!(inverted.brightness, 255 - plain.brightness);
        assert_eq!(inverted.level, 255.0 - plain.level);
        assert_eq!(inverted.rgb, plain.rgb);
    }

    #[test]
    fn level_keeps_the_fraction_that_rounding_drops() {
        let curve = ToneCurve::new(0.1, false);
        let factor = contrast_factor(0.1);
        for value in 0..=255_u8 {
            let expected = (factor * (f32::from(value) - MID_GRAY) + MID_GRAY).clamp(0.0, 255.0);
            assert_eq!(curve.level(value), expected);
            assert_eq!(curve.adjust(value), expected.round() as u8);
        }
        // 215.85 rounds up to 216.
        assert!(curve.level(200) < f32::from(curve.adjust(200)));
    }
}
