//! Colorspace descriptions and conversion helpers.
//!
//! Video frames arrive tagged with a colorimetric description (matrix
//! coefficients, signal range, primaries, transfer function). The renderer
//! needs these both to pick shader constants and to choose swapchain
//! formats, so the enums here mirror the values seen in common containers
//! and expose the stringly names used by configuration surfaces.

use std::f64::consts::PI;

/// YCbCr-to-RGB matrix family (or an RGB-like passthrough).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorSystem {
    #[default]
    Unknown,
    Bt601,
    Bt709,
    Smpte240m,
    Bt2020Ncl,
    Bt2020Cl,
    Rgb,
    Xyz,
    YCgCo,
}

impl ColorSystem {
    const NAMES: &'static [(&'static str, ColorSystem)] = &[
        ("auto", ColorSystem::Unknown),
        ("bt.601", ColorSystem::Bt601),
        ("bt.709", ColorSystem::Bt709),
        ("smpte-240m", ColorSystem::Smpte240m),
        ("bt.2020-ncl", ColorSystem::Bt2020Ncl),
        ("bt.2020-cl", ColorSystem::Bt2020Cl),
        ("rgb", ColorSystem::Rgb),
        ("xyz", ColorSystem::Xyz),
        ("ycgco", ColorSystem::YCgCo),
    ];

    pub fn name(self) -> &'static str {
        name_of(Self::NAMES, self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        from_name(Self::NAMES, name)
    }

    /// Whether decoded pixels are luma/chroma rather than RGB-like.
    pub fn is_ycbcr(self) -> bool {
        !matches!(self, ColorSystem::Rgb | ColorSystem::Xyz)
    }

    /// The primaries this system is normally paired with, for filling in
    /// untagged content.
    pub fn default_primaries(self) -> ColorPrimaries {
        match self {
            ColorSystem::Bt601 | ColorSystem::Smpte240m => ColorPrimaries::Bt601_625,
            ColorSystem::Bt2020Ncl | ColorSystem::Bt2020Cl => ColorPrimaries::Bt2020,
            _ => ColorPrimaries::Bt709,
        }
    }
}

/// Signal range of the coded values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorLevels {
    #[default]
    Unknown,
    /// Limited/TV range (16-235 for 8-bit luma).
    Limited,
    /// Full/PC range.
    Full,
}

impl ColorLevels {
    const NAMES: &'static [(&'static str, ColorLevels)] = &[
        ("auto", ColorLevels::Unknown),
        ("limited", ColorLevels::Limited),
        ("full", ColorLevels::Full),
    ];

    pub fn name(self) -> &'static str {
        name_of(Self::NAMES, self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        from_name(Self::NAMES, name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorPrimaries {
    #[default]
    Unknown,
    Bt601_525,
    Bt601_625,
    Bt709,
    Bt2020,
    Bt470m,
    Apple,
    Adobe,
    ProPhoto,
    Cie1931,
    DciP3,
    VGamut,
    SGamut,
}

impl ColorPrimaries {
    const NAMES: &'static [(&'static str, ColorPrimaries)] = &[
        ("auto", ColorPrimaries::Unknown),
        ("bt.601-525", ColorPrimaries::Bt601_525),
        ("bt.601-625", ColorPrimaries::Bt601_625),
        ("bt.709", ColorPrimaries::Bt709),
        ("bt.2020", ColorPrimaries::Bt2020),
        ("bt.470m", ColorPrimaries::Bt470m),
        ("apple", ColorPrimaries::Apple),
        ("adobe", ColorPrimaries::Adobe),
        ("prophoto", ColorPrimaries::ProPhoto),
        ("cie1931", ColorPrimaries::Cie1931),
        ("dci-p3", ColorPrimaries::DciP3),
        ("v-gamut", ColorPrimaries::VGamut),
        ("s-gamut", ColorPrimaries::SGamut),
    ];

    pub fn name(self) -> &'static str {
        name_of(Self::NAMES, self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        from_name(Self::NAMES, name)
    }

    /// Wide-gamut primaries want more than 8 bits per channel on output.
    pub fn is_wide_gamut(self) -> bool {
        matches!(
            self,
            ColorPrimaries::Bt2020
                | ColorPrimaries::ProPhoto
                | ColorPrimaries::DciP3
                | ColorPrimaries::VGamut
                | ColorPrimaries::SGamut
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorTransfer {
    #[default]
    Unknown,
    Bt1886,
    Srgb,
    Linear,
    Gamma18,
    Gamma22,
    Gamma28,
    ProPhoto,
    Pq,
    Hlg,
    VLog,
    SLog1,
    SLog2,
}

impl ColorTransfer {
    const NAMES: &'static [(&'static str, ColorTransfer)] = &[
        ("auto", ColorTransfer::Unknown),
        ("bt.1886", ColorTransfer::Bt1886),
        ("srgb", ColorTransfer::Srgb),
        ("linear", ColorTransfer::Linear),
        ("gamma1.8", ColorTransfer::Gamma18),
        ("gamma2.2", ColorTransfer::Gamma22),
        ("gamma2.8", ColorTransfer::Gamma28),
        ("prophoto", ColorTransfer::ProPhoto),
        ("pq", ColorTransfer::Pq),
        ("hlg", ColorTransfer::Hlg),
        ("v-log", ColorTransfer::VLog),
        ("s-log1", ColorTransfer::SLog1),
        ("s-log2", ColorTransfer::SLog2),
    ];

    pub fn name(self) -> &'static str {
        name_of(Self::NAMES, self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        from_name(Self::NAMES, name)
    }

    /// High-dynamic-range curves, signalling that presentation should use
    /// an HDR-capable surface format when available.
    pub fn is_hdr(self) -> bool {
        matches!(
            self,
            ColorTransfer::Pq
                | ColorTransfer::Hlg
                | ColorTransfer::VLog
                | ColorTransfer::SLog1
                | ColorTransfer::SLog2
        )
    }
}

/// Siting of subsampled chroma samples relative to luma.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaLocation {
    #[default]
    Unknown,
    /// MPEG-2/MPEG-4/H.264 style.
    Left,
    /// MPEG-1/JPEG style.
    Center,
}

impl ChromaLocation {
    const NAMES: &'static [(&'static str, ChromaLocation)] = &[
        ("unknown", ChromaLocation::Unknown),
        ("mpeg2/4/h264", ChromaLocation::Left),
        ("mpeg1/jpeg", ChromaLocation::Center),
    ];

    pub fn name(self) -> &'static str {
        name_of(Self::NAMES, self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        from_name(Self::NAMES, name)
    }
}

fn name_of<T: Copy + PartialEq>(table: &[(&'static str, T)], value: T) -> &'static str {
    table
        .iter()
        .find(|(_, v)| *v == value)
        .map(|(name, _)| *name)
        .unwrap_or("unknown")
}

fn from_name<T: Copy>(table: &[(&'static str, T)], name: &str) -> Option<T> {
    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, value)| *value)
}

/// Full colorimetric description of a frame.
///
/// Decoders leave fields unknown all the time; [`ColorRepr::guess_defaults`]
/// resolves them so everything downstream can rely on concrete values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorRepr {
    pub system: ColorSystem,
    pub levels: ColorLevels,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub chroma: ChromaLocation,
}

impl ColorRepr {
    /// A copy with every unknown field replaced by the conventional
    /// default: BT.709 for untagged video, limited range for YCbCr, full
    /// range for RGB, BT.1886 as the SDR curve.
    pub fn guess_defaults(mut self) -> Self {
        if self.system == ColorSystem::Unknown {
            self.system = ColorSystem::Bt709;
        }
        if self.levels == ColorLevels::Unknown {
            self.levels = if self.system.is_ycbcr() {
                ColorLevels::Limited
            } else {
                ColorLevels::Full
            };
        }
        if self.primaries == ColorPrimaries::Unknown {
            self.primaries = self.system.default_primaries();
        }
        if self.transfer == ColorTransfer::Unknown {
            self.transfer = ColorTransfer::Bt1886;
        }
        if self.chroma == ChromaLocation::Unknown {
            self.chroma = ChromaLocation::Left;
        }
        self
    }
}

/// User-facing color controls, normalized to renderer parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAdjustment {
    /// Additive luma offset, -1.0..=1.0, 0 neutral.
    pub brightness: f64,
    /// Multiplier, 0.0..=2.0, 1 neutral.
    pub contrast: f64,
    /// Rotation in radians, 0 neutral.
    pub hue: f64,
    /// Multiplier, 0.0..=2.0, 1 neutral.
    pub saturation: f64,
    /// Power curve, 1 neutral.
    pub gamma: f64,
}

impl Default for ColorAdjustment {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            hue: 0.0,
            saturation: 1.0,
            gamma: 1.0,
        }
    }
}

/// Integer-percent equalizer state, the form the controls take on option
/// surfaces. Every value ranges -100..=100 with 0 neutral.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Equalizer {
    pub brightness: i32,
    pub saturation: i32,
    pub contrast: i32,
    pub hue: i32,
    pub gamma: i32,
    /// Forced output range, when not `Unknown`.
    pub output_levels: ColorLevels,
}

impl Equalizer {
    pub fn adjustment(&self) -> ColorAdjustment {
        ColorAdjustment {
            brightness: self.brightness as f64 / 100.0,
            contrast: (self.contrast + 100) as f64 / 100.0,
            hue: self.hue as f64 / 100.0 * PI,
            saturation: (self.saturation + 100) as f64 / 100.0,
            // Maps -100..=100 onto 1/8..=8, exponentially.
            gamma: (8.0f64.ln() * self.gamma as f64 / 100.0).exp(),
        }
    }
}

/// An affine color transform: `out = matrix * in + offset`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorTransform {
    pub matrix: [[f64; 3]; 3],
    pub offset: [f64; 3],
}

impl ColorTransform {
    pub const IDENTITY: Self = Self {
        matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        offset: [0.0, 0.0, 0.0],
    };

    /// Applies the transform to a fixed-point triplet, rescaling from
    /// `in_bits` to `out_bits` of precision. For `in_bits == 8` the input
    /// range 0-255 maps to 0.0-1.0; output is clipped to the valid range.
    pub fn map_fixed_point(&self, in_bits: u32, input: [i32; 3], out_bits: u32) -> [i32; 3] {
        let in_scale = ((1i64 << in_bits) - 1) as f64;
        let out_max = (1i64 << out_bits) - 1;

        let mut output = [0i32; 3];
        for i in 0..3 {
            let mut value = self.offset[i];
            for x in 0..3 {
                value += self.matrix[i][x] * input[x] as f64 / in_scale;
            }
            let scaled = (value * out_max as f64).round() as i64;
            output[i] = scaled.clamp(0, out_max) as i32;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for &(name, system) in ColorSystem::NAMES {
            assert_eq!(ColorSystem::from_name(name), Some(system));
            assert_eq!(system.name(), name);
        }
        for &(name, primaries) in ColorPrimaries::NAMES {
            assert_eq!(ColorPrimaries::from_name(name), Some(primaries));
            assert_eq!(primaries.name(), name);
        }
        for &(name, transfer) in ColorTransfer::NAMES {
            assert_eq!(ColorTransfer::from_name(name), Some(transfer));
            assert_eq!(transfer.name(), name);
        }

        assert_eq!(ColorSystem::from_name("bt.2020-nonsense"), None);
        assert_eq!(ColorLevels::from_name("limited"), Some(ColorLevels::Limited));
    }

    #[test]
    fn guessing_fills_unknowns() {
        let untagged = ColorRepr::default().guess_defaults();
        assert_eq!(untagged.system, ColorSystem::Bt709);
        assert_eq!(untagged.levels, ColorLevels::Limited);
        assert_eq!(untagged.primaries, ColorPrimaries::Bt709);
        assert_eq!(untagged.transfer, ColorTransfer::Bt1886);

        let rgb = ColorRepr {
            system: ColorSystem::Rgb,
            ..Default::default()
        }
        .guess_defaults();
        assert_eq!(rgb.levels, ColorLevels::Full);

        let uhd = ColorRepr {
            system: ColorSystem::Bt2020Ncl,
            transfer: ColorTransfer::Pq,
            ..Default::default()
        }
        .guess_defaults();
        assert_eq!(uhd.primaries, ColorPrimaries::Bt2020);
        assert!(uhd.transfer.is_hdr());
        assert!(uhd.primaries.is_wide_gamut());
    }

    #[test]
    fn equalizer_neutral_and_extremes() {
        assert_eq!(Equalizer::default().adjustment(), ColorAdjustment::default());

        let cranked = Equalizer {
            brightness: 100,
            saturation: 100,
            contrast: 100,
            hue: 100,
            gamma: 100,
            output_levels: ColorLevels::Unknown,
        }
        .adjustment();
        assert!((cranked.brightness - 1.0).abs() < 1e-9);
        assert!((cranked.contrast - 2.0).abs() < 1e-9);
        assert!((cranked.hue - PI).abs() < 1e-9);
        assert!((cranked.saturation - 2.0).abs() < 1e-9);
        assert!((cranked.gamma - 8.0).abs() < 1e-9);

        let crushed = Equalizer {
            gamma: -100,
            ..Default::default()
        }
        .adjustment();
        assert!((crushed.gamma - 0.125).abs() < 1e-9);
    }

    #[test]
    fn fixed_point_mapping() {
        let identity = ColorTransform::IDENTITY;

        // Same depth: values pass through.
        assert_eq!(identity.map_fixed_point(8, [0, 128, 255], 8), [0, 128, 255]);

        // Depth expansion rescales to the new full-range maximum.
        assert_eq!(identity.map_fixed_point(8, [255, 0, 255], 10), [1023, 0, 1023]);

        // Out-of-range results clip instead of wrapping.
        let brighten = ColorTransform {
            matrix: ColorTransform::IDENTITY.matrix,
            offset: [0.5, -0.5, 0.0],
        };
        assert_eq!(brighten.map_fixed_point(8, [200, 50, 0], 8), [255, 0, 0]);
    }
}
