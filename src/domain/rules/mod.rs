// Domain rules - Bitrate policy and size estimation

use crate::domain::model::*;

/// Fixed mapping from quality preset to encoder target bitrate
pub struct BitratePolicy;

impl BitratePolicy {
    pub const HIGH: BitrateTarget = BitrateTarget(1_000_000);
    pub const MEDIUM: BitrateTarget = BitrateTarget(600_000);
    pub const LOW: BitrateTarget = BitrateTarget(400_000);

    /// Resolve the target bitrate for a preset
    pub fn resolve(preset: QualityPreset) -> BitrateTarget {
        match preset {
            QualityPreset::High => Self::HIGH,
            QualityPreset::Medium => Self::MEDIUM,
            QualityPreset::Low => Self::LOW,
        }
    }
}

/// Audio crosses from source to encoder as interleaved f32 stereo at 48 kHz
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: u16 = 2;
/// Audio track bitrate, on top of the video target
pub const AUDIO_BITRATE: BitrateTarget = BitrateTarget(64_000);

/// Expected output size in bytes for a source of known duration
pub fn estimate_output_size(bitrate: BitrateTarget, duration_secs: f64) -> u64 {
    bitrate.bytes_for(duration_secs)
}

#[cfg(test)]
mod tests;
