//! WAV container repair
//!
//! Some recorder firmware streams raw PCM samples without a RIFF header.
//! The recorder never transmits format metadata, so a header is synthesized
//! from a configured [`AudioFormat`].

use serde::{Deserialize, Serialize};

/// Canonical PCM WAV header length
pub const HEADER_LEN: usize = 44;

/// Leading bytes of every RIFF container
pub const RIFF_MAGIC: &[u8; 4] = b"RIFF";

const WAVE_FORMAT_PCM: u16 = 1;

/// PCM layout assumed for headerless recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    pub fn block_align(&self) -> u16 {
        self.channels.saturating_mul(self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate.saturating_mul(u32::from(self.block_align()))
    }
}

/// Check if `data` already starts with a RIFF/WAVE header
pub fn has_header(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == RIFF_MAGIC && &data[8..12] == b"WAVE"
}

/// Build a 44-byte PCM header describing `data_len` bytes of samples
///
/// Lengths that do not fit the 32-bit RIFF size fields are saturated.
pub fn synthesize_header(data_len: usize, format: AudioFormat) -> [u8; HEADER_LEN] {
    let max_data = u32::MAX - 36;
    let data_len = u32::try_from(data_len).unwrap_or(max_data).min(max_data);

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(RIFF_MAGIC);
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    header[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Prepend a synthesized header unless one is already present
///
/// Returns the (possibly repaired) bytes and whether a header was added.
pub fn ensure_header(data: Vec<u8>, format: AudioFormat) -> (Vec<u8>, bool) {
    if has_header(&data) {
        return (data, false);
    }

    let mut repaired = Vec::with_capacity(HEADER_LEN + data.len());
    repaired.extend_from_slice(&synthesize_header(data.len(), format));
    repaired.extend(data);
    (repaired, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u32(bytes: &[u8]) -> u32 {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_synthesized_header_fields() {
        let header = synthesize_header(32_000, AudioFormat::default());

        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(le_u32(&header[4..8]), 36 + 32_000);
        assert_eq!(&header[8..16], b"WAVEfmt ");
        assert_eq!(le_u32(&header[24..28]), 16_000);
        assert_eq!(le_u32(&header[28..32]), 32_000);
        assert_eq!(u16::from_le_bytes([header[32], header[33]]), 2);
        assert_eq!(&header[36..40], b"data");
        assert_eq!(le_u32(&header[40..44]), 32_000);
    }

    #[test]
    fn test_raw_samples_get_header() {
        let samples = vec![0x11u8; 1000];
        let (repaired, added) = ensure_header(samples.clone(), AudioFormat::default());

        assert!(added);
        assert!(has_header(&repaired));
        assert_eq!(le_u32(&repaired[40..44]) as usize, samples.len());
        assert_eq!(&repaired[HEADER_LEN..], samples.as_slice());
    }

    #[test]
    fn test_existing_header_passes_through() {
        let mut wav = synthesize_header(4, AudioFormat::default()).to_vec();
        wav.extend([1, 2, 3, 4]);

        let (out, added) = ensure_header(wav.clone(), AudioFormat::default());
        assert!(!added);
        assert_eq!(out, wav);
    }

    #[test]
    fn test_empty_input_gets_empty_data_chunk() {
        let (out, added) = ensure_header(Vec::new(), AudioFormat::default());
        assert!(added);
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(le_u32(&out[40..44]), 0);
    }

    #[test]
    fn test_stereo_format() {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 24,
        };
        assert_eq!(format.block_align(), 6);
        assert_eq!(format.byte_rate(), 288_000);
    }
}
