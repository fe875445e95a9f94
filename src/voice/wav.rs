//! WAV encoding and container checks

use crate::{Error, Result};

/// Smallest buffer that can hold a RIFF header, a `fmt ` chunk and a `data` header
pub const MIN_WAV_LEN: usize = 44;

/// Wrap raw 16-bit little-endian mono PCM in a WAV container for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(pcm.len() + MIN_WAV_LEN));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;

        // A trailing odd byte is half a sample; drop it
        for frame in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([frame[0], frame[1]]))?;
        }

        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Convert raw 16-bit little-endian PCM to f32 samples in [-1.0, 1.0]
#[must_use]
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|frame| f32::from(i16::from_le_bytes([frame[0], frame[1]])) / 32768.0)
        .collect()
}

/// Check that `buf` holds a usable PCM WAV file
///
/// Walks the RIFF chunks (id + little-endian size, word aligned) until both a
/// valid `fmt ` chunk and a non-empty `data` chunk have been seen. Any chunk
/// that claims more bytes than the buffer holds rejects the file.
#[must_use]
pub fn is_valid_wav(buf: &[u8]) -> bool {
    if buf.len() < MIN_WAV_LEN || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return false;
    }

    let mut offset = 12;
    let mut fmt_ok = false;
    let mut data_ok = false;

    while offset + 8 <= buf.len() {
        let id = &buf[offset..offset + 4];
        let size = read_u32(buf, offset + 4) as usize;
        let body = offset + 8;

        let Some(end) = body.checked_add(size) else {
            return false;
        };
        if end > buf.len() {
            return false;
        }

        match id {
            b"fmt " => {
                if !valid_format(&buf[body..end]) {
                    return false;
                }
                fmt_ok = true;
            }
            b"data" => {
                if size == 0 {
                    return false;
                }
                data_ok = true;
            }
            _ => {}
        }

        if fmt_ok && data_ok {
            return true;
        }

        // Chunks are word aligned
        offset = end + (size & 1);
    }

    false
}

fn valid_format(fmt: &[u8]) -> bool {
    if fmt.len() < 16 {
        return false;
    }

    let encoding = read_u16(fmt, 0);
    let channels = read_u16(fmt, 2);
    let sample_rate = read_u32(fmt, 4);
    let bits = read_u16(fmt, 14);

    // PCM, IEEE float, or WAVE_FORMAT_EXTENSIBLE
    matches!(encoding, 1 | 3 | 0xFFFE)
        && (1..=2).contains(&channels)
        && (8000..=96_000).contains(&sample_rate)
        && matches!(bits, 8 | 16 | 24 | 32)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Ensure a recording is a usable WAV file
///
/// # Errors
///
/// Returns `Error::Audio` describing why the container was rejected
pub fn check_wav(buf: &[u8]) -> Result<()> {
    if is_valid_wav(buf) {
        Ok(())
    } else {
        Err(Error::Audio(format!(
            "invalid WAV container ({} bytes)",
            buf.len()
        )))
    }
}
