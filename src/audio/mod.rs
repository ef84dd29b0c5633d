//! Audio I/O through ALSA subprocesses, plus the echo-cancellation seam.

pub mod aec;
pub mod capture;
pub mod playback;

/// Decode little-endian 16-bit PCM bytes into samples. A trailing odd byte is
/// ignored.
pub fn pcm_bytes_to_i16(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}

/// Encode samples as little-endian 16-bit PCM bytes.
pub fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
