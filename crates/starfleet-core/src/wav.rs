//! WAV encoding and audio math for push-to-talk recordings.
//!
//! Recordings are 16 kHz, 16-bit signed little-endian mono, the format
//! transcription models handle best.

/// Capture sample rate.
pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

const HEADER_LEN: usize = 44;

/// Milliseconds of audio represented by `sample_count` mono samples.
pub fn duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (sample_count as u64 * 1000) / u64::from(sample_rate)
}

/// RMS level of 16-bit PCM samples, normalized to 0.0–1.0.
pub fn compute_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Encode mono 16-bit samples as a canonical PCM WAV file.
pub fn write_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * u32::from(block_align);
    let data_len = (samples.len() * 2) as u32;

    let mut buf = Vec::with_capacity(HEADER_LEN + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(data_len + 36).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&CHANNELS.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}

/// Header fields of a PCM WAV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset where PCM data begins.
    pub data_offset: usize,
    /// Declared length of the data chunk.
    pub data_len: usize,
}

impl WavHeader {
    /// Playback length implied by the data chunk.
    pub fn duration_ms(&self) -> u64 {
        let frame = usize::from(self.channels) * usize::from(self.bits_per_sample / 8);
        if frame == 0 {
            return 0;
        }
        duration_ms(self.data_len / frame, self.sample_rate)
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse and validate a PCM WAV header, walking chunks until `data`.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, &'static str> {
    if buf.len() < 12 {
        return Err("too short for RIFF header");
    }
    if &buf[0..4] != b"RIFF" {
        return Err("missing RIFF tag");
    }
    if &buf[8..12] != b"WAVE" {
        return Err("missing WAVE tag");
    }

    let mut pos = 12;
    let mut format: Option<(u16, u32, u16)> = None;

    while pos + 8 <= buf.len() {
        let id = &buf[pos..pos + 4];
        let size = read_u32(buf, pos + 4) as usize;

        match id {
            b"fmt " => {
                if pos + 24 > buf.len() {
                    return Err("fmt chunk truncated");
                }
                if read_u16(buf, pos + 8) != 1 {
                    return Err("not PCM format");
                }
                format = Some((
                    read_u16(buf, pos + 10),
                    read_u32(buf, pos + 12),
                    read_u16(buf, pos + 22),
                ));
            }
            b"data" => {
                let (channels, sample_rate, bits_per_sample) =
                    format.ok_or("data chunk before fmt chunk")?;
                let available = buf.len() - (pos + 8);
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: pos + 8,
                    data_len: size.min(available),
                });
            }
            _ => {}
        }

        // chunks are word aligned
        pos += 8 + size + (size & 1);
    }

    Err("data chunk not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_capture_format() {
        let wav = write_wav(&[0i16; 100], SAMPLE_RATE);
        assert_eq!(wav.len(), 44 + 200);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32(&wav, 4), 236);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(read_u16(&wav, 22), 1);
        assert_eq!(read_u32(&wav, 24), 16_000);
        assert_eq!(read_u32(&wav, 28), 32_000);
        assert_eq!(read_u16(&wav, 32), 2);
        assert_eq!(read_u16(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(read_u32(&wav, 40), 200);
    }

    #[test]
    fn samples_are_little_endian() {
        let wav = write_wav(&[1, -2], SAMPLE_RATE);
        assert_eq!(&wav[44..], &[0x01, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn rms_levels() {
        assert_eq!(compute_rms(&[]), 0.0);
        assert_eq!(compute_rms(&[0; 1000]), 0.0);
        let rms = compute_rms(&[16384; 100]);
        assert!(rms > 0.49 && rms < 0.51, "rms={rms}");
    }

    #[test]
    fn duration_of_one_second() {
        assert_eq!(duration_ms(16_000, SAMPLE_RATE), 1000);
        assert_eq!(duration_ms(8_000, SAMPLE_RATE), 500);
        assert_eq!(duration_ms(10, 0), 0);
    }

    #[test]
    fn parse_round_trip_header() {
        let wav = write_wav(&[0i16; 1600], SAMPLE_RATE);
        let hdr = parse_wav_header(&wav).unwrap();
        assert_eq!(hdr.channels, 1);
        assert_eq!(hdr.sample_rate, 16_000);
        assert_eq!(hdr.bits_per_sample, 16);
        assert_eq!(hdr.data_offset, 44);
        assert_eq!(hdr.data_len, 3200);
        assert_eq!(hdr.duration_ms(), 100);
    }

    #[test]
    fn parse_skips_unknown_chunks() {
        let plain = write_wav(&[7i16; 4], 8000);
        let mut wav = plain[..36].to_vec();
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&3u32.to_le_bytes());
        wav.extend_from_slice(&[1, 2, 3, 0]); // odd size plus pad byte
        wav.extend_from_slice(&plain[36..]);
        let hdr = parse_wav_header(&wav).unwrap();
        assert_eq!(hdr.data_offset, 56);
        assert_eq!(hdr.sample_rate, 8000);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_wav_header(b"RIFF").is_err());
        let mut wav = write_wav(&[0i16; 10], SAMPLE_RATE);
        wav[0..4].copy_from_slice(b"NOPE");
        assert_eq!(parse_wav_header(&wav), Err("missing RIFF tag"));
    }

    #[test]
    fn parse_rejects_compressed_format() {
        let mut wav = write_wav(&[0i16; 10], SAMPLE_RATE);
        wav[20..22].copy_from_slice(&85u16.to_le_bytes()); // MPEG layer 3
        assert_eq!(parse_wav_header(&wav), Err("not PCM format"));
    }
}
