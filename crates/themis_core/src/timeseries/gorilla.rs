//! Gorilla-style chunk compression.
//!
//! Timestamps use delta-of-delta encoding with the classic bucket scheme
//! (`0`, `10`+7 bits, `110`+9 bits, `1110`+12 bits, `11110`+64 bits);
//! values use XOR encoding with a reusable leading/trailing-zero window.
//! A chunk is self-contained: header, then the bit stream.

use crate::error::{CoreError, CoreResult};

/// One decoded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Timestamp in milliseconds.
    pub ts_ms: u64,
    /// Sample value.
    pub value: f64,
}

const CHUNK_MAGIC: [u8; 4] = *b"TGOR";

/// Encodes samples into a compressed chunk.
///
/// Samples must be in strictly ascending timestamp order.
///
/// # Errors
///
/// Returns an error on an empty or unordered input, or NaN values.
pub fn encode_chunk(samples: &[Sample]) -> CoreResult<Vec<u8>> {
    if samples.is_empty() {
        return Err(CoreError::invalid_operation("chunk needs at least one sample"));
    }
    for pair in samples.windows(2) {
        if pair[1].ts_ms <= pair[0].ts_ms {
            return Err(CoreError::invalid_operation(
                "chunk samples must be strictly ascending",
            ));
        }
    }
    if samples.iter().any(|s| s.value.is_nan()) {
        return Err(CoreError::invalid_operation("NaN values are not encodable"));
    }

    let mut writer = BitWriter::new();
    let first = samples[0];

    let mut prev_ts = first.ts_ms;
    let mut prev_delta: i64 = 0;
    let mut prev_bits = first.value.to_bits();
    let mut prev_leading: u32 = u32::MAX; // no window yet
    let mut prev_trailing: u32 = 0;

    for sample in &samples[1..] {
        // Timestamp: delta of delta.
        #[allow(clippy::cast_possible_wrap)]
        let delta = (sample.ts_ms - prev_ts) as i64;
        let dod = delta - prev_delta;
        prev_ts = sample.ts_ms;
        prev_delta = delta;

        // Bucket bounds are zigzag-symmetric so each encoded value fits
        // its bit width exactly.
        if dod == 0 {
            writer.write_bits(0b0, 1);
        } else if (-64..=63).contains(&dod) {
            writer.write_bits(0b10, 2);
            writer.write_bits(zigzag(dod), 7);
        } else if (-256..=255).contains(&dod) {
            writer.write_bits(0b110, 3);
            writer.write_bits(zigzag(dod), 9);
        } else if (-2048..=2047).contains(&dod) {
            writer.write_bits(0b1110, 4);
            writer.write_bits(zigzag(dod), 12);
        } else {
            writer.write_bits(0b1111, 4);
            writer.write_bits(zigzag(dod), 64);
        }

        // Value: XOR against the previous value.
        let bits = sample.value.to_bits();
        let xor = bits ^ prev_bits;
        prev_bits = bits;

        if xor == 0 {
            writer.write_bits(0b0, 1);
            continue;
        }
        writer.write_bits(0b1, 1);

        let leading = xor.leading_zeros().min(31);
        let trailing = xor.trailing_zeros();

        if prev_leading != u32::MAX && leading >= prev_leading && trailing >= prev_trailing {
            // Reuse the previous window.
            writer.write_bits(0b0, 1);
            let sig = 64 - prev_leading - prev_trailing;
            writer.write_bits(xor >> prev_trailing, sig);
        } else {
            writer.write_bits(0b1, 1);
            let sig = 64 - leading - trailing;
            writer.write_bits(u64::from(leading), 5);
            // sig is in 1..=64; store as 6 bits with 64 wrapping to 0.
            writer.write_bits(u64::from(sig) & 0x3F, 6);
            writer.write_bits(xor >> trailing, sig);
            prev_leading = leading;
            prev_trailing = trailing;
        }
    }

    let stream = writer.into_bytes();
    let mut out = Vec::with_capacity(stream.len() + 32);
    out.extend_from_slice(&CHUNK_MAGIC);
    out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    out.extend_from_slice(&first.ts_ms.to_le_bytes());
    out.extend_from_slice(&first.value.to_bits().to_le_bytes());
    out.extend_from_slice(&stream);
    Ok(out)
}

/// Decodes a compressed chunk.
///
/// # Errors
///
/// Returns `BadEncoding`-style errors for malformed chunks.
pub fn decode_chunk(bytes: &[u8]) -> CoreResult<Vec<Sample>> {
    if bytes.len() < 4 + 4 + 8 + 8 {
        return Err(CoreError::invalid_operation("chunk too short"));
    }
    if bytes[0..4] != CHUNK_MAGIC {
        return Err(CoreError::invalid_operation("bad chunk magic"));
    }
    let count = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")) as usize;
    let first_ts = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
    let first_value = f64::from_bits(u64::from_le_bytes(
        bytes[16..24].try_into().expect("8 bytes"),
    ));

    let mut samples = Vec::with_capacity(count);
    samples.push(Sample {
        ts_ms: first_ts,
        value: first_value,
    });

    let mut reader = BitReader::new(&bytes[24..]);
    let mut prev_ts = first_ts;
    let mut prev_delta: i64 = 0;
    let mut prev_bits = first_value.to_bits();
    let mut prev_leading: u32 = u32::MAX;
    let mut prev_trailing: u32 = 0;

    for _ in 1..count {
        // Timestamp.
        let dod = if reader.read_bit()? == 0 {
            0
        } else if reader.read_bit()? == 0 {
            unzigzag(reader.read_bits(7)?)
        } else if reader.read_bit()? == 0 {
            unzigzag(reader.read_bits(9)?)
        } else if reader.read_bit()? == 0 {
            unzigzag(reader.read_bits(12)?)
        } else {
            unzigzag(reader.read_bits(64)?)
        };
        let delta = prev_delta + dod;
        if delta <= 0 {
            return Err(CoreError::invalid_operation("non-positive timestamp delta"));
        }
        #[allow(clippy::cast_sign_loss)]
        let ts_ms = prev_ts + delta as u64;
        prev_ts = ts_ms;
        prev_delta = delta;

        // Value.
        let bits = if reader.read_bit()? == 0 {
            prev_bits
        } else if reader.read_bit()? == 0 {
            if prev_leading == u32::MAX {
                return Err(CoreError::invalid_operation("window reuse before window"));
            }
            let sig = 64 - prev_leading - prev_trailing;
            let xor = reader.read_bits(sig)? << prev_trailing;
            prev_bits ^ xor
        } else {
            let leading = reader.read_bits(5)? as u32;
            let sig_raw = reader.read_bits(6)? as u32;
            let sig = if sig_raw == 0 { 64 } else { sig_raw };
            if leading + sig > 64 {
                return Err(CoreError::invalid_operation("invalid XOR window"));
            }
            let trailing = 64 - leading - sig;
            let xor = reader.read_bits(sig)? << trailing;
            prev_leading = leading;
            prev_trailing = trailing;
            prev_bits ^ xor
        };
        prev_bits = bits;
        samples.push(Sample {
            ts_ms,
            value: f64::from_bits(bits),
        });
    }

    Ok(samples)
}

#[allow(clippy::cast_sign_loss)]
fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

#[allow(clippy::cast_possible_wrap)]
fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_len: 0,
        }
    }

    fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for i in (0..count).rev() {
            let bit = (value >> i) & 1;
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            let byte = self.bytes.last_mut().expect("pushed above");
            *byte |= u8::try_from(bit).expect("single bit") << (7 - (self.bit_len % 8));
            self.bit_len += 1;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> CoreResult<u64> {
        let byte = self
            .bytes
            .get(self.pos / 8)
            .ok_or_else(|| CoreError::invalid_operation("chunk bit stream truncated"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(u64::from(bit))
    }

    fn read_bits(&mut self, count: u32) -> CoreResult<u64> {
        let mut out = 0u64;
        for _ in 0..count {
            out = (out << 1) | self.read_bit()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(samples: &[Sample]) {
        let encoded = encode_chunk(samples).unwrap();
        let decoded = decode_chunk(&encoded).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn single_sample() {
        roundtrip(&[Sample {
            ts_ms: 1_700_000_000_000,
            value: 42.5,
        }]);
    }

    #[test]
    fn regular_interval_constant_value() {
        // The sweet spot: dod = 0 and xor = 0 after the second sample.
        let samples: Vec<Sample> = (0..100)
            .map(|i| Sample {
                ts_ms: 1_700_000_000_000 + i * 10_000,
                value: 21.0,
            })
            .collect();
        let encoded = encode_chunk(&samples).unwrap();
        // Far smaller than the 16 bytes per raw sample.
        assert!(encoded.len() < samples.len() * 4);
        roundtrip(&samples);
    }

    #[test]
    fn jittered_interval_drifting_value() {
        let samples: Vec<Sample> = (0..200)
            .map(|i| Sample {
                ts_ms: 1_700_000_000_000 + i * 10_000 + (i % 7) * 13,
                value: 20.0 + (i as f64) * 0.01 + f64::from(i as u32 % 5) * 0.1,
            })
            .collect();
        roundtrip(&samples);
    }

    #[test]
    fn large_time_gaps() {
        let samples = vec![
            Sample { ts_ms: 1_000, value: 1.0 },
            Sample { ts_ms: 2_000, value: 2.0 },
            Sample { ts_ms: 10_000_000, value: 3.0 },
            Sample { ts_ms: 10_000_001, value: -4.0 },
        ];
        roundtrip(&samples);
    }

    #[test]
    fn extreme_values() {
        let samples = vec![
            Sample { ts_ms: 1, value: 0.0 },
            Sample { ts_ms: 2, value: f64::MAX },
            Sample { ts_ms: 3, value: f64::MIN_POSITIVE },
            Sample { ts_ms: 4, value: -0.0 },
            Sample { ts_ms: 5, value: f64::INFINITY },
        ];
        roundtrip(&samples);
    }

    #[test]
    fn unordered_rejected() {
        let samples = vec![
            Sample { ts_ms: 2, value: 1.0 },
            Sample { ts_ms: 1, value: 2.0 },
        ];
        assert!(encode_chunk(&samples).is_err());
        let dup = vec![
            Sample { ts_ms: 1, value: 1.0 },
            Sample { ts_ms: 1, value: 2.0 },
        ];
        assert!(encode_chunk(&dup).is_err());
    }

    #[test]
    fn empty_and_nan_rejected() {
        assert!(encode_chunk(&[]).is_err());
        assert!(encode_chunk(&[Sample {
            ts_ms: 1,
            value: f64::NAN
        }])
        .is_err());
    }

    #[test]
    fn truncated_chunk_rejected() {
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample {
                ts_ms: 1_000 + i * 100,
                value: i as f64 * 1.5,
            })
            .collect();
        let encoded = encode_chunk(&samples).unwrap();
        assert!(decode_chunk(&encoded[..10]).is_err());
        assert!(decode_chunk(b"junk").is_err());
    }
}
