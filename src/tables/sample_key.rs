//! Bit-packed composite sample key.
//!
//! Key parts are written most-significant-bit first within each byte and
//! may span byte boundaries at any bit offset. Two keys built from the same
//! parts in the same order are byte-for-byte identical, which is what makes
//! [`SampleKey::as_bytes`] usable as a hash-map key.

use thiserror::Error;

/// Widest key part supported, in bits.
pub const MAX_KEY_PART_BITS: u32 = 32;

/// Errors raised while writing key parts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key part of {bits} bits at offset {offset} exceeds key capacity of {capacity} bits")]
    CapacityExceeded {
        bits: u32,
        offset: usize,
        capacity: usize,
    },

    #[error("key part width {bits} exceeds 32 bits")]
    PartTooWide { bits: u32 },
}

/// Fixed-capacity bit-packed key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    bytes: Vec<u8>,
    capacity_bits: usize,
    used_bits: usize,
}

impl SampleKey {
    /// Creates a zeroed key able to hold `capacity_bits` bits.
    pub fn new(capacity_bits: usize) -> Self {
        Self {
            bytes: vec![0; capacity_bits.div_ceil(8)],
            capacity_bits,
            used_bits: 0,
        }
    }

    /// Appends `value`, masked to `bits` bits, at the cursor and advances it.
    pub fn add_key_part(&mut self, value: u32, bits: u32) -> Result<(), KeyError> {
        self.set_key_part(value, bits, self.used_bits)?;
        self.used_bits += bits as usize;
        Ok(())
    }

    /// Overwrites `bits` bits at `offset` with `value`. The cursor does not move.
    pub fn set_key_part(&mut self, value: u32, bits: u32, offset: usize) -> Result<(), KeyError> {
        if bits > MAX_KEY_PART_BITS {
            return Err(KeyError::PartTooWide { bits });
        }
        if offset + bits as usize > self.capacity_bits {
            return Err(KeyError::CapacityExceeded {
                bits,
                offset,
                capacity: self.capacity_bits,
            });
        }

        let value = mask(value, bits);
        let mut remaining = bits;
        let mut pos = offset;

        while remaining > 0 {
            let byte = pos / 8;
            let free = 8 - (pos % 8) as u32;
            let n = free.min(remaining);
            let shift = free - n;

            let chunk = ((value >> (remaining - n)) & low_bits(n)) as u8;
            let chunk_mask = (low_bits(n) as u8) << shift;

            self.bytes[byte] = (self.bytes[byte] & !chunk_mask) | (chunk << shift);

            remaining -= n;
            pos += n as usize;
        }

        Ok(())
    }

    /// Decodes consecutive parts from offset 0 using the given widths.
    ///
    /// Decoding stops at the first width that would read past the key
    /// capacity, so the result may be shorter than `widths`.
    pub fn get_key_parts(&self, widths: &[u32]) -> Vec<u32> {
        let mut parts = Vec::with_capacity(widths.len());
        let mut offset = 0usize;

        for &bits in widths {
            if bits > MAX_KEY_PART_BITS || offset + bits as usize > self.capacity_bits {
                break;
            }
            parts.push(self.read_bits(bits, offset));
            offset += bits as usize;
        }

        parts
    }

    /// Raw key bytes, used as the identity of a sample in tables.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bits written through [`add_key_part`](Self::add_key_part).
    pub fn len_bits(&self) -> usize {
        self.used_bits
    }

    /// Total bit capacity.
    pub fn capacity_bits(&self) -> usize {
        self.capacity_bits
    }

    fn read_bits(&self, bits: u32, offset: usize) -> u32 {
        let mut out = 0u32;
        let mut remaining = bits;
        let mut pos = offset;

        while remaining > 0 {
            let byte = pos / 8;
            let free = 8 - (pos % 8) as u32;
            let n = free.min(remaining);
            let shift = free - n;

            let chunk = (u32::from(self.bytes[byte]) >> shift) & low_bits(n);
            out = (out << n) | chunk;

            remaining -= n;
            pos += n as usize;
        }

        out
    }
}

#[inline]
fn low_bits(n: u32) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

#[inline]
fn mask(value: u32, bits: u32) -> u32 {
    value & low_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(parts: &[(u32, u32)]) -> SampleKey {
        let total: u32 = parts.iter().map(|(bits, _)| bits).sum();
        let mut key = SampleKey::new(total as usize);
        for &(bits, value) in parts {
            key.add_key_part(value, bits).expect("add key part");
        }
        key
    }

    #[test]
    fn test_add_and_get_key_parts() {
        let cases: &[&[(u32, u32)]] = &[
            &[(2, 1)],
            &[(15, 0x70a0)],
            &[(16, 0xf0a0)],
            &[(25, 0x1f0a0b1)],
            &[(24, 0xf0a0b1)],
            &[(4, 0xa), (4, 0xb)],
            &[(5, 0xa), (8, 0xab)],
            &[(5, 0xa), (16, 0xabba)],
            &[(5, 0xa), (32, 0xabbaacca)],
            &[(4, 0xa), (2, 0x2), (5, 0xc)],
            &[(4, 0xa), (8, 0x2), (9, 0xc), (9, 0xc)],
            &[(1, 0x1), (1, 0x0), (3, 0x5), (1, 0x1)],
        ];

        for parts in cases {
            let key = build(parts);
            let widths: Vec<u32> = parts.iter().map(|(bits, _)| *bits).collect();
            let values: Vec<u32> = parts.iter().map(|(_, value)| *value).collect();
            assert_eq!(key.get_key_parts(&widths), values, "parts {parts:?}");
        }
    }

    #[test]
    fn test_msb_first_layout() {
        let key = build(&[(4, 0xa), (4, 0xb)]);
        assert_eq!(key.as_bytes(), &[0xab]);

        let key = build(&[(1, 1), (8, 0xff)]);
        assert_eq!(key.as_bytes(), &[0xff, 0x80]);

        let key = build(&[(3, 0b101), (10, 0b11_0000_0001)]);
        assert_eq!(key.as_bytes(), &[0b1011_1000, 0b0000_1000]);
    }

    #[test]
    fn test_values_are_masked() {
        let mut key = SampleKey::new(12);
        key.add_key_part(0x1ff, 4).expect("add");
        key.add_key_part(0xfff, 8).expect("add");
        assert_eq!(key.get_key_parts(&[4, 8]), vec![0xf, 0xff]);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut key = SampleKey::new(10);
        key.add_key_part(1, 8).expect("add");
        let err = key.add_key_part(1, 3).unwrap_err();
        assert_eq!(
            err,
            KeyError::CapacityExceeded {
                bits: 3,
                offset: 8,
                capacity: 10
            }
        );
        assert_eq!(key.len_bits(), 8);
    }

    #[test]
    fn test_part_too_wide() {
        let mut key = SampleKey::new(64);
        assert_eq!(
            key.add_key_part(1, 33),
            Err(KeyError::PartTooWide { bits: 33 })
        );
    }

    #[test]
    fn test_set_key_part() {
        let mut key = SampleKey::new(100);
        key.add_key_part(11, 10).expect("add");
        key.add_key_part(12, 10).expect("add");
        key.add_key_part(13, 10).expect("add");
        assert_eq!(key.get_key_parts(&[10, 10, 10]), vec![11, 12, 13]);

        key.set_key_part(0xf1, 10, 0).expect("set");
        key.set_key_part(0xf2, 10, 10).expect("set");
        key.set_key_part(0xf4, 10, 20).expect("set");
        assert_eq!(key.get_key_parts(&[10, 10, 10]), vec![0xf1, 0xf2, 0xf4]);
        assert_eq!(key.len_bits(), 30);
    }

    #[test]
    fn test_set_key_part_keeps_neighbours() {
        let mut key = build(&[(3, 0b111), (7, 0b111_1111), (6, 0b11_1111)]);
        key.set_key_part(0, 7, 3).expect("set");
        assert_eq!(key.get_key_parts(&[3, 7, 6]), vec![0b111, 0, 0b11_1111]);
    }

    #[test]
    fn test_generated_parts_round_trip() {
        // Deterministic xorshift so failures are reproducible.
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..500 {
            let mut key = SampleKey::new(3000);
            let mut widths = Vec::new();
            let mut values = Vec::new();
            let mut used = 0usize;

            while used < 3000 - 32 * 3 {
                let bits = (next() % 32) as u32 + 1;
                let value = (next() as u32) & low_bits(bits);
                key.add_key_part(value, bits).expect("add");
                widths.push(bits);
                values.push(value);
                used += bits as usize;
            }

            assert_eq!(key.get_key_parts(&widths), values);
        }
    }

    #[test]
    fn test_get_key_parts_stops_at_capacity() {
        let key = build(&[(4, 3), (4, 5)]);
        assert_eq!(key.get_key_parts(&[4, 4, 4]), vec![3, 5]);
    }
}
