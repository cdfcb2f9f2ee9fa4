//! Checksum algorithms shared with the peripheral firmware
//!
//! Two different checksums appear on the wire:
//!
//! - [`record_checksum`]: a 16-bit multiply-accumulate hash protecting the
//!   fixed-layout records (`HubMessage` relatives, `CameraMessage`,
//!   `ImageInfo`). The record's own checksum field is zeroed before the
//!   hash is computed over the full encoded record.
//! - [`payload_checksum`]: a 12-bit rolling hash protecting each 64-byte
//!   image payload, seeded with the payload's running packet index so a
//!   payload replayed at the wrong position also fails verification.

/// 16-bit record checksum.
///
/// Seed `0x61D209A2`; for every byte `acc = (acc + byte) * 0x7549C58F`
/// with wrapping arithmetic; the checksum is bits 16..32 of the result.
pub fn record_checksum(data: &[u8]) -> u16 {
    let mut acc: u32 = 0x61D2_09A2;
    for &b in data {
        acc = acc.wrapping_add(u32::from(b)).wrapping_mul(0x7549_C58F);
    }
    (acc >> 16) as u16
}

/// 12-bit image payload checksum, seeded by the payload's packet index.
pub fn payload_checksum(packet_index: u32, payload: &[u8]) -> u32 {
    let mut acc = packet_index;
    for &b in payload {
        acc = acc.wrapping_mul(41).wrapping_add(u32::from(b));
    }
    acc & 0xFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_checksum_is_deterministic() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(record_checksum(&data), record_checksum(&data));
    }

    #[test]
    fn record_checksum_detects_any_single_bit_flip() {
        let data: Vec<u8> = (0u8..24).collect();
        let reference = record_checksum(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(
                    record_checksum(&flipped),
                    reference,
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn payload_checksum_depends_on_index() {
        let payload = [0xAB; 64];
        assert_ne!(payload_checksum(1, &payload), payload_checksum(2, &payload));
    }

    #[test]
    fn payload_checksum_fits_in_12_bits() {
        let payload: Vec<u8> = (0u8..64).map(|b| b.wrapping_mul(37)).collect();
        for index in [0u32, 1, 2, 0xFFFFF] {
            assert!(payload_checksum(index, &payload) <= 0xFFF);
        }
    }
}
