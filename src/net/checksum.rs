//! Internet checksum (RFC 1071)
//!
//! 16-bit one's complement of the one's complement sum of all 16-bit words.
//! IPv4 and ICMP checksum their own bytes; UDP and TCP prepend a 12-byte
//! pseudo-header (source, destination, zero, protocol, length) that is
//! summed but never transmitted.

use core::net::Ipv4Addr;

/// Running one's complement sum
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
}

impl Checksum {
    pub const fn new() -> Self {
        Self { sum: 0 }
    }

    /// Add bytes as big-endian 16-bit words.
    ///
    /// An odd trailing byte is padded with zero, so only the last chunk fed
    /// into a sum may have odd length.
    pub fn add_bytes(&mut self, data: &[u8]) {
        for chunk in data.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], 0])
            };
            self.add_word(word);
        }
    }

    pub fn add_word(&mut self, word: u16) {
        self.sum += word as u32;
        // Keep the carry bits small so long buffers never overflow
        if self.sum > 0xFFFF_0000 {
            self.fold();
        }
    }

    /// Add the TCP/UDP pseudo-header
    pub fn add_pseudo_header(&mut self, src: Ipv4Addr, dest: Ipv4Addr, protocol: u8, length: u16) {
        self.add_bytes(&src.octets());
        self.add_bytes(&dest.octets());
        self.add_word(protocol as u16);
        self.add_word(length);
    }

    fn fold(&mut self) {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// One's complement of the folded sum
    pub fn finish(mut self) -> u16 {
        self.fold();
        !(self.sum as u16)
    }
}

/// Checksum of `data` as-is
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_bytes(data);
    sum.finish()
}

/// Sum `data` treating the 16-bit field at `field` as zero
fn sum_excluding(sum: &mut Checksum, data: &[u8], field: usize) {
    debug_assert!(field % 2 == 0, "checksum field must be word aligned");
    for (index, chunk) in data.chunks(2).enumerate() {
        if index * 2 == field {
            continue;
        }
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum.add_word(word);
    }
}

fn stored(data: &[u8], field: usize) -> Option<u16> {
    let bytes = data.get(field..field + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Compute the checksum of `data` and write it at `field`
///
/// # Arguments
/// * `data` - Header (and payload) bytes
/// * `field` - Byte offset of the 16-bit checksum field
pub fn fill(data: &mut [u8], field: usize) {
    let mut sum = Checksum::new();
    sum_excluding(&mut sum, data, field);
    let value = sum.finish();
    if let Some(slot) = data.get_mut(field..field + 2) {
        slot.copy_from_slice(&value.to_be_bytes());
    }
}

/// Recompute the checksum with the field zeroed and compare against the
/// stored value.
pub fn verify(data: &[u8], field: usize) -> bool {
    let Some(expected) = stored(data, field) else {
        return false;
    };
    let mut sum = Checksum::new();
    sum_excluding(&mut sum, data, field);
    sum.finish() == expected
}

/// Like [`fill`], with the pseudo-header prepended
pub fn fill_with_pseudo_header(
    segment: &mut [u8],
    field: usize,
    src: Ipv4Addr,
    dest: Ipv4Addr,
    protocol: u8,
) {
    let mut sum = Checksum::new();
    sum.add_pseudo_header(src, dest, protocol, segment.len() as u16);
    sum_excluding(&mut sum, segment, field);
    let value = sum.finish();
    if let Some(slot) = segment.get_mut(field..field + 2) {
        slot.copy_from_slice(&value.to_be_bytes());
    }
}

/// Like [`verify`], with the pseudo-header prepended
pub fn verify_with_pseudo_header(
    segment: &[u8],
    field: usize,
    src: Ipv4Addr,
    dest: Ipv4Addr,
    protocol: u8,
) -> bool {
    let Some(expected) = stored(segment, field) else {
        return false;
    };
    let mut sum = Checksum::new();
    sum.add_pseudo_header(src, dest, protocol, segment.len() as u16);
    sum_excluding(&mut sum, segment, field);
    sum.finish() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ipv4_header() {
        // Example header from RFC 1071 discussions, checksum 0xB861
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        fill(&mut header, 10);
        assert_eq!(&header[10..12], &[0xB8, 0x61]);
        assert!(verify(&header, 10));
    }

    #[test]
    fn test_sum_including_checksum_is_zero() {
        let mut data = vec![0x08, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 0x01, 0x61, 0x62, 0x63];
        fill(&mut data, 2);
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn test_verify_rejects_short_buffer() {
        assert!(!verify(&[0x45], 10));
    }

    #[test]
    fn test_pseudo_header_round_trip() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dest = Ipv4Addr::new(10, 0, 0, 9);
        let mut segment = vec![0x30, 0x39, 0x00, 0x50, 0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0x10, 0x00, 0, 0, 0, 0];
        fill_with_pseudo_header(&mut segment, 16, src, dest, 6);
        assert!(verify_with_pseudo_header(&segment, 16, src, dest, 6));
        // Same bytes, different addresses
        assert!(!verify_with_pseudo_header(&segment, 16, src, Ipv4Addr::new(10, 0, 0, 8), 6));
    }
}
