use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_SIZE: usize = 16;

/// On-disk record header. Serialized little-endian regardless of
/// host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Must equal the metastore's `hdr_magic`.
    pub magic: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
    /// Payload length in bytes; the payload follows immediately.
    pub mlen: u32,
}

impl RecordHeader {
    pub fn new(magic: u32, mlen: u32, when: Option<SystemTime>) -> Self {
        let (tv_sec, tv_usec) = timestamp(when.unwrap_or_else(SystemTime::now));
        Self {
            magic,
            tv_sec,
            tv_usec,
            mlen,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tv_sec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tv_usec.to_le_bytes());
        buf[12..16].copy_from_slice(&self.mlen.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("slice length"));
        let tv_sec = u32::from_le_bytes(bytes[4..8].try_into().expect("slice length"));
        let tv_usec = u32::from_le_bytes(bytes[8..12].try_into().expect("slice length"));
        let mlen = u32::from_le_bytes(bytes[12..16].try_into().expect("slice length"));
        Self {
            magic,
            tv_sec,
            tv_usec,
            mlen,
        }
    }
}

fn timestamp(when: SystemTime) -> (u32, u32) {
    match when.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs() as u32, elapsed.subsec_micros()),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordHeader, HEADER_SIZE};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn encode_round_trip() {
        let hdr = RecordHeader {
            magic: 0x663a_7318,
            tv_sec: 1_700_000_000,
            tv_usec: 123_456,
            mlen: 9,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(RecordHeader::from_bytes(&bytes), hdr);
    }

    #[test]
    fn layout_is_little_endian() {
        let hdr = RecordHeader {
            magic: 0x0102_0304,
            tv_sec: 0,
            tv_usec: 0,
            mlen: 0x0a,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[12], 0x0a);
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let when = UNIX_EPOCH + Duration::new(42, 7_000);
        let hdr = RecordHeader::new(1, 0, Some(when));
        assert_eq!((hdr.tv_sec, hdr.tv_usec), (42, 7_000));
    }
}
