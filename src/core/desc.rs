// On-media log descriptor: little-endian offset fields behind a thin
// encode/decode boundary so invariant checks run on host-order values.
use crate::core::error::{Error, ErrorKind};
use crate::core::pool::POOL_HDR_SIZE;

/// Alignment of the first usable data byte.
pub const DATA_ALIGN: usize = 4096;

/// Byte offset of the descriptor fields, immediately after the set header.
pub const DESC_OFF: usize = POOL_HDR_SIZE;

/// Encoded size of the three descriptor fields.
pub const DESC_LEN: usize = 24;

/// Offset of the `write_offset` field within the mapping. This is the single
/// word the append engine persists to commit an append.
pub const WRITE_OFF_FIELD: usize = DESC_OFF + 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogDesc {
    pub start_offset: u64,
    pub end_offset: u64,
    pub write_offset: u64,
}

impl LogDesc {
    /// Descriptor for a freshly created pool: empty, spanning the whole
    /// region past the header.
    pub fn new(pool_size: u64) -> Self {
        let start = data_start();
        Self {
            start_offset: start,
            end_offset: pool_size,
            write_offset: start,
        }
    }

    pub fn encode(&self) -> [u8; DESC_LEN] {
        let mut buf = [0u8; DESC_LEN];
        write_u64(&mut buf, 0, self.start_offset);
        write_u64(&mut buf, 8, self.end_offset);
        write_u64(&mut buf, 16, self.write_offset);
        buf
    }

    /// Read the descriptor out of a mapped pool. The pool-set layer
    /// guarantees every accepted mapping covers the descriptor block.
    pub fn read(map: &[u8]) -> Self {
        let buf = &map[DESC_OFF..DESC_OFF + DESC_LEN];
        Self {
            start_offset: read_u64(buf, 0),
            end_offset: read_u64(buf, 8),
            write_offset: read_u64(buf, 16),
        }
    }

    /// Fail-fast validation used on the open path. The checker runs the same
    /// checks but aggregates violations instead of stopping at the first.
    pub fn validate(&self, pool_size: u64) -> Result<(), Error> {
        if self.start_offset != data_start() || self.end_offset != pool_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "wrong start/end offsets (start: {} end: {}), pool size {}",
                self.start_offset, self.end_offset, pool_size
            )));
        }
        if self.start_offset > self.end_offset {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "start offset {} beyond end offset {}",
                self.start_offset, self.end_offset
            )));
        }
        if self.write_offset < self.start_offset || self.write_offset > self.end_offset {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "write offset outside usable range (start: {} end: {} write: {})",
                    self.start_offset, self.end_offset, self.write_offset
                ))
                .with_offset(self.write_offset));
        }
        Ok(())
    }
}

/// First byte offset usable for log data, fixed for a pool's lifetime.
pub fn data_start() -> u64 {
    round_up(DESC_OFF + DESC_LEN, DATA_ALIGN) as u64
}

pub fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{data_start, round_up, LogDesc, DESC_LEN, DESC_OFF};
    use crate::core::error::ErrorKind;

    #[test]
    fn rounding_is_alignment_sized() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn data_starts_past_header_and_descriptor() {
        let start = data_start() as usize;
        assert!(start >= DESC_OFF + DESC_LEN);
        assert_eq!(start % super::DATA_ALIGN, 0);
    }

    #[test]
    fn fresh_descriptor_is_empty() {
        let desc = LogDesc::new(4 * 1024 * 1024);
        assert_eq!(desc.start_offset, data_start());
        assert_eq!(desc.end_offset, 4 * 1024 * 1024);
        assert_eq!(desc.write_offset, desc.start_offset);
        desc.validate(4 * 1024 * 1024).expect("fresh descriptor");
    }

    #[test]
    fn encode_read_round_trip() {
        let desc = LogDesc::new(8 * 1024 * 1024);
        let mut map = vec![0u8; DESC_OFF + DESC_LEN];
        map[DESC_OFF..DESC_OFF + DESC_LEN].copy_from_slice(&desc.encode());
        assert_eq!(LogDesc::read(&map), desc);
    }

    #[test]
    fn encoded_fields_are_little_endian() {
        let desc = LogDesc {
            start_offset: 0x0102_0304_0506_0708,
            end_offset: 0,
            write_offset: 0,
        };
        let buf = desc.encode();
        assert_eq!(buf[0], 0x08);
        assert_eq!(buf[7], 0x01);
    }

    #[test]
    fn validate_rejects_wrong_start() {
        let mut desc = LogDesc::new(4 * 1024 * 1024);
        desc.start_offset += 8;
        desc.write_offset = desc.start_offset;
        let err = desc.validate(4 * 1024 * 1024).expect_err("wrong start");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn validate_rejects_end_mismatch() {
        let desc = LogDesc::new(4 * 1024 * 1024);
        let err = desc.validate(2 * 1024 * 1024).expect_err("wrong end");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn validate_rejects_write_offset_out_of_range() {
        let mut desc = LogDesc::new(4 * 1024 * 1024);
        desc.write_offset = desc.end_offset + 1;
        let err = desc.validate(4 * 1024 * 1024).expect_err("write beyond end");
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        desc.write_offset = desc.start_offset - 1;
        let err = desc.validate(4 * 1024 * 1024).expect_err("write before start");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
