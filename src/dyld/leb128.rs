//! LEB128 decoding for export tries and fixup opcode streams.

use crate::{Error, Result};

/// Read a ULEB128 encoded unsigned integer, returns (value, bytes_consumed)
pub fn read_uleb128(data: &[u8], start_index: usize) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_consumed = 0;

    while let Some(&byte) = data.get(start_index.saturating_add(bytes_consumed)) {
        bytes_consumed += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_consumed));
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::MalformedBinary(format!(
                "uleb128 too big for uint64 at offset {}",
                start_index
            )));
        }
    }

    Err(Error::MalformedBinary(format!(
        "malformed uleb128 at offset {}",
        start_index
    )))
}

/// Read a SLEB128 encoded signed integer, returns (value, bytes_consumed)
pub fn read_sleb128(data: &[u8], start_index: usize) -> Result<(i64, usize)> {
    let mut result = 0i64;
    let mut shift = 0;
    let mut bytes_consumed = 0;

    while let Some(&byte) = data.get(start_index.saturating_add(bytes_consumed)) {
        bytes_consumed += 1;

        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            return Ok((result, bytes_consumed));
        }

        if shift >= 64 {
            return Err(Error::MalformedBinary(format!(
                "sleb128 too big for int64 at offset {}",
                start_index
            )));
        }
    }

    Err(Error::MalformedBinary(format!(
        "malformed sleb128 at offset {}",
        start_index
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb128_single_and_multi_byte() {
        assert_eq!(read_uleb128(&[0x10], 0).unwrap(), (0x10, 1));
        assert_eq!(read_uleb128(&[0xe5, 0x8e, 0x26], 0).unwrap(), (624485, 3));
        // Non-minimal encodings are accepted.
        assert_eq!(read_uleb128(&[0x88, 0x80, 0x00], 0).unwrap(), (8, 3));
    }

    #[test]
    fn uleb128_reads_from_offset() {
        let data = [0xff, 0xff, 0x7f, 0x01];
        assert_eq!(read_uleb128(&data, 3).unwrap(), (1, 1));
    }

    #[test]
    fn uleb128_truncated_is_malformed() {
        assert!(matches!(
            read_uleb128(&[0x80, 0x80], 0),
            Err(Error::MalformedBinary(_))
        ));
        assert!(matches!(read_uleb128(&[], 0), Err(Error::MalformedBinary(_))));
        assert!(matches!(read_uleb128(&[0x01], 5), Err(Error::MalformedBinary(_))));
    }

    #[test]
    fn uleb128_overflow_is_malformed() {
        let data = [0xff; 11];
        assert!(matches!(read_uleb128(&data, 0), Err(Error::MalformedBinary(_))));
    }

    #[test]
    fn uleb128_max_value() {
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(read_uleb128(&data, 0).unwrap(), (u64::MAX, 10));
    }

    #[test]
    fn sleb128_signs() {
        assert_eq!(read_sleb128(&[0x02], 0).unwrap(), (2, 1));
        assert_eq!(read_sleb128(&[0x7e], 0).unwrap(), (-2, 1));
        assert_eq!(read_sleb128(&[0x80, 0x7f], 0).unwrap(), (-128, 2));
        assert_eq!(read_sleb128(&[0xff, 0x00], 0).unwrap(), (127, 2));
    }

    #[test]
    fn sleb128_truncated_is_malformed() {
        assert!(matches!(read_sleb128(&[0xff], 0), Err(Error::MalformedBinary(_))));
    }
}
