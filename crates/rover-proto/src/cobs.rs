//! Consistent-overhead byte stuffing.
//!
//! Each group starts with a code byte giving the offset to the next zero in
//! the source (the zero itself is implied and not transmitted). A code of
//! `0xFF` introduces 254 literal bytes with no implied zero, so arbitrarily
//! long zero-free runs cost one extra byte per 254. The final group's implied
//! zero is dropped, and no empty group is opened after a full `0xFF` run at
//! the end of input.

use crate::MessageError;

/// Worst-case stuffed size for `len` source bytes.
pub const fn max_stuffed_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Stuff `src` into `dst`, returning the number of bytes written.
pub fn stuff(src: &[u8], dst: &mut [u8]) -> Result<usize, MessageError> {
    if dst.len() < max_stuffed_len(src.len()) {
        return Err(MessageError::BufferTooSmall);
    }
    let mut write = 1;
    let mut code_idx = 0;
    let mut code: u8 = 1;
    let mut open = true;
    for (i, &byte) in src.iter().enumerate() {
        if !open {
            code_idx = write;
            write += 1;
            code = 1;
            open = true;
        }
        if byte == 0 {
            dst[code_idx] = code;
            open = false;
            // A trailing source zero still needs an (empty) group to survive
            // the round trip.
            if i == src.len() - 1 {
                dst[write] = 1;
                write += 1;
            }
        } else {
            dst[write] = byte;
            write += 1;
            code += 1;
            if code == 0xFF {
                dst[code_idx] = code;
                open = false;
            }
        }
    }
    if open {
        dst[code_idx] = code;
    }
    Ok(write)
}

/// Unstuff `src` (without its delimiter) into `dst`, returning the number of
/// bytes written.
pub fn unstuff(src: &[u8], dst: &mut [u8]) -> Result<usize, MessageError> {
    let mut read = 0;
    let mut write = 0;
    while read < src.len() {
        let code = src[read] as usize;
        if code == 0 {
            return Err(MessageError::InvalidEncoding);
        }
        read += 1;
        if read + code - 1 > src.len() {
            return Err(MessageError::InvalidEncoding);
        }
        if write + code - 1 > dst.len() {
            return Err(MessageError::BufferTooSmall);
        }
        dst[write..write + code - 1].copy_from_slice(&src[read..read + code - 1]);
        read += code - 1;
        write += code - 1;
        if code < 0xFF && read < src.len() {
            if write >= dst.len() {
                return Err(MessageError::BufferTooSmall);
            }
            dst[write] = 0;
            write += 1;
        }
    }
    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(raw: &[u8]) -> Vec<u8> {
        let mut stuffed = vec![0u8; max_stuffed_len(raw.len())];
        let n = stuff(raw, &mut stuffed).unwrap();
        stuffed.truncate(n);
        assert!(!stuffed.contains(&0), "stuffed output must be zero-free");
        let mut out = vec![0u8; raw.len()];
        let m = unstuff(&stuffed, &mut out).unwrap();
        assert_eq!(m, raw.len());
        out
    }

    #[test]
    fn round_trips() {
        for raw in [
            &b"\x10\x00\x10"[..],
            b"\x00",
            b"\x00\x00\x00",
            b"\x01\x02\x03\x00",
            b"\x11\x04\x01\x00\x7b\x00\x6f",
        ] {
            assert_eq!(round_trip(raw), raw);
        }
        let long = vec![0xAAu8; 600];
        assert_eq!(round_trip(&long), long);
    }

    #[test]
    fn full_run_has_no_trailing_group() {
        // 254 zero-free bytes stuff to exactly one code byte plus the data.
        let raw = vec![0x41u8; 254];
        let mut stuffed = vec![0u8; max_stuffed_len(raw.len())];
        let n = stuff(&raw, &mut stuffed).unwrap();
        assert_eq!(n, 255);
        assert_eq!(stuffed[0], 0xFF);
    }

    #[test]
    fn truncated_input_is_invalid() {
        let mut out = [0u8; 300];
        assert_eq!(
            unstuff(&[0xFF], &mut out),
            Err(MessageError::InvalidEncoding)
        );
        assert_eq!(
            unstuff(&[0x05, 0x01], &mut out),
            Err(MessageError::InvalidEncoding)
        );
        assert_eq!(unstuff(&[0x00], &mut out), Err(MessageError::InvalidEncoding));
    }
}
