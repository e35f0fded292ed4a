//! Length-delimited BER framing for LDAP messages.
//!
//! LDAP messages on the wire are a BER `SEQUENCE` (a single outer tag,
//! followed by a short- or long-form length, followed by exactly that many
//! content bytes). This module only concerns itself with finding the
//! boundary of one complete message inside a byte buffer; decoding the
//! content into a typed `LdapMsg` is the external codec's job (see
//! `crate::proto`).
//!
//! This mirrors the teacher's `Frame::check` / `Frame::parse` split: a cheap
//! pass determines whether enough bytes are buffered before any allocation
//! happens for the message itself.

use crate::error::FrameError;

/// Outcome of scanning a buffer for one complete BER TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Not enough bytes buffered yet to know the full message length.
    Incomplete,
    /// A complete message occupies `buf[..len]`.
    Complete(usize),
}

/// Scan `buf` for a complete length-delimited BER message.
///
/// Never consumes from `buf`; the caller decides when to advance past the
/// returned length. Never speculatively looks past the bytes belonging to
/// the current message.
pub(crate) fn scan(buf: &[u8]) -> Result<Scan, FrameError> {
    if buf.len() < 2 {
        return Ok(Scan::Incomplete);
    }

    let tag = buf[0];
    // LDAP's outer PDU is always a constructed SEQUENCE (tag 0x30). A
    // high-tag-number form (low 5 bits all set) never occurs here.
    if tag & 0x1f == 0x1f {
        return Err(FrameError::MalformedTag);
    }

    let first_len_byte = buf[1];
    if first_len_byte & 0x80 == 0 {
        // Short form: the byte itself is the length.
        let body_len = first_len_byte as usize;
        let total = 2 + body_len;
        return Ok(if buf.len() >= total {
            Scan::Complete(total)
        } else {
            Scan::Incomplete
        });
    }

    // Long form: low 7 bits count the following length octets.
    let num_len_bytes = (first_len_byte & 0x7f) as usize;
    // 0x80 alone is the indefinite-length form, which LDAP/DER framing never
    // uses; a count of 0 is therefore malformed. Cap at 8 bytes so a
    // maliciously large length field can't overflow `usize`.
    if num_len_bytes == 0 || num_len_bytes > 8 {
        return Err(FrameError::MalformedLength);
    }
    if buf.len() < 2 + num_len_bytes {
        return Ok(Scan::Incomplete);
    }

    let mut body_len: usize = 0;
    for &b in &buf[2..2 + num_len_bytes] {
        body_len = (body_len << 8) | b as usize;
    }

    let total = (2 + num_len_bytes)
        .checked_add(body_len)
        .ok_or(FrameError::MalformedLength)?;

    Ok(if buf.len() >= total {
        Scan::Complete(total)
    } else {
        Scan::Incomplete
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_length() {
        // SEQUENCE, length 2, two content bytes.
        let buf = [0x30, 0x02, 0x01, 0x01];
        assert_eq!(scan(&buf).unwrap(), Scan::Complete(4));
    }

    #[test]
    fn short_form_incomplete_body() {
        let buf = [0x30, 0x05, 0x01, 0x01];
        assert_eq!(scan(&buf).unwrap(), Scan::Incomplete);
    }

    #[test]
    fn incomplete_header() {
        assert_eq!(scan(&[0x30]).unwrap(), Scan::Incomplete);
        assert_eq!(scan(&[]).unwrap(), Scan::Incomplete);
    }

    #[test]
    fn long_form_length() {
        // length 0x81 0x82 => two length bytes follow, body length 0x0102 = 258
        let mut buf = vec![0x30, 0x82, 0x01, 0x02];
        buf.extend(std::iter::repeat(0u8).take(258));
        assert_eq!(scan(&buf).unwrap(), Scan::Complete(4 + 258));
    }

    #[test]
    fn long_form_incomplete_length_bytes() {
        // Claims 2 length bytes follow but only 1 is buffered.
        let buf = [0x30, 0x82, 0x01];
        assert_eq!(scan(&buf).unwrap(), Scan::Incomplete);
    }

    #[test]
    fn rejects_indefinite_length() {
        let buf = [0x30, 0x80, 0x00, 0x00];
        assert!(matches!(scan(&buf), Err(FrameError::MalformedLength)));
    }

    #[test]
    fn rejects_oversized_length_field() {
        let buf = [0x30, 0x89, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(scan(&buf), Err(FrameError::MalformedLength)));
    }

    #[test]
    fn rejects_high_tag_number_form() {
        let buf = [0x3f, 0x02, 0x01, 0x01];
        assert!(matches!(scan(&buf), Err(FrameError::MalformedTag)));
    }

    #[test]
    fn never_consumes_into_next_message() {
        // Two back-to-back short-form messages; scanning must stop at the
        // boundary of the first one.
        let buf = [0x30, 0x02, 0x01, 0x01, 0x30, 0x02, 0x02, 0x02];
        assert_eq!(scan(&buf).unwrap(), Scan::Complete(4));
    }
}
