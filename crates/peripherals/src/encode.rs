//! NIST SP 800-185 string and integer encodings used by cSHAKE and KMAC.

/// `left_encode(x)`: byte count followed by the big-endian bytes of `x`.
#[must_use]
pub fn left_encode(value: u64) -> Vec<u8> {
    let bytes = minimal_be(value);
    let mut out = Vec::with_capacity(bytes.len() + 1);
    #[allow(clippy::cast_possible_truncation)]
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// `right_encode(x)`: big-endian bytes of `x` followed by the byte count.
#[must_use]
pub fn right_encode(value: u64) -> Vec<u8> {
    let mut out = minimal_be(value);
    #[allow(clippy::cast_possible_truncation)]
    out.push(out.len() as u8);
    out
}

/// `encode_string(s)`: `left_encode` of the bit length followed by `s`.
#[must_use]
pub fn encode_string(data: &[u8]) -> Vec<u8> {
    let mut out = left_encode(data.len() as u64 * 8);
    out.extend_from_slice(data);
    out
}

/// `bytepad(x, w)`: `left_encode(w) || x` zero-padded to a multiple of `w`.
#[must_use]
pub fn bytepad(data: &[u8], width: usize) -> Vec<u8> {
    let mut out = left_encode(width as u64);
    out.extend_from_slice(data);
    if width > 0 {
        let padded = out.len().div_ceil(width) * width;
        out.resize(padded, 0);
    }
    out
}

fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes a `left_encode` prefix, returning the value and the remaining bytes.
#[must_use]
pub fn left_decode(data: &[u8]) -> Option<(u64, &[u8])> {
    let (&len, rest) = data.split_first()?;
    let len = usize::from(len);
    if len == 0 || len > 8 || rest.len() < len {
        return None;
    }
    let value = rest[..len]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    Some((value, &rest[len..]))
}

/// Decodes an `encode_string`, returning the string and the remaining bytes.
#[must_use]
pub fn decode_string(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (bits, rest) = left_decode(data)?;
    if bits % 8 != 0 {
        return None;
    }
    let len = usize::try_from(bits / 8).ok()?;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Splits a trailing `right_encode(bits)` off a message.
///
/// Returns the message without the trailer and the encoded value.
#[must_use]
pub fn split_right_encoded(data: &[u8]) -> Option<(&[u8], u64)> {
    let (&len, rest) = data.split_last()?;
    let len = usize::from(len);
    if len == 0 || len > 8 || rest.len() < len {
        return None;
    }
    let (message, encoded) = rest.split_at(rest.len() - len);
    let value = encoded
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    Some((message, value))
}

#[cfg(test)]
mod tests {
    use super::{
        bytepad, decode_string, encode_string, left_decode, left_encode, right_encode,
        split_right_encoded,
    };

    #[test]
    fn integer_encodings_match_sp800_185() {
        assert_eq!(left_encode(0), vec![1, 0]);
        assert_eq!(left_encode(256), vec![2, 1, 0]);
        assert_eq!(right_encode(0), vec![0, 1]);
        assert_eq!(right_encode(512), vec![2, 0, 2]);
    }

    #[test]
    fn string_encoding_prefixes_bit_length() {
        assert_eq!(encode_string(b"KMAC"), vec![1, 32, b'K', b'M', b'A', b'C']);
        assert_eq!(encode_string(b""), vec![1, 0]);
    }

    #[test]
    fn bytepad_fills_to_width() {
        let padded = bytepad(&[0xAA], 8);
        assert_eq!(padded, vec![1, 8, 0xAA, 0, 0, 0, 0, 0]);
        assert_eq!(bytepad(&[0; 7], 4).len(), 12);
    }

    #[test]
    fn decoders_invert_encoders() {
        let mut prefix = encode_string(b"KMAC");
        prefix.extend(encode_string(b"custom"));
        let (name, rest) = decode_string(&prefix).unwrap();
        let (custom, tail) = decode_string(rest).unwrap();
        assert_eq!(name, b"KMAC");
        assert_eq!(custom, b"custom");
        assert!(tail.is_empty());
        assert_eq!(left_decode(&[2, 1, 0, 9]), Some((256, &[9u8][..])));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert_eq!(left_decode(&[]), None);
        assert_eq!(left_decode(&[0]), None);
        assert_eq!(left_decode(&[3, 1]), None);
        assert_eq!(decode_string(&[1, 12, 0xFF, 0xFF]), None);
        assert_eq!(split_right_encoded(&[5]), None);
    }

    #[test]
    fn trailer_split_recovers_output_length() {
        let mut message = b"abc".to_vec();
        message.extend(right_encode(256));
        assert_eq!(split_right_encoded(&message), Some((&b"abc"[..], 256)));
    }
}
