//! Recursive-descent Bencode decoder.
//!
//! Unlike a generic `Read`-based decoder, this one walks an in-memory byte
//! slice with an explicit cursor. That is what lets [`find_top_level_value_span`]
//! report the exact byte span of a nested value (the `info` dictionary of a
//! torrent file, in particular) without re-serializing anything.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single Bencode value starting at `data[0]`.
///
/// Returns the value and the number of bytes it consumed, so callers walking
/// a containing list or dictionary can advance their own cursor.
#[instrument(skip(data), level = "trace")]
pub fn decode(data: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    match data.first() {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_integer(data).map(|(v, n)| (BencodeValue::Integer(v), n)),
        Some(b'l') => decode_list(data).map(|(v, n)| (BencodeValue::List(v), n)),
        Some(b'd') => decode_dict(data).map(|(v, n)| (BencodeValue::Dict(v), n)),
        Some(b'0'..=b'9') => decode_string(data).map(|(v, n)| (BencodeValue::String(v), n)),
        Some(&c) => Err(BencodeError::InvalidFormat(format!(
            "unexpected leading byte '{}'",
            c as char
        ))),
    }
}

/// Decodes the full input as a single top-level value, erroring if trailing
/// bytes remain or the value is not a dictionary.
pub fn decode_top_level(data: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode(data)?;
    if consumed != data.len() {
        return Err(BencodeError::InvalidFormat(
            "trailing bytes after top-level value".to_string(),
        ));
    }
    if !matches!(value, BencodeValue::Dict(_)) {
        return Err(BencodeError::InvalidFormat(
            "top-level bencode value is not a dictionary".to_string(),
        ));
    }
    Ok(value)
}

/// Locates the byte span `[start, end)` of the value bound to `key` in the
/// top-level dictionary of `data`, without building the rest of the tree.
///
/// This is how the info-hash stays faithful to the source bytes: we never
/// reconstruct the `info` dictionary by re-encoding it, we just remember
/// where we saw it.
pub fn find_top_level_value_span(
    data: &[u8],
    key: &[u8],
) -> BencodeResult<Option<(usize, usize)>> {
    if data.first() != Some(&b'd') {
        return Err(BencodeError::InvalidFormat(
            "top-level bencode value is not a dictionary".to_string(),
        ));
    }
    let mut cursor = 1usize;
    loop {
        match data.get(cursor) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => return Ok(None),
            _ => {}
        }
        let (dict_key, key_len) = decode_string(&data[cursor..])?;
        cursor += key_len;
        let value_start = cursor;
        let (_, value_len) = decode(&data[cursor..])?;
        let value_end = value_start + value_len;
        if dict_key == key {
            return Ok(Some((value_start, value_end)));
        }
        cursor = value_end;
    }
}

fn decode_string(data: &[u8]) -> BencodeResult<(Vec<u8>, usize)> {
    let colon = data
        .iter()
        .position(|&b| b == b':')
        .ok_or(BencodeError::InvalidStringLength)?;
    let len_str =
        std::str::from_utf8(&data[..colon]).map_err(|_| BencodeError::InvalidStringLength)?;
    if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
        return Err(BencodeError::InvalidStringLength);
    }
    let length: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    let start = colon + 1;
    let end = start
        .checked_add(length)
        .ok_or(BencodeError::InvalidStringLength)?;
    let bytes = data.get(start..end).ok_or(BencodeError::UnexpectedEof)?;
    Ok((bytes.to_vec(), end))
}

/// Decodes `i<signed-decimal>e`, rejecting leading zeros and `-0` the way
/// the BitTorrent bencoding spec requires.
fn decode_integer(data: &[u8]) -> BencodeResult<(i64, usize)> {
    if data.first() != Some(&b'i') {
        return Err(BencodeError::InvalidFormat(
            "integer must start with 'i'".to_string(),
        ));
    }
    let end = data
        .iter()
        .position(|&b| b == b'e')
        .ok_or(BencodeError::UnexpectedEof)?;
    let num_str = std::str::from_utf8(&data[1..end]).map_err(|_| BencodeError::InvalidInteger)?;
    if num_str.is_empty()
        || num_str == "-0"
        || (num_str.len() > 1 && num_str.starts_with('0'))
        || (num_str.len() > 2 && num_str.starts_with("-0"))
    {
        return Err(BencodeError::InvalidInteger);
    }
    let value = num_str.parse().map_err(|_| BencodeError::InvalidInteger)?;
    Ok((value, end + 1))
}

fn decode_list(data: &[u8]) -> BencodeResult<(Vec<BencodeValue>, usize)> {
    if data.first() != Some(&b'l') {
        return Err(BencodeError::InvalidFormat(
            "list must start with 'l'".to_string(),
        ));
    }
    let mut cursor = 1usize;
    let mut items = Vec::new();
    loop {
        match data.get(cursor) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => return Ok((items, cursor + 1)),
            _ => {
                let (value, consumed) = decode(&data[cursor..])?;
                items.push(value);
                cursor += consumed;
            }
        }
    }
}

fn decode_dict(data: &[u8]) -> BencodeResult<(BTreeMap<Vec<u8>, BencodeValue>, usize)> {
    if data.first() != Some(&b'd') {
        return Err(BencodeError::InvalidFormat(
            "dictionary must start with 'd'".to_string(),
        ));
    }
    let mut cursor = 1usize;
    let mut map = BTreeMap::new();
    loop {
        match data.get(cursor) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => return Ok((map, cursor + 1)),
            _ => {
                let (key, key_len) = decode_string(&data[cursor..])?;
                cursor += key_len;
                let (value, value_len) = decode(&data[cursor..])?;
                cursor += value_len;
                map.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_negative_integer() {
        let (value, consumed) = decode(b"i-31e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-31));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn decodes_string() {
        let (value, consumed) = decode(b"4:spam").unwrap();
        assert_eq!(value, BencodeValue::String(b"spam".to_vec()));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode_integer(b"i012e").is_err());
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode_integer(b"i-0e").is_err());
    }

    #[test]
    fn decodes_nested_list_and_dict() {
        let (value, consumed) = decode(b"d3:fool4:spami42eee").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(consumed, 19);
        let list = dict.get(b"foo".as_slice()).unwrap().as_list().unwrap();
        assert_eq!(list[0], BencodeValue::String(b"spam".to_vec()));
        assert_eq!(list[1], BencodeValue::Integer(42));
    }

    #[test]
    fn finds_info_span_without_building_tree() {
        let data = b"d8:announce3:foo4:infod6:lengthi10eee";
        let (start, end) = find_top_level_value_span(data, b"info").unwrap().unwrap();
        assert_eq!(&data[start..end], b"d6:lengthi10ee");
    }

    #[test]
    fn invalid_pieces_length_error_message() {
        let err = BencodeError::InvalidPiecesLength(7);
        assert_eq!(
            err.to_string(),
            "pieces blob length 7 is not a multiple of 20"
        );
    }
}
