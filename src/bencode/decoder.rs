use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use tracing::instrument;

/// Decodes a single bencode value from the start of `bytes`, returning the
/// value and the unconsumed remainder.
#[instrument(skip(bytes), level = "trace")]
pub fn decode(bytes: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    let mut pos = 0;
    let value = decode_next(bytes, &mut pos)?;
    Ok((value, &bytes[pos..]))
}

fn peek(bytes: &[u8], pos: usize) -> BencodeResult<u8> {
    bytes.get(pos).copied().ok_or(BencodeError::UnexpectedEoi)
}

/// Reads bytes from `bytes` starting at `*pos` until `delimiter` is found,
/// returning them (excluding the delimiter) as a UTF-8 string and advancing
/// `*pos` past the delimiter. Used for length prefixes and integer literals,
/// which are always ASCII digits.
fn read_until(bytes: &[u8], pos: &mut usize, delimiter: u8) -> BencodeResult<String> {
    let start = *pos;
    while peek(bytes, *pos)? != delimiter {
        *pos += 1;
    }
    let s = std::str::from_utf8(&bytes[start..*pos])
        .map_err(|e| BencodeError::InvalidFormat(format!("non-UTF8 characters in length/integer: {e}")))?
        .to_string();
    *pos += 1; // consume delimiter
    Ok(s)
}

/// Decodes a bencode string in the format `<length>:<data>`.
#[instrument(skip(bytes), level = "trace")]
pub fn decode_string(bytes: &[u8], pos: &mut usize) -> BencodeResult<Vec<u8>> {
    let length_str = read_until(bytes, pos, b':')?;
    let length = length_str.parse::<usize>().map_err(|_| BencodeError::InvalidStringLength)?;

    let end = pos.checked_add(length).ok_or(BencodeError::InvalidStringLength)?;
    if end > bytes.len() {
        return Err(BencodeError::UnexpectedEoi);
    }
    let s = bytes[*pos..end].to_vec();
    *pos = end;
    Ok(s)
}

/// Decodes a bencode integer in the format `i<number>e`.
#[instrument(skip(bytes), level = "trace")]
pub fn decode_integer(bytes: &[u8], pos: &mut usize) -> BencodeResult<i64> {
    if peek(bytes, *pos)? != b'i' {
        return Err(BencodeError::InvalidFormat("integer must start with 'i'".to_string()));
    }
    *pos += 1;

    let num_str = read_until(bytes, pos, b'e')?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let digits = num_str.strip_prefix('-').unwrap_or(&num_str);
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return Err(BencodeError::InvalidInteger);
    }

    num_str.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list in the format `l<items>e`.
#[instrument(skip(bytes), level = "trace")]
fn decode_list(bytes: &[u8], pos: &mut usize) -> BencodeResult<Vec<BencodeValue>> {
    if peek(bytes, *pos)? != b'l' {
        return Err(BencodeError::InvalidFormat("list must start with 'l'".to_string()));
    }
    *pos += 1;

    let mut list = Vec::new();
    while peek(bytes, *pos)? != b'e' {
        list.push(decode_next(bytes, pos)?);
    }
    *pos += 1; // consume 'e'

    Ok(list)
}

/// Decodes a bencode dictionary in the format `d<key><value>...e`. Keys must
/// be byte strings and must not repeat; both are decode-time errors.
#[instrument(skip(bytes), level = "trace")]
fn decode_dict(bytes: &[u8], pos: &mut usize) -> BencodeResult<Vec<(Vec<u8>, BencodeValue)>> {
    if peek(bytes, *pos)? != b'd' {
        return Err(BencodeError::InvalidFormat("dictionary must start with 'd'".to_string()));
    }
    *pos += 1;

    let mut dict: Vec<(Vec<u8>, BencodeValue)> = Vec::new();
    while peek(bytes, *pos)? != b'e' {
        if !peek(bytes, *pos)?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }

        let key = decode_string(bytes, pos)?;
        if dict.iter().any(|(k, _)| k == &key) {
            return Err(BencodeError::DuplicateKey);
        }

        let value = decode_next(bytes, pos)?;
        dict.push((key, value));
    }
    *pos += 1; // consume 'e'

    Ok(dict)
}

fn decode_next(bytes: &[u8], pos: &mut usize) -> BencodeResult<BencodeValue> {
    match peek(bytes, *pos)? {
        b'0'..=b'9' => decode_string(bytes, pos).map(BencodeValue::String),
        b'i' => decode_integer(bytes, pos).map(BencodeValue::Integer),
        b'l' => decode_list(bytes, pos).map(BencodeValue::List),
        b'd' => decode_dict(bytes, pos).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!("unexpected character: {}", other as char))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        let (value, rest) = decode(b"7:abcd fg").unwrap();
        assert_eq!(value, BencodeValue::String(b"abcd fg".to_vec()));
        assert_eq!(rest, b"");
    }

    #[test]
    fn decodes_integer() {
        let (value, rest) = decode(b"i1234e").unwrap();
        assert_eq!(value, BencodeValue::Integer(1234));
        assert_eq!(rest, b"");
    }

    #[test]
    fn decodes_list_of_mixed_values() {
        let (value, rest) = decode(b"li24e4:runai72ee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::Integer(24),
                BencodeValue::String(b"runa".to_vec()),
                BencodeValue::Integer(72),
            ])
        );
        assert_eq!(rest, b"");
    }

    #[test]
    fn decodes_nested_lists() {
        let (value, rest) = decode(b"lli1e3:runei1234ee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::List(vec![BencodeValue::Integer(1), BencodeValue::String(b"run".to_vec())]),
                BencodeValue::Integer(1234),
            ])
        );
        assert_eq!(rest, b"");
    }

    #[test]
    fn decodes_dict() {
        let (value, rest) = decode(b"d3:key5:valuee").unwrap();
        assert_eq!(
            value,
            BencodeValue::Dict(vec![(b"key".to_vec(), BencodeValue::String(b"value".to_vec()))])
        );
        assert_eq!(rest, b"");
    }

    #[test]
    fn rejects_non_string_dict_key() {
        let err = decode(b"di23ei45ee").unwrap_err();
        assert!(matches!(err, BencodeError::DictKeyNotString));
    }

    #[test]
    fn rejects_duplicate_dict_key() {
        let err = decode(b"d3:fooi1e3:fooi2ee").unwrap_err();
        assert!(matches!(err, BencodeError::DuplicateKey));
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode(b"i042e").is_err());
    }

    #[test]
    fn rejects_negative_zero_integer() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_unterminated_list() {
        assert!(decode(b"li1ei2e").is_err());
    }

    #[test]
    fn leaves_trailing_bytes_in_remainder() {
        let (_value, rest) = decode(b"i1ejunk").unwrap();
        assert_eq!(rest, b"junk");
    }
}
