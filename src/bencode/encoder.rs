use super::BencodeResult;
use super::BencodeValue;
use std::io::Write;
use tracing::instrument;

/// Encodes a byte slice as a bencode string: `<length>:<data>`.
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an integer as a bencode integer: `i<number>e`.
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{i}e")?;
    Ok(())
}

/// Encodes a slice of values as a bencode list: `l<items>e`.
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary as `d<key><value>...e`, always re-sorting keys into
/// lexicographic byte order regardless of their insertion order. This is
/// what makes `encode(decode(info))` reproduce the tracker's info_hash even
/// when the source happened not to store keys in sorted order.
fn encode_dict<W: Write>(writer: &mut W, dict: &[(Vec<u8>, BencodeValue)]) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut entries: Vec<&(Vec<u8>, BencodeValue)> = dict.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in entries {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a [`BencodeValue`] into its bencode byte representation.
#[instrument(skip(writer, value), level = "trace")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning the encoded bytes directly.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder::decode;

    #[test]
    fn round_trips_fixture_values() {
        let cases: Vec<&[u8]> = vec![b"7:abcd fg", b"i1234e", b"li24e4:runai72ee", b"lli1e3:runei1234ee"];
        for case in cases {
            let (value, _) = decode(case).unwrap();
            let encoded = encode_to_vec(&value).unwrap();
            assert_eq!(encoded, case);
        }
    }

    #[test]
    fn sorts_dict_keys_on_encode() {
        let dict = BencodeValue::Dict(vec![
            (b"zebra".to_vec(), BencodeValue::Integer(1)),
            (b"apple".to_vec(), BencodeValue::Integer(2)),
        ]);
        let encoded = encode_to_vec(&dict).unwrap();
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn decode_then_encode_dict_reproduces_bytes_when_sorted() {
        let original: &[u8] = b"d6:lengthi1609039872e4:name7:foo.iso12:piece lengthi262144ee";
        let (value, _) = decode(original).unwrap();
        let encoded = encode_to_vec(&value).unwrap();
        assert_eq!(encoded, original);
    }
}
