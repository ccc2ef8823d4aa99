/*!
 * Zipmap Decoding
 *
 * Pre-2.6 small hash encoding:
 * `<zmlen><len>"field"<len><free>"value"[free bytes]...<0xFF>`.
 */

use crate::codec::Input;
use crate::error::{Error, Result};

const ZIPMAP_BIGLEN: u8 = 254;
const ZIPMAP_END: u8 = 255;

/// Decode a zipmap into field/value pairs
pub fn decode(blob: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut input = Input::new(blob);
    let declared = input.read_u8()?;
    let mut pairs = Vec::new();

    loop {
        let field_len = match read_len(&mut input)? {
            Some(n) => n,
            None => break,
        };
        let field = input.slice(field_len)?.to_vec();

        let value_len = read_len(&mut input)?
            .ok_or_else(|| Error::format("zipmap ended between field and value"))?;
        let free = input.read_u8()? as usize;
        let value = input.slice(value_len)?.to_vec();
        input.skip(free)?;

        pairs.push((field, value));
    }

    if declared < ZIPMAP_BIGLEN && pairs.len() != declared as usize {
        return Err(Error::format(format!(
            "zipmap declares {} pairs, found {}",
            declared,
            pairs.len()
        )));
    }
    Ok(pairs)
}

/// `None` marks the end of the map
fn read_len(input: &mut Input<'_>) -> Result<Option<usize>> {
    match input.read_u8()? {
        ZIPMAP_END => Ok(None),
        ZIPMAP_BIGLEN => Ok(Some(input.read_u32_le()? as usize)),
        n => Ok(Some(n as usize)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_with_free_space() {
        let blob = [
            2, // count
            1, b'a', 2, 1, b'1', b'0', 0xAA, // "a" => "10", one free byte
            1, b'b', 1, 0, b'x', // "b" => "x"
            0xFF,
        ];
        assert_eq!(
            decode(&blob).unwrap(),
            vec![
                (b"a".to_vec(), b"10".to_vec()),
                (b"b".to_vec(), b"x".to_vec())
            ]
        );
    }

    #[test]
    fn big_length_and_unknown_count() {
        let value = vec![b'v'; 300];
        let mut blob = vec![254, 1, b'k', 254];
        blob.extend_from_slice(&300u32.to_le_bytes());
        blob.push(0);
        blob.extend_from_slice(&value);
        blob.push(0xFF);
        let got = decode(&blob).unwrap();
        assert_eq!(got, vec![(b"k".to_vec(), value)]);
    }

    #[test]
    fn truncated_value_fails() {
        let blob = [1, 1, b'a', 5, 0, b'x'];
        assert!(matches!(decode(&blob), Err(Error::Format(_))));
    }
}
