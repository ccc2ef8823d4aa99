/*!
 * Listpack Decoding
 *
 * Layout: `<total_bytes u32><num_elements u16><entry>...<0xFF>`. Each entry is
 * `<encoding+data><backlen>`, where `backlen` stores the entry size backwards
 * so the structure can be walked from the tail. Forward decoding only needs
 * to know how many bytes to skip.
 */

use crate::codec::Input;
use crate::error::{Error, Result};

const LP_EOF: u8 = 0xFF;
const LP_STR32: u8 = 0xF0;
const LP_INT16: u8 = 0xF1;
const LP_INT24: u8 = 0xF2;
const LP_INT32: u8 = 0xF3;
const LP_INT64: u8 = 0xF4;
/// `num_elements` saturates here and the real count is only known by scanning
const LP_COUNT_UNKNOWN: u16 = u16::MAX;

/// Decode every entry of a listpack, integers rendered as decimal text
pub fn decode(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut input = Input::new(blob);
    let _total_bytes = input.read_u32_le()?;
    let count = input.read_u16_le()?;

    let mut entries = Vec::with_capacity(if count == LP_COUNT_UNKNOWN {
        0
    } else {
        count as usize
    });

    loop {
        let tag = input.read_u8()?;
        if tag == LP_EOF {
            break;
        }
        let (value, encoded_len) = read_entry(tag, &mut input)?;
        input.skip(backlen_size(encoded_len))?;
        entries.push(value);
    }

    if count != LP_COUNT_UNKNOWN && entries.len() != count as usize {
        return Err(Error::format(format!(
            "listpack declares {} entries, found {}",
            count,
            entries.len()
        )));
    }
    Ok(entries)
}

/// Decode a listpack of alternating field/value entries
pub fn decode_pairs(blob: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    crate::ziplist::into_pairs(decode(blob)?)
}

/// Width of the back-length trailer for an entry of `len` encoded bytes
pub fn backlen_size(len: usize) -> usize {
    if len <= 127 {
        1
    } else if len < 16383 {
        2
    } else if len < 2097151 {
        3
    } else if len < 268435455 {
        4
    } else {
        5
    }
}

/// Returns the rendered value and the encoded size (tag included)
fn read_entry(tag: u8, input: &mut Input<'_>) -> Result<(Vec<u8>, usize)> {
    if tag & 0x80 == 0 {
        return Ok((((tag & 0x7F) as i64).to_string().into_bytes(), 1));
    }
    if tag & 0xC0 == 0x80 {
        let len = (tag & 0x3F) as usize;
        return Ok((input.slice(len)?.to_vec(), 1 + len));
    }
    if tag & 0xE0 == 0xC0 {
        let low = input.read_u8()?;
        let raw = (((tag & 0x1F) as i64) << 8) | low as i64;
        let value = if raw >= 1 << 12 { raw - (1 << 13) } else { raw };
        return Ok((value.to_string().into_bytes(), 2));
    }
    if tag & 0xF0 == 0xE0 {
        let low = input.read_u8()?;
        let len = (((tag & 0x0F) as usize) << 8) | low as usize;
        return Ok((input.slice(len)?.to_vec(), 2 + len));
    }

    let (value, size): (i64, usize) = match tag {
        LP_STR32 => {
            let len = input.read_u32_le()? as usize;
            return Ok((input.slice(len)?.to_vec(), 5 + len));
        }
        LP_INT16 => (input.read_u16_le()? as i16 as i64, 3),
        LP_INT24 => {
            let b = input.slice(3)?;
            ((i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as i64, 4)
        }
        LP_INT32 => (input.read_u32_le()? as i32 as i64, 5),
        LP_INT64 => (input.read_u64_le()? as i64, 9),
        other => {
            return Err(Error::format(format!(
                "unknown listpack encoding 0x{:02x}",
                other
            )))
        }
    };
    Ok((value.to_string().into_bytes(), size))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Wrap pre-encoded entries (without backlen) into a listpack blob
    pub(crate) fn build(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for e in entries {
            body.extend_from_slice(e);
            let size = backlen_size(e.len());
            // The backlen bytes are never interpreted when decoding forwards.
            body.extend(std::iter::repeat(e.len().min(127) as u8).take(size));
        }
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() + 7) as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        out.push(LP_EOF);
        out
    }

    /// Encode a string entry choosing the narrowest form
    pub(crate) fn str_entry(s: &[u8]) -> Vec<u8> {
        let mut e = if s.len() < 64 {
            vec![0x80 | s.len() as u8]
        } else if s.len() < 4096 {
            vec![0xE0 | (s.len() >> 8) as u8, (s.len() & 0xFF) as u8]
        } else {
            let mut h = vec![LP_STR32];
            h.extend_from_slice(&(s.len() as u32).to_le_bytes());
            h
        };
        e.extend_from_slice(s);
        e
    }

    /// Encode an integer entry choosing the narrowest form
    pub(crate) fn int_entry(v: i64) -> Vec<u8> {
        if (0..=127).contains(&v) {
            vec![v as u8]
        } else if (-4096..4096).contains(&v) {
            let u = (v as u16) & 0x1FFF;
            vec![0xC0 | (u >> 8) as u8, (u & 0xFF) as u8]
        } else if i16::try_from(v).is_ok() {
            let mut e = vec![LP_INT16];
            e.extend_from_slice(&(v as i16).to_le_bytes());
            e
        } else if (-(1 << 23)..(1 << 23)).contains(&v) {
            let b = (v as i32).to_le_bytes();
            vec![LP_INT24, b[0], b[1], b[2]]
        } else if i32::try_from(v).is_ok() {
            let mut e = vec![LP_INT32];
            e.extend_from_slice(&(v as i32).to_le_bytes());
            e
        } else {
            let mut e = vec![LP_INT64];
            e.extend_from_slice(&v.to_le_bytes());
            e
        }
    }

    #[test]
    fn integer_widths() {
        let values = [
            0i64,
            127,
            -1,
            -4096,
            4095,
            -30_000,
            1 << 20,
            -(1 << 23),
            1 << 30,
            i64::MIN,
        ];
        let lp = build(&values.iter().map(|v| int_entry(*v)).collect::<Vec<_>>());
        let got: Vec<i64> = decode(&lp)
            .unwrap()
            .into_iter()
            .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
            .collect();
        assert_eq!(got, values);
    }

    #[test]
    fn string_classes() {
        let short = b"field".to_vec();
        let medium = vec![b'm'; 200];
        let large = vec![b'L'; 5000];
        let lp = build(&[str_entry(&short), str_entry(&medium), str_entry(&large)]);
        assert_eq!(decode(&lp).unwrap(), vec![short, medium, large]);
    }

    #[test]
    fn backlen_boundaries() {
        assert_eq!(backlen_size(1), 1);
        assert_eq!(backlen_size(127), 1);
        assert_eq!(backlen_size(128), 2);
        assert_eq!(backlen_size(16382), 2);
        assert_eq!(backlen_size(16383), 3);
        assert_eq!(backlen_size(2097151), 4);
        assert_eq!(backlen_size(268435455), 5);
    }

    #[test]
    fn missing_terminator_fails() {
        let mut lp = build(&[str_entry(b"a")]);
        lp.pop();
        assert!(matches!(decode(&lp), Err(Error::Format(_))));
    }

    #[test]
    fn count_mismatch_fails() {
        let mut lp = build(&[str_entry(b"a"), str_entry(b"b")]);
        lp[4] = 3;
        assert!(decode(&lp).is_err());
    }

    #[test]
    fn pairs() {
        let lp = build(&[str_entry(b"f"), int_entry(7)]);
        assert_eq!(
            decode_pairs(&lp).unwrap(),
            vec![(b"f".to_vec(), b"7".to_vec())]
        );
    }
}
