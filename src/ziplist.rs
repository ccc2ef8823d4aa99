/*!
 * Ziplist Decoding
 *
 * Layout: `<zlbytes u32><zltail u32><zllen u16><entry>...<0xFF>`. Every entry
 * starts with the byte length of the previous entry, which the decoder skips,
 * followed by an encoding byte that says whether a string or an integer
 * follows.
 */

use crate::codec::Input;
use crate::error::{Error, Result};

const ZIP_END: u8 = 0xFF;
const ZIP_BIG_PREVLEN: u8 = 0xFE;
/// `zllen` saturates at this value; the real count needs a scan
const ZIP_LEN_UNKNOWN: u16 = u16::MAX;

const ZIP_INT_16B: u8 = 0xC0;
const ZIP_INT_32B: u8 = 0xD0;
const ZIP_INT_64B: u8 = 0xE0;
const ZIP_INT_24B: u8 = 0xF0;
const ZIP_INT_8B: u8 = 0xFE;

/// Decode every entry of a ziplist
///
/// Integer entries are rendered as decimal text, so callers see a uniform
/// sequence of byte strings.
pub fn decode(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut input = Input::new(blob);
    let _zlbytes = input.read_u32_le()?;
    let _zltail = input.read_u32_le()?;
    let zllen = input.read_u16_le()?;

    let mut entries = if zllen == ZIP_LEN_UNKNOWN {
        Vec::new()
    } else {
        Vec::with_capacity(zllen as usize)
    };

    loop {
        if zllen != ZIP_LEN_UNKNOWN && entries.len() == zllen as usize {
            break;
        }
        let prevlen = input.read_u8()?;
        if prevlen == ZIP_END {
            if zllen == ZIP_LEN_UNKNOWN {
                return Ok(entries);
            }
            return Err(Error::format(format!(
                "ziplist ended after {} of {} entries",
                entries.len(),
                zllen
            )));
        }
        if prevlen == ZIP_BIG_PREVLEN {
            input.skip(4)?;
        }
        entries.push(read_entry(&mut input)?);
    }

    match input.read_u8()? {
        ZIP_END => Ok(entries),
        other => Err(Error::format(format!(
            "ziplist missing end marker, found 0x{:02x}",
            other
        ))),
    }
}

/// Decode a ziplist of alternating field/value entries
pub fn decode_pairs(blob: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    into_pairs(decode(blob)?)
}

pub(crate) fn into_pairs(entries: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if entries.len() % 2 != 0 {
        return Err(Error::format(format!(
            "expected an even number of entries, found {}",
            entries.len()
        )));
    }
    let mut it = entries.into_iter();
    let mut pairs = Vec::with_capacity(it.len() / 2);
    while let (Some(a), Some(b)) = (it.next(), it.next()) {
        pairs.push((a, b));
    }
    Ok(pairs)
}

fn read_entry(input: &mut Input<'_>) -> Result<Vec<u8>> {
    let enc = input.read_u8()?;
    match enc >> 6 {
        0 => return Ok(input.slice((enc & 0x3F) as usize)?.to_vec()),
        1 => {
            let low = input.read_u8()?;
            let len = (((enc & 0x3F) as usize) << 8) | low as usize;
            return Ok(input.slice(len)?.to_vec());
        }
        2 => {
            let len = input.read_u32_be()? as usize;
            return Ok(input.slice(len)?.to_vec());
        }
        _ => {}
    }

    let value: i64 = match enc {
        ZIP_INT_16B => {
            let b = input.slice(2)?;
            i16::from_le_bytes([b[0], b[1]]) as i64
        }
        ZIP_INT_32B => input.read_u32_le()? as i32 as i64,
        ZIP_INT_64B => input.read_u64_le()? as i64,
        ZIP_INT_24B => {
            let b = input.slice(3)?;
            // Sign-extend through the top byte of an i32.
            (i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as i64
        }
        ZIP_INT_8B => input.read_u8()? as i8 as i64,
        0xF1..=0xFD => ((enc & 0x0F) as i64) - 1,
        other => {
            return Err(Error::format(format!(
                "unknown ziplist encoding 0x{:02x}",
                other
            )))
        }
    };
    Ok(value.to_string().into_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Assemble a ziplist from raw encoded entries (encoding byte onwards)
    pub(crate) fn build(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut prev = 0usize;
        for e in entries {
            if prev < 254 {
                body.push(prev as u8);
            } else {
                body.push(0xFE);
                body.extend_from_slice(&(prev as u32).to_le_bytes());
            }
            body.extend_from_slice(e);
            prev = e.len();
        }
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() + 11) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        out.push(0xFF);
        out
    }

    pub(crate) fn str_entry(s: &[u8]) -> Vec<u8> {
        let mut e = vec![s.len() as u8];
        e.extend_from_slice(s);
        e
    }

    #[test]
    fn string_classes() {
        let medium = vec![b'm'; 300];
        let mut medium_entry = vec![0x40 | (300 >> 8) as u8, (300 & 0xFF) as u8];
        medium_entry.extend_from_slice(&medium);

        let large = vec![b'L'; 20_000];
        let mut large_entry = vec![0x80];
        large_entry.extend_from_slice(&(20_000u32).to_be_bytes());
        large_entry.extend_from_slice(&large);

        let zl = build(&[str_entry(b"hi"), medium_entry, large_entry]);
        let got = decode(&zl).unwrap();
        assert_eq!(got, vec![b"hi".to_vec(), medium, large]);
    }

    #[test]
    fn integer_widths() {
        let mut e16 = vec![ZIP_INT_16B];
        e16.extend_from_slice(&(-300i16).to_le_bytes());
        let mut e32 = vec![ZIP_INT_32B];
        e32.extend_from_slice(&(70_000i32).to_le_bytes());
        let mut e64 = vec![ZIP_INT_64B];
        e64.extend_from_slice(&(-5_000_000_000i64).to_le_bytes());
        let e24 = vec![ZIP_INT_24B, 0x00, 0x00, 0x80];
        let e8 = vec![ZIP_INT_8B, 0x80];
        let imm0 = vec![0xF1];
        let imm12 = vec![0xFD];

        let zl = build(&[e16, e32, e64, e24, e8, imm0, imm12]);
        let got: Vec<String> = decode(&zl)
            .unwrap()
            .into_iter()
            .map(|v| String::from_utf8(v).unwrap())
            .collect();
        assert_eq!(
            got,
            vec!["-300", "70000", "-5000000000", "-8388608", "-128", "0", "12"]
        );
    }

    #[test]
    fn large_prevlen_is_skipped() {
        let big = vec![b'x'; 260];
        let mut big_entry = vec![0x40 | (260 >> 8) as u8, (260 & 0xFF) as u8];
        big_entry.extend_from_slice(&big);
        let zl = build(&[big_entry, str_entry(b"after")]);
        assert_eq!(decode(&zl).unwrap()[1], b"after");
    }

    #[test]
    fn truncated_entry_fails() {
        let mut zl = build(&[str_entry(b"hello")]);
        zl.truncate(zl.len() - 3);
        assert!(matches!(decode(&zl), Err(Error::Format(_))));
    }

    #[test]
    fn odd_pairs_fail() {
        let zl = build(&[str_entry(b"a"), str_entry(b"1"), str_entry(b"b")]);
        assert!(decode_pairs(&zl).is_err());
    }
}
