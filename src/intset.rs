/*!
 * Intset Decoding
 *
 * Layout: `<encoding u32><length u32><int>...`, all little endian. The
 * encoding is the byte width of every member.
 */

use crate::codec::Input;
use crate::error::{Error, Result};

/// Decode an intset into its members, rendered as decimal text
pub fn decode(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut input = Input::new(blob);
    let width = input.read_u32_le()?;
    let len = input.read_u32_le()? as usize;

    if !matches!(width, 2 | 4 | 8) {
        return Err(Error::format(format!("unknown intset encoding {}", width)));
    }
    if input.remaining() < len.saturating_mul(width as usize) {
        return Err(Error::format(format!(
            "intset declares {} members of {} bytes, blob holds {}",
            len,
            width,
            input.remaining()
        )));
    }

    let mut members = Vec::with_capacity(len);
    for _ in 0..len {
        let v: i64 = match width {
            2 => input.read_u16_le()? as i16 as i64,
            4 => input.read_u32_le()? as i32 as i64,
            _ => input.read_u64_le()? as i64,
        };
        members.push(v.to_string().into_bytes());
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(width: u32, values: &[i64]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes()[..width as usize]);
        }
        out
    }

    fn text(values: Vec<Vec<u8>>) -> Vec<String> {
        values
            .into_iter()
            .map(|v| String::from_utf8(v).unwrap())
            .collect()
    }

    #[test]
    fn all_widths() {
        assert_eq!(text(decode(&build(2, &[-2, 7])).unwrap()), vec!["-2", "7"]);
        assert_eq!(
            text(decode(&build(4, &[-70_000, 70_000])).unwrap()),
            vec!["-70000", "70000"]
        );
        assert_eq!(
            text(decode(&build(8, &[i64::MIN, i64::MAX])).unwrap()),
            vec![i64::MIN.to_string(), i64::MAX.to_string()]
        );
    }

    #[test]
    fn bad_width_fails() {
        assert!(matches!(decode(&build(3, &[])), Err(Error::Format(_))));
    }

    #[test]
    fn short_blob_fails() {
        let mut blob = build(4, &[1, 2]);
        blob.pop();
        assert!(decode(&blob).is_err());
    }
}
