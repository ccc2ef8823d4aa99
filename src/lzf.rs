/*!
 * LZF Decompression
 *
 * Redis compresses large string values with LZF before writing them to the
 * snapshot. The stream is a sequence of control bytes:
 *
 * * `000LLLLL` - literal run, copy the next `L + 1` bytes verbatim
 * * `LLLOOOOO oooooooo` - back reference of length `L + 2` at distance
 *   `((O << 8) | o) + 1` from the end of the output
 * * `111OOOOO LLLLLLLL oooooooo` - same, with extended length `7 + L + 2`
 */

use crate::error::{Error, Result};

/// Decompress `input` into a buffer of exactly `expected_len` bytes
///
/// # Errors
/// * literal run or reference header running past the end of `input`
/// * back reference pointing before the start of the output
/// * output growing past, or stopping short of, `expected_len`
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut ip = 0;

    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;

        if ctrl < 32 {
            let run = ctrl + 1;
            if ip + run > input.len() {
                return Err(Error::format("lzf: literal run past end of input"));
            }
            if out.len() + run > expected_len {
                return Err(Error::format("lzf: output exceeds declared length"));
            }
            out.extend_from_slice(&input[ip..ip + run]);
            ip += run;
            continue;
        }

        let mut len = ctrl >> 5;
        if len == 7 {
            let ext = *input
                .get(ip)
                .ok_or_else(|| Error::format("lzf: truncated extended length"))?;
            len += ext as usize;
            ip += 1;
        }
        len += 2;

        let low = *input
            .get(ip)
            .ok_or_else(|| Error::format("lzf: truncated back reference"))?;
        ip += 1;
        let distance = (((ctrl & 0x1f) << 8) | low as usize) + 1;

        let start = out
            .len()
            .checked_sub(distance)
            .ok_or_else(|| Error::format("lzf: back reference out of range"))?;
        if out.len() + len > expected_len {
            return Err(Error::format("lzf: output exceeds declared length"));
        }

        // Overlapping copies are legal and produce runs.
        for i in 0..len {
            let b = out[start + i];
            out.push(b);
        }
    }

    if out.len() != expected_len {
        return Err(Error::format(format!(
            "lzf: decompressed {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}
