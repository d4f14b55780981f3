// The track transport's nonstandard base62 layer
//
// Each symbol carries a 6-bit value, except values whose bits 1..4 are all
// set (30 and 31 after masking) which carry only 5. Bits are written
// LSB-first into the output stream; the spill into the following byte is
// suppressed for the final symbol so the tail stays zero-padded.

use super::TrackError;

pub(crate) const ALPHABET: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn symbol_value(byte: u8) -> Option<u8> {
    match byte {
        b'A'..=b'Z' => Some(byte - b'A'),
        b'a'..=b'z' => Some(byte - b'a' + 26),
        b'0'..=b'9' => Some(byte - b'0' + 52),
        _ => None,
    }
}

pub fn decode(input: &str) -> Result<Vec<u8>, TrackError> {
    let symbols = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(symbols.len() * 6 / 8 + 1);
    let mut bit_pos = 0usize;

    for (position, &symbol) in symbols.iter().enumerate() {
        let value = symbol_value(symbol).ok_or(TrackError::InvalidBase62 {
            position,
            byte: symbol,
        })?;
        let bits = if value & 30 == 30 { 5 } else { 6 };

        let byte_index = bit_pos / 8;
        let offset = bit_pos % 8;
        if byte_index >= out.len() {
            out.push(0);
        }
        out[byte_index] |= value << offset;

        let is_last = position == symbols.len() - 1;
        if offset > 8 - bits && !is_last {
            if byte_index + 1 >= out.len() {
                out.push(0);
            }
            out[byte_index + 1] |= value >> (8 - offset);
        }

        bit_pos += bits;
    }

    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::ALPHABET;

    /// Inverse of `decode`, used to build pipeline fixtures. Takes 6 bits at
    /// a time LSB-first; when the low five bits are 30 or 31 only those five
    /// are consumed, mirroring the decoder's variable-width rule.
    pub(crate) fn encode(data: &[u8]) -> String {
        let total_bits = data.len() * 8;
        let mut out = String::new();
        let mut bit_pos = 0usize;

        while bit_pos < total_bits {
            let mut value = 0u8;
            for bit in 0..6 {
                let index = bit_pos + bit;
                if index < total_bits {
                    value |= ((data[index / 8] >> (index % 8)) & 1) << bit;
                }
            }

            if value & 30 == 30 {
                out.push(ALPHABET[(value & 31) as usize] as char);
                bit_pos += 5;
            } else {
                out.push(ALPHABET[value as usize] as char);
                bit_pos += 6;
            }
        }

        out
    }
}
