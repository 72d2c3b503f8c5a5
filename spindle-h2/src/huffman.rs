//! Huffman coding for HPACK string literals (RFC 7541 Appendix B).
//!
//! The HPACK code is canonical: codes of equal length are consecutive and
//! ordered by symbol. Only each symbol's bit length is stored; the codes
//! and the decoding tables are derived from the lengths on first use.

use std::sync::OnceLock;

use bytes::BufMut;

use crate::error::H2Error;

const EOS: u16 = 256;
const MAX_BITS: usize = 30;

/// Code length in bits for every byte value, then EOS.
static CODE_LENGTHS: [u8; 257] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    6, 10, 10, 12, 13, 6, 8, 11, 10, 10, 8, 11, 8, 6, 6, 6,
    5, 5, 5, 6, 6, 6, 6, 6, 6, 6, 7, 8, 15, 6, 12, 10,
    13, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 8, 7, 8, 13, 19, 13, 14, 6,
    15, 5, 6, 5, 6, 5, 6, 6, 6, 5, 7, 7, 6, 6, 6, 5,
    6, 7, 6, 5, 5, 6, 7, 7, 7, 7, 7, 15, 11, 14, 13, 28,
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23,
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24,
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23,
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23,
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25,
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27,
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23,
    26, 27, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26,
    30,
];

struct Tables {
    /// `(code, bits)` per symbol.
    codes: [(u32, u8); 257],
    /// Smallest code of each length.
    first_code: [u32; MAX_BITS + 1],
    /// Position in `symbols` of the first symbol of each length.
    first_index: [u16; MAX_BITS + 1],
    count: [u16; MAX_BITS + 1],
    /// Symbols ordered by (length, value).
    symbols: [u16; 257],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn build_tables() -> Tables {
    let mut count = [0u16; MAX_BITS + 1];
    for &len in CODE_LENGTHS.iter() {
        count[len as usize] += 1;
    }

    let mut first_code = [0u32; MAX_BITS + 1];
    let mut first_index = [0u16; MAX_BITS + 1];
    let mut code = 0u32;
    let mut index = 0u16;
    for len in 1..=MAX_BITS {
        first_code[len] = code;
        first_index[len] = index;
        code = (code + u32::from(count[len])) << 1;
        index += count[len];
    }

    let mut next_code = first_code;
    let mut next_index = first_index;
    let mut codes = [(0u32, 0u8); 257];
    let mut symbols = [0u16; 257];
    for (sym, &len) in CODE_LENGTHS.iter().enumerate() {
        let len = len as usize;
        codes[sym] = (next_code[len], len as u8);
        symbols[next_index[len] as usize] = sym as u16;
        next_code[len] += 1;
        next_index[len] += 1;
    }

    Tables {
        codes,
        first_code,
        first_index,
        count,
        symbols,
    }
}

/// Length of `data` once Huffman-encoded, in bytes.
pub(crate) fn encoded_len(data: &[u8]) -> usize {
    let bits: usize = data.iter().map(|&b| CODE_LENGTHS[b as usize] as usize).sum();
    bits.div_ceil(8)
}

/// Huffman-encode `data` into `out`, padding the last byte with the
/// leading bits of EOS.
pub(crate) fn encode(data: &[u8], out: &mut impl BufMut) {
    let codes = &tables().codes;
    let mut acc: u64 = 0;
    let mut pending = 0u32;
    for &byte in data {
        let (code, bits) = codes[byte as usize];
        acc = (acc << bits) | u64::from(code);
        pending += u32::from(bits);
        while pending >= 8 {
            pending -= 8;
            out.put_u8((acc >> pending) as u8);
        }
    }
    if pending > 0 {
        out.put_u8(((acc << (8 - pending)) as u8) | (0xff >> pending));
    }
}

/// Decode a Huffman-encoded string literal, appending to `out`.
pub(crate) fn decode(data: &[u8], out: &mut Vec<u8>) -> Result<(), H2Error> {
    let t = tables();
    let mut code = 0u32;
    let mut len = 0usize;
    for &byte in data {
        for shift in (0..8).rev() {
            code = (code << 1) | u32::from((byte >> shift) & 1);
            len += 1;
            let offset = code.wrapping_sub(t.first_code[len]);
            if offset < u32::from(t.count[len]) {
                let sym = t.symbols[t.first_index[len] as usize + offset as usize];
                if sym == EOS {
                    return Err(H2Error::CompressionError);
                }
                out.push(sym as u8);
                code = 0;
                len = 0;
            } else if len == MAX_BITS {
                return Err(H2Error::CompressionError);
            }
        }
    }
    // Whatever is left must be padding: under a byte of EOS prefix (all ones).
    if len > 7 || code != (1u32 << len) - 1 {
        return Err(H2Error::CompressionError);
    }
    Ok(())
}
