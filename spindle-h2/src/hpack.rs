//! HPACK header compression (RFC 7541).
//!
//! Encoder and decoder share the static table and each keep their own
//! dynamic table. String literals are Huffman-coded whenever that is
//! shorter. Fields marked sensitive are sent as "never indexed" so neither
//! side (nor any intermediary) stores them.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::H2Error;
use crate::huffman;

/// Per-entry overhead in dynamic table accounting (RFC 7541 Section 4.1).
const ENTRY_OVERHEAD: usize = 32;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    /// Encode as "never indexed" (credentials, cookies).
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            sensitive: true,
            ..Self::new(name, value)
        }
    }

    /// Size for dynamic table and header list accounting.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

// -- Static table (RFC 7541 Appendix A), indexed from 1 --

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""), (":method", "GET"), (":method", "POST"), (":path", "/"),
    (":path", "/index.html"), (":scheme", "http"), (":scheme", "https"), (":status", "200"),
    (":status", "204"), (":status", "206"), (":status", "304"), (":status", "400"),
    (":status", "404"), (":status", "500"), ("accept-charset", ""), ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""), ("accept-ranges", ""), ("accept", ""), ("access-control-allow-origin", ""),
    ("age", ""), ("allow", ""), ("authorization", ""), ("cache-control", ""),
    ("content-disposition", ""), ("content-encoding", ""), ("content-language", ""), ("content-length", ""),
    ("content-location", ""), ("content-range", ""), ("content-type", ""), ("cookie", ""),
    ("date", ""), ("etag", ""), ("expect", ""), ("expires", ""),
    ("from", ""), ("host", ""), ("if-match", ""), ("if-modified-since", ""),
    ("if-none-match", ""), ("if-range", ""), ("if-unmodified-since", ""), ("last-modified", ""),
    ("link", ""), ("location", ""), ("max-forwards", ""), ("proxy-authenticate", ""),
    ("proxy-authorization", ""), ("range", ""), ("referer", ""), ("refresh", ""),
    ("retry-after", ""), ("server", ""), ("set-cookie", ""), ("strict-transport-security", ""),
    ("transfer-encoding", ""), ("user-agent", ""), ("vary", ""), ("via", ""),
    ("www-authenticate", ""),
];

/// Where a field was found in the combined index space.
enum Match {
    Full(usize),
    Name(usize),
    None,
}

fn static_match(field: &HeaderField) -> Match {
    let mut name_only = None;
    for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
        if name.as_bytes() == field.name {
            if value.as_bytes() == field.value {
                return Match::Full(i + 1);
            }
            name_only.get_or_insert(i + 1);
        }
    }
    name_only.map_or(Match::None, Match::Name)
}

// -- Dynamic table --

/// HPACK dynamic table (RFC 7541 Section 2.3.2), newest entry first.
#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Entry at a combined index (static table first).
    fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index.checked_sub(STATIC_TABLE.len() + 1)?)
    }

    fn insert(&mut self, field: HeaderField) {
        let size = field.size();
        if size > self.max_size {
            // An oversized entry empties the table (RFC 7541 Section 4.4).
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - size);
        self.size += size;
        self.entries.push_front(field);
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    fn find(&self, field: &HeaderField) -> Match {
        let base = STATIC_TABLE.len() + 1;
        let mut name_only = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == field.name {
                if entry.value == field.value {
                    return Match::Full(base + i);
                }
                name_only.get_or_insert(base + i);
            }
        }
        name_only.map_or(Match::None, Match::Name)
    }
}

// -- Primitive codecs (RFC 7541 Section 5) --

fn encode_int(dst: &mut BytesMut, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

fn decode_int(src: &mut &[u8], prefix_bits: u8) -> Result<usize, H2Error> {
    let (&first, rest) = src.split_first().ok_or(H2Error::CompressionError)?;
    *src = rest;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = src.split_first().ok_or(H2Error::CompressionError)?;
        *src = rest;
        let part = usize::from(byte & 0x7f)
            .checked_shl(shift)
            .filter(|_| shift < 28)
            .ok_or(H2Error::CompressionError)?;
        value = value.checked_add(part).ok_or(H2Error::CompressionError)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_string(dst: &mut BytesMut, data: &[u8]) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_int(dst, huffman_len, 7, 0x80);
        huffman::encode(data, dst);
    } else {
        encode_int(dst, data.len(), 7, 0x00);
        dst.extend_from_slice(data);
    }
}

fn decode_string(src: &mut &[u8]) -> Result<Bytes, H2Error> {
    let huffman = src.first().ok_or(H2Error::CompressionError)? & 0x80 != 0;
    let len = decode_int(src, 7)?;
    if src.len() < len {
        return Err(H2Error::CompressionError);
    }
    let (raw, rest) = src.split_at(len);
    *src = rest;
    if huffman {
        let mut out = Vec::with_capacity(len * 8 / 5);
        huffman::decode(raw, &mut out)?;
        Ok(out.into())
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

// -- Encoder --

/// HPACK encoder. Its table size follows the peer's
/// SETTINGS_HEADER_TABLE_SIZE.
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Size update to announce at the start of the next header block.
    pending_resize: Option<usize>,
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pending_resize: None,
        }
    }

    /// Shrink or grow the table; the change is signalled in the next block.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size != self.table.max_size {
            self.table.resize(size);
            self.pending_resize = Some(size);
        }
    }

    /// Encode one header block.
    pub fn encode(&mut self, headers: &[HeaderField], dst: &mut BytesMut) {
        if let Some(size) = self.pending_resize.take() {
            encode_int(dst, size, 5, 0x20);
        }
        for field in headers {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let found = match static_match(field) {
            Match::Full(i) => Match::Full(i),
            by_name => match self.table.find(field) {
                Match::Full(i) => Match::Full(i),
                Match::Name(i) if !matches!(by_name, Match::Name(_)) => Match::Name(i),
                _ => by_name,
            },
        };

        if field.sensitive {
            // Literal never indexed (Section 6.2.3).
            let name_index = match found {
                Match::Full(i) | Match::Name(i) => i,
                Match::None => 0,
            };
            encode_int(dst, name_index, 4, 0x10);
            if name_index == 0 {
                encode_string(dst, &field.name);
            }
            encode_string(dst, &field.value);
            return;
        }

        match found {
            Match::Full(index) => encode_int(dst, index, 7, 0x80),
            Match::Name(index) => {
                encode_int(dst, index, 6, 0x40);
                encode_string(dst, &field.value);
                self.table.insert(field.clone());
            }
            Match::None => {
                dst.put_u8(0x40);
                encode_string(dst, &field.name);
                encode_string(dst, &field.value);
                self.table.insert(field.clone());
            }
        }
    }
}

// -- Decoder --

/// HPACK decoder. `max_table_size` is our own SETTINGS_HEADER_TABLE_SIZE:
/// the peer may resize the table up to it, never beyond.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    max_table_size: usize,
    max_header_list_size: Option<usize>,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_table_size,
            max_header_list_size: None,
        }
    }

    /// Reject header blocks whose decoded size exceeds `limit`.
    pub fn set_max_header_list_size(&mut self, limit: Option<usize>) {
        self.max_header_list_size = limit;
    }

    /// Decode one complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, H2Error> {
        let mut src = block;
        let mut headers = Vec::new();
        let mut list_size = 0usize;

        while let Some(&first) = src.first() {
            let field = if first & 0x80 != 0 {
                // Indexed (Section 6.1).
                let index = decode_int(&mut src, 7)?;
                self.lookup(index)?
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing (Section 6.2.1).
                let field = self.literal(&mut src, 6, false)?;
                self.table.insert(field.clone());
                field
            } else if first & 0x20 != 0 {
                // Size update (Section 6.3), only ahead of any field.
                if !headers.is_empty() {
                    return Err(H2Error::CompressionError);
                }
                let size = decode_int(&mut src, 5)?;
                if size > self.max_table_size {
                    return Err(H2Error::CompressionError);
                }
                self.table.resize(size);
                continue;
            } else {
                // Without indexing (0000) or never indexed (0001).
                self.literal(&mut src, 4, first & 0x10 != 0)?
            };

            list_size += field.size();
            if self.max_header_list_size.is_some_and(|limit| list_size > limit) {
                return Err(H2Error::CompressionError);
            }
            headers.push(field);
        }
        Ok(headers)
    }

    fn literal(&self, src: &mut &[u8], prefix_bits: u8, sensitive: bool) -> Result<HeaderField, H2Error> {
        let name_index = decode_int(src, prefix_bits)?;
        let name = if name_index == 0 {
            decode_string(src)?
        } else {
            self.lookup(name_index)?.name
        };
        let value = decode_string(src)?;
        Ok(HeaderField { name, value, sensitive })
    }

    fn lookup(&self, index: usize) -> Result<HeaderField, H2Error> {
        match index {
            0 => Err(H2Error::CompressionError),
            i if i <= STATIC_TABLE.len() => {
                let (name, value) = STATIC_TABLE[i - 1];
                Ok(HeaderField::new(Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes())))
            }
            i => self.table.get(i).cloned().ok_or(H2Error::CompressionError),
        }
    }
}
