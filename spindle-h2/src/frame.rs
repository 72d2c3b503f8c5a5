//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Payloads are carried as [`Bytes`] slices of the receive buffer, so
//! decoding DATA and header blocks does not copy.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, H2Error};
use crate::settings::Setting;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Decoded 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`, or `None` if fewer than
    /// nine bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut buf = buf.get(..FRAME_HEADER_LEN)?;
        Some(Self {
            length: buf.get_uint(3) as u32,
            frame_type: buf.get_u8(),
            flags: buf.get_u8(),
            stream_id: buf.get_u32() & STREAM_ID_MASK,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_uint(u64::from(self.length), 3);
        dst.put_u8(self.frame_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Stream dependency and weight (RFC 7540 Section 5.3). Parsed and
/// forwarded but not used for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn decode(buf: &mut impl Buf) -> Self {
        let raw = buf.get_u32();
        Self {
            exclusive: raw & !STREAM_ID_MASK != 0,
            dependency: raw & STREAM_ID_MASK,
            weight: buf.get_u8(),
        }
    }

    fn encode(&self, dst: &mut impl BufMut) {
        let exclusive = if self.exclusive { !STREAM_ID_MASK } else { 0 };
        dst.put_u32(self.dependency & STREAM_ID_MASK | exclusive);
        dst.put_u8(self.weight);
    }
}

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Bytes of padding (plus the pad-length octet) that were stripped.
        /// They count against flow control like data does.
        padding: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        opaque_data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Extension frame; ignored by the connection (RFC 7540 Section 4.1).
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

impl Frame {
    /// Stream the frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame (header and payload) into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.put_bytes(0, FRAME_HEADER_LEN);
        let (frame_type, flags, stream_id) = match self {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                padding: _,
            } => {
                dst.extend_from_slice(data);
                (FRAME_DATA, flag(*end_stream, FLAG_END_STREAM), *stream_id)
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = flag(*end_stream, FLAG_END_STREAM) | flag(*end_headers, FLAG_END_HEADERS);
                if let Some(p) = priority {
                    flags |= FLAG_PRIORITY;
                    p.encode(dst);
                }
                dst.extend_from_slice(block);
                (FRAME_HEADERS, flags, *stream_id)
            }
            Frame::Priority { stream_id, priority } => {
                priority.encode(dst);
                (FRAME_PRIORITY, 0, *stream_id)
            }
            Frame::RstStream { stream_id, error_code } => {
                dst.put_u32((*error_code).into());
                (FRAME_RST_STREAM, 0, *stream_id)
            }
            Frame::Settings { ack, params } => {
                for p in params {
                    p.encode(dst);
                }
                (FRAME_SETTINGS, flag(*ack, FLAG_ACK), 0)
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                dst.put_u32(promised_stream_id & STREAM_ID_MASK);
                dst.extend_from_slice(block);
                (FRAME_PUSH_PROMISE, flag(*end_headers, FLAG_END_HEADERS), *stream_id)
            }
            Frame::Ping { ack, opaque_data } => {
                dst.extend_from_slice(opaque_data);
                (FRAME_PING, flag(*ack, FLAG_ACK), 0)
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                dst.put_u32(last_stream_id & STREAM_ID_MASK);
                dst.put_u32((*error_code).into());
                dst.extend_from_slice(debug_data);
                (FRAME_GOAWAY, 0, 0)
            }
            Frame::WindowUpdate { stream_id, increment } => {
                dst.put_u32(increment & STREAM_ID_MASK);
                (FRAME_WINDOW_UPDATE, 0, *stream_id)
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                dst.extend_from_slice(block);
                (FRAME_CONTINUATION, flag(*end_headers, FLAG_END_HEADERS), *stream_id)
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                dst.extend_from_slice(payload);
                (*frame_type, *flags, *stream_id)
            }
        };
        let header = FrameHeader {
            length: (dst.len() - start - FRAME_HEADER_LEN) as u32,
            frame_type,
            flags,
            stream_id,
        };
        header.encode(&mut &mut dst[start..start + FRAME_HEADER_LEN]);
    }

    /// Decode a payload whose header has already been parsed. The payload
    /// length must equal `header.length`.
    pub fn decode(header: &FrameHeader, mut payload: Bytes) -> Result<Frame, H2Error> {
        let stream_id = header.stream_id;
        let on_stream = |name: &str| {
            if stream_id == 0 {
                Err(H2Error::ProtocolError(format!("{name} on stream 0")))
            } else {
                Ok(())
            }
        };
        let on_connection = |name: &str| {
            if stream_id != 0 {
                Err(H2Error::ProtocolError(format!("{name} on stream {stream_id}")))
            } else {
                Ok(())
            }
        };

        let frame = match header.frame_type {
            FRAME_DATA => {
                on_stream("DATA")?;
                let padding = strip_padding(header, &mut payload)?;
                Frame::Data {
                    stream_id,
                    data: payload,
                    end_stream: header.has(FLAG_END_STREAM),
                    padding,
                }
            }
            FRAME_HEADERS => {
                on_stream("HEADERS")?;
                strip_padding(header, &mut payload)?;
                let priority = if header.has(FLAG_PRIORITY) {
                    if payload.len() < 5 {
                        return Err(H2Error::FrameSizeError);
                    }
                    Some(Priority::decode(&mut payload))
                } else {
                    None
                };
                Frame::Headers {
                    stream_id,
                    block: payload,
                    end_stream: header.has(FLAG_END_STREAM),
                    end_headers: header.has(FLAG_END_HEADERS),
                    priority,
                }
            }
            FRAME_PRIORITY => {
                on_stream("PRIORITY")?;
                exact_len(&payload, 5)?;
                Frame::Priority {
                    stream_id,
                    priority: Priority::decode(&mut payload),
                }
            }
            FRAME_RST_STREAM => {
                on_stream("RST_STREAM")?;
                exact_len(&payload, 4)?;
                Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_u32(payload.get_u32()),
                }
            }
            FRAME_SETTINGS => {
                on_connection("SETTINGS")?;
                let ack = header.has(FLAG_ACK);
                if ack && !payload.is_empty() {
                    return Err(H2Error::FrameSizeError);
                }
                Frame::Settings {
                    ack,
                    params: Setting::decode_all(&payload)?,
                }
            }
            FRAME_PUSH_PROMISE => {
                on_stream("PUSH_PROMISE")?;
                strip_padding(header, &mut payload)?;
                if payload.len() < 4 {
                    return Err(H2Error::FrameSizeError);
                }
                Frame::PushPromise {
                    stream_id,
                    promised_stream_id: payload.get_u32() & STREAM_ID_MASK,
                    block: payload,
                    end_headers: header.has(FLAG_END_HEADERS),
                }
            }
            FRAME_PING => {
                on_connection("PING")?;
                exact_len(&payload, 8)?;
                let mut opaque_data = [0u8; 8];
                payload.copy_to_slice(&mut opaque_data);
                Frame::Ping {
                    ack: header.has(FLAG_ACK),
                    opaque_data,
                }
            }
            FRAME_GOAWAY => {
                on_connection("GOAWAY")?;
                if payload.len() < 8 {
                    return Err(H2Error::FrameSizeError);
                }
                Frame::GoAway {
                    last_stream_id: payload.get_u32() & STREAM_ID_MASK,
                    error_code: ErrorCode::from_u32(payload.get_u32()),
                    debug_data: payload,
                }
            }
            FRAME_WINDOW_UPDATE => {
                exact_len(&payload, 4)?;
                let increment = payload.get_u32() & STREAM_ID_MASK;
                if increment == 0 {
                    // Stream-scoped when it names a stream (RFC 7540 Section 6.9).
                    return Err(match stream_id {
                        0 => H2Error::ProtocolError("WINDOW_UPDATE with 0 increment".into()),
                        id => H2Error::StreamError(id, ErrorCode::ProtocolError),
                    });
                }
                Frame::WindowUpdate { stream_id, increment }
            }
            FRAME_CONTINUATION => {
                on_stream("CONTINUATION")?;
                Frame::Continuation {
                    stream_id,
                    block: payload,
                    end_headers: header.has(FLAG_END_HEADERS),
                }
            }
            frame_type => Frame::Unknown {
                frame_type,
                flags: header.flags,
                stream_id,
                payload,
            },
        };
        Ok(frame)
    }
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame has arrived.
pub fn decode_frame(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, H2Error> {
    let Some(header) = FrameHeader::decode(buf) else {
        return Ok(None);
    };
    if header.length > max_frame_size {
        return Err(H2Error::FrameSizeError);
    }
    let total = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut raw = buf.split_to(total);
    raw.advance(FRAME_HEADER_LEN);
    Frame::decode(&header, raw.freeze()).map(Some)
}

fn flag(set: bool, bit: u8) -> u8 {
    if set { bit } else { 0 }
}

fn exact_len(payload: &[u8], len: usize) -> Result<(), H2Error> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(H2Error::FrameSizeError)
    }
}

/// Remove the pad-length octet and trailing padding when PADDED is set.
/// Returns the number of bytes removed.
fn strip_padding(header: &FrameHeader, payload: &mut Bytes) -> Result<u32, H2Error> {
    if !header.has(FLAG_PADDED) {
        return Ok(0);
    }
    let Some(&pad_len) = payload.first() else {
        return Err(H2Error::FrameSizeError);
    };
    let pad_len = usize::from(pad_len);
    if pad_len >= payload.len() {
        return Err(H2Error::ProtocolError("padding exceeds payload".into()));
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad_len);
    Ok(pad_len as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    fn reparse(frame: &Frame) -> Frame {
        let mut buf = wire(frame);
        let decoded = decode_frame(&mut buf, 16_384).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader {
            length: 0x01_0203,
            frame_type: FRAME_HEADERS,
            flags: FLAG_END_HEADERS,
            stream_id: 0x8000_0005,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf, [1, 2, 3, 1, 4, 0, 0, 0, 5]);
        let parsed = FrameHeader::decode(&buf).unwrap();
        assert_eq!(parsed.stream_id, 5);
        assert_eq!(parsed.length, 0x01_0203);
        assert!(FrameHeader::decode(&buf[..8]).is_none());
    }

    #[test]
    fn frames_survive_the_wire() {
        let frames = [
            Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"hello"),
                end_stream: true,
                padding: 0,
            },
            Frame::Headers {
                stream_id: 3,
                block: Bytes::from_static(&[0x82, 0x86]),
                end_stream: false,
                end_headers: true,
                priority: Some(Priority {
                    exclusive: true,
                    dependency: 1,
                    weight: 255,
                }),
            },
            Frame::Settings {
                ack: false,
                params: vec![Setting::InitialWindowSize(1 << 20), Setting::EnablePush(false)],
            },
            Frame::GoAway {
                last_stream_id: 5,
                error_code: ErrorCode::EnhanceYourCalm,
                debug_data: Bytes::from_static(b"slow down"),
            },
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 1000,
            },
            Frame::Ping {
                ack: true,
                opaque_data: *b"spindle!",
            },
            Frame::RstStream {
                stream_id: 7,
                error_code: ErrorCode::Cancel,
            },
        ];
        for frame in &frames {
            assert_eq!(&reparse(frame), frame);
        }
    }

    #[test]
    fn partial_input_waits_for_more() {
        let full = wire(&Frame::Data {
            stream_id: 1,
            data: Bytes::from_static(b"abcdef"),
            end_stream: false,
            padding: 0,
        });
        let mut buf = BytesMut::from(&full[..12]);
        assert!(decode_frame(&mut buf, 16_384).unwrap().is_none());
        assert_eq!(buf.len(), 12);
        buf.extend_from_slice(&full[12..]);
        assert!(decode_frame(&mut buf, 16_384).unwrap().is_some());
    }

    #[test]
    fn padding_is_stripped_and_counted() {
        let header = FrameHeader {
            length: 8,
            frame_type: FRAME_DATA,
            flags: FLAG_PADDED,
            stream_id: 1,
        };
        let payload = Bytes::from_static(&[3, b'a', b'b', b'c', b'd', 0, 0, 0]);
        match Frame::decode(&header, payload).unwrap() {
            Frame::Data { data, padding, .. } => {
                assert_eq!(&data[..], b"abcd");
                assert_eq!(padding, 4);
            }
            other => panic!("expected DATA, got {other:?}"),
        }

        let too_much = Bytes::from_static(&[8, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Frame::decode(&header, too_much).is_err());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = wire(&Frame::Data {
            stream_id: 1,
            data: Bytes::from(vec![0; 20_000]),
            end_stream: false,
            padding: 0,
        });
        assert_eq!(decode_frame(&mut buf, 16_384), Err(H2Error::FrameSizeError));
    }

    #[test]
    fn stream_scoping_is_enforced() {
        let data_on_zero = FrameHeader {
            length: 0,
            frame_type: FRAME_DATA,
            flags: 0,
            stream_id: 0,
        };
        assert!(matches!(
            Frame::decode(&data_on_zero, Bytes::new()),
            Err(H2Error::ProtocolError(_))
        ));

        let ping_on_stream = FrameHeader {
            length: 8,
            frame_type: FRAME_PING,
            flags: 0,
            stream_id: 1,
        };
        assert!(Frame::decode(&ping_on_stream, Bytes::from_static(&[0; 8])).is_err());
    }

    #[test]
    fn zero_window_increment() {
        let header = |stream_id| FrameHeader {
            length: 4,
            frame_type: FRAME_WINDOW_UPDATE,
            flags: 0,
            stream_id,
        };
        let zero = Bytes::from_static(&[0; 4]);
        assert!(Frame::decode(&header(0), zero.clone()).unwrap_err().is_connection_error());
        assert_eq!(
            Frame::decode(&header(3), zero),
            Err(H2Error::StreamError(3, ErrorCode::ProtocolError))
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        let header = FrameHeader {
            length: 3,
            frame_type: 0xfe,
            flags: 0x42,
            stream_id: 7,
        };
        let frame = Frame::decode(&header, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(frame.stream_id(), 7);
        assert_eq!(reparse(&frame), frame);
    }
}
