//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5).
//!
//! A SETTINGS frame carries only the parameters that change, so frames are
//! decoded into a list of [`Setting`]s that are then applied on top of the
//! peer's current [`Settings`].

use bytes::{Buf, BufMut};

use crate::error::H2Error;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Largest legal flow-control window, 2^31 - 1.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
/// Protocol default for MAX_FRAME_SIZE and the lower bound of its range.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
/// Upper bound of MAX_FRAME_SIZE, 2^24 - 1.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// One validated parameter from a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

impl Setting {
    fn id_and_value(self) -> (u16, u32) {
        match self {
            Self::HeaderTableSize(v) => (HEADER_TABLE_SIZE, v),
            Self::EnablePush(v) => (ENABLE_PUSH, u32::from(v)),
            Self::MaxConcurrentStreams(v) => (MAX_CONCURRENT_STREAMS, v),
            Self::InitialWindowSize(v) => (INITIAL_WINDOW_SIZE, v),
            Self::MaxFrameSize(v) => (MAX_FRAME_SIZE, v),
            Self::MaxHeaderListSize(v) => (MAX_HEADER_LIST_SIZE, v),
        }
    }

    /// Validate one wire parameter. Unknown identifiers yield `None`
    /// (RFC 7540 Section 6.5.2).
    fn from_wire(id: u16, value: u32) -> Result<Option<Self>, H2Error> {
        let setting = match id {
            HEADER_TABLE_SIZE => Self::HeaderTableSize(value),
            ENABLE_PUSH => match value {
                0 | 1 => Self::EnablePush(value == 1),
                _ => return Err(H2Error::ProtocolError("ENABLE_PUSH must be 0 or 1".into())),
            },
            MAX_CONCURRENT_STREAMS => Self::MaxConcurrentStreams(value),
            INITIAL_WINDOW_SIZE if value > MAX_WINDOW_SIZE => return Err(H2Error::FlowControlError),
            INITIAL_WINDOW_SIZE => Self::InitialWindowSize(value),
            MAX_FRAME_SIZE if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) => {
                return Err(H2Error::ProtocolError("MAX_FRAME_SIZE out of range".into()));
            }
            MAX_FRAME_SIZE => Self::MaxFrameSize(value),
            MAX_HEADER_LIST_SIZE => Self::MaxHeaderListSize(value),
            _ => return Ok(None),
        };
        Ok(Some(setting))
    }

    /// Encode as a 6-byte (identifier, value) pair.
    pub fn encode(self, dst: &mut impl BufMut) {
        let (id, value) = self.id_and_value();
        dst.put_u16(id);
        dst.put_u32(value);
    }

    /// Decode a SETTINGS payload, skipping unknown identifiers.
    pub fn decode_all(mut payload: &[u8]) -> Result<Vec<Self>, H2Error> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::FrameSizeError);
        }
        let mut out = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            out.extend(Self::from_wire(id, value)?);
        }
        Ok(out)
    }
}

/// The full set of parameters one endpoint operates under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means unlimited.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    /// Protocol defaults, assumed for the peer until its SETTINGS arrive.
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Client side: no server push.
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            ..Self::default()
        }
    }

    /// Server side: push is never offered, streams are bounded.
    pub fn server_default() -> Self {
        Self {
            enable_push: false,
            max_concurrent_streams: Some(256),
            ..Self::default()
        }
    }

    /// Check that every value is legal to advertise.
    pub fn validate(&self) -> Result<(), H2Error> {
        for setting in self.to_params() {
            let (id, value) = setting.id_and_value();
            Setting::from_wire(id, value)?;
        }
        Ok(())
    }

    /// Parameters to advertise in our initial SETTINGS frame.
    pub fn to_params(&self) -> Vec<Setting> {
        let mut params = vec![
            Setting::HeaderTableSize(self.header_table_size),
            Setting::EnablePush(self.enable_push),
            Setting::InitialWindowSize(self.initial_window_size),
            Setting::MaxFrameSize(self.max_frame_size),
        ];
        params.extend(self.max_concurrent_streams.map(Setting::MaxConcurrentStreams));
        params.extend(self.max_header_list_size.map(Setting::MaxHeaderListSize));
        params
    }

    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::HeaderTableSize(v) => self.header_table_size = v,
            Setting::EnablePush(v) => self.enable_push = v,
            Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
            Setting::InitialWindowSize(v) => self.initial_window_size = v,
            Setting::MaxFrameSize(v) => self.max_frame_size = v,
            Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
        }
    }
}
