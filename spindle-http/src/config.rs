use spindle_h2::Settings;
use spindle_h2::flowcontrol::DEFAULT_WINDOW_SIZE;
use spindle_h2::settings::MAX_WINDOW_SIZE;

use crate::error::HttpError;

/// Stream window a client advertises by default: 16 MiB.
pub const CLIENT_WINDOW_SIZE: u32 = 16 << 20;

/// Configuration for one [`Http2Connection`](crate::Http2Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Config {
    /// Receive window advertised for each stream (SETTINGS_INITIAL_WINDOW_SIZE).
    pub initial_window_size: u32,
    /// Receive window for the whole connection.
    pub connection_window_size: u32,
    /// Largest frame payload we accept.
    pub max_frame_size: u32,
    /// HPACK dynamic table size for decoding.
    pub header_table_size: u32,
    /// Streams the peer may have open at once. `None` = unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// Largest decoded header list we accept. `None` = unlimited.
    pub max_header_list_size: Option<u32>,
    /// Received bytes buffered per stream before `read` is expected to
    /// catch up. Flow control is what actually bounds the peer.
    pub stream_high_water_mark: usize,
    /// Consumed bytes are acknowledged once `1 / ratio` of a window has
    /// been read.
    pub window_update_ratio: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self::client()
    }
}

impl Http2Config {
    /// Client defaults: large windows so downloads are not throttled.
    pub fn client() -> Self {
        Self {
            initial_window_size: CLIENT_WINDOW_SIZE,
            connection_window_size: CLIENT_WINDOW_SIZE,
            max_frame_size: spindle_h2::settings::DEFAULT_MAX_FRAME_SIZE,
            header_table_size: 4096,
            max_concurrent_streams: None,
            max_header_list_size: None,
            stream_high_water_mark: 64 * 1024,
            window_update_ratio: 2,
        }
    }

    /// Server defaults: protocol-default windows and a stream limit.
    pub fn server() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            connection_window_size: DEFAULT_WINDOW_SIZE,
            max_concurrent_streams: Some(256),
            max_header_list_size: Some(64 * 1024),
            ..Self::client()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), HttpError> {
        self.settings()
            .validate()
            .map_err(|e| HttpError::Config(e.to_string()))?;
        if !(DEFAULT_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.connection_window_size) {
            return Err(HttpError::Config(format!(
                "connection_window_size must be in {DEFAULT_WINDOW_SIZE}..={MAX_WINDOW_SIZE}"
            )));
        }
        if self.stream_high_water_mark == 0 {
            return Err(HttpError::Config("stream_high_water_mark must be > 0".into()));
        }
        if self.window_update_ratio == 0 {
            return Err(HttpError::Config("window_update_ratio must be > 0".into()));
        }
        Ok(())
    }

    /// SETTINGS to advertise. Push is never enabled.
    pub fn settings(&self) -> Settings {
        Settings {
            header_table_size: self.header_table_size,
            enable_push: false,
            max_concurrent_streams: self.max_concurrent_streams,
            initial_window_size: self.initial_window_size,
            max_frame_size: self.max_frame_size,
            max_header_list_size: self.max_header_list_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Http2Config::client().validate().unwrap();
        Http2Config::server().validate().unwrap();
        assert_eq!(Http2Config::default(), Http2Config::client());
    }

    #[test]
    fn settings_follow_config() {
        let settings = Http2Config::server().settings();
        assert!(!settings.enable_push);
        assert_eq!(settings.initial_window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(settings.max_concurrent_streams, Some(256));
    }

    #[test]
    fn out_of_range_values_rejected() {
        let config = Http2Config {
            initial_window_size: MAX_WINDOW_SIZE + 1,
            ..Http2Config::client()
        };
        assert!(matches!(config.validate(), Err(HttpError::Config(_))));

        let config = Http2Config {
            max_frame_size: 1024,
            ..Http2Config::client()
        };
        assert!(matches!(config.validate(), Err(HttpError::Config(_))));

        let config = Http2Config {
            connection_window_size: 1024,
            ..Http2Config::client()
        };
        assert!(matches!(config.validate(), Err(HttpError::Config(_))));

        let config = Http2Config {
            window_update_ratio: 0,
            ..Http2Config::client()
        };
        assert!(matches!(config.validate(), Err(HttpError::Config(_))));
    }
}
