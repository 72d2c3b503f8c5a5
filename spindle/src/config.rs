use crate::error::Error;

/// Default high-water mark for read-ahead pipes: 64 KiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Configuration for an [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used in log events emitted by this loop.
    pub name: String,
    /// Maximum number of concurrently live tasks. 0 = unbounded.
    pub max_tasks: usize,
    /// Bytes reserved per underlying read by read-ahead pumps.
    pub read_chunk_size: usize,
    /// High-water mark used by [`buffer`](crate::pipe::buffer) on this loop.
    pub buffer_high_water_mark: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "spindle".to_string(),
            max_tasks: 0,
            read_chunk_size: 8192,
            buffer_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be > 0".into()));
        }
        if self.buffer_high_water_mark == 0 {
            return Err(Error::Config("buffer_high_water_mark must be > 0".into()));
        }
        if self.max_tasks > u32::MAX as usize {
            return Err(Error::Config("max_tasks must fit in 32 bits".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_sizes_rejected() {
        let config = Config {
            buffer_high_water_mark: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = Config {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn event_loop_rejects_invalid_config() {
        let config = Config {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert!(crate::EventLoop::new(config).is_err());
    }
}
