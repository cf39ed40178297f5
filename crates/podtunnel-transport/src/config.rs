//! Session configuration

use crate::{TransportError, TransportResult};
use podtunnel_proto::MAX_FRAME_LENGTH;
use std::time::Duration;

/// Tuning for a multiplexed session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the peer to acknowledge a new stream (`None` waits forever)
    pub stream_create_timeout: Option<Duration>,

    /// Frames queued for the writer task before senders wait
    pub outbound_queue: usize,

    /// Data chunks buffered per stream before the reader task waits
    pub inbound_queue: usize,

    /// Incoming streams buffered before new ones are refused
    pub accept_queue: usize,

    /// Largest payload written in a single DATA frame
    pub max_data_frame_size: usize,

    /// How long `close()` waits for the driver tasks before aborting them
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_create_timeout: Some(Duration::from_secs(30)),
            outbound_queue: 256,
            inbound_queue: 64,
            accept_queue: 16,
            max_data_frame_size: 32 * 1024,
            close_grace: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn with_stream_create_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_create_timeout = timeout;
        self
    }

    pub fn with_max_data_frame_size(mut self, size: usize) -> Self {
        self.max_data_frame_size = size;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.outbound_queue == 0 || self.inbound_queue == 0 || self.accept_queue == 0 {
            return Err(TransportError::ConfigurationError(
                "Queue depths must be > 0".to_string(),
            ));
        }
        if self.max_data_frame_size == 0 || self.max_data_frame_size > MAX_FRAME_LENGTH {
            return Err(TransportError::ConfigurationError(format!(
                "Data frame size must be between 1 and {}",
                MAX_FRAME_LENGTH
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.stream_create_timeout, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = SessionConfig::default().with_max_data_frame_size(0);
        assert!(config.validate().is_err());

        let config = SessionConfig::default().with_max_data_frame_size(MAX_FRAME_LENGTH + 1);
        assert!(config.validate().is_err());
    }
}
