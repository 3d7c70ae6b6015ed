//! Shared types: network endpoints, PCM sampling modes, cancellation.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default base port of the modem application.
pub const DEFAULT_BASE_PORT: u16 = 17000;

/// Network location of a modem.
///
/// The modem exposes four TCP ports derived from a single base port:
/// command (`base`), bulk data (`base+1`), PCM log (`base+2`), and
/// PCM I/O (`base+3`). The endpoint is fixed for the lifetime of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    base_port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Command/reply channel port.
    pub fn command_port(&self) -> u16 {
        self.base_port
    }

    /// Bulk data upload port.
    pub fn data_port(&self) -> u16 {
        self.base_port + 1
    }

    /// PCM record/playback log port.
    pub fn pcm_log_port(&self) -> u16 {
        self.base_port + 2
    }

    /// PCM I/O port.
    pub fn pcm_io_port(&self) -> u16 {
        self.base_port + 3
    }

    /// Resolve one of the derived ports to a connectable address.
    pub(crate) fn resolve(&self, port: u16) -> io::Result<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {}:{}", self.host, port),
                )
            })
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_BASE_PORT)
    }
}

/// Converter sampling mode for PCM playback and capture.
///
/// Baseband and passband sampling share the modem's digital up/down
/// converter, so baseband capture and normal passband reception are
/// mutually exclusive at the hardware level. The driver sequences the
/// mode-set commands; it does not (and cannot) enforce the exclusion
/// device-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmMode {
    /// Full-rate passband sampling, 102 400 samples/s.
    Passband,
    /// Complex baseband sampling, 20 480 samples/s.
    Baseband,
}

impl PcmMode {
    /// Wire value carried by `PlayMode` / `RecordMode`.
    pub fn flag(self) -> i64 {
        match self {
            PcmMode::Passband => 0,
            PcmMode::Baseband => 1,
        }
    }

    /// Effective sample rate in samples per second.
    pub fn sample_rate(self) -> u32 {
        match self {
            PcmMode::Passband => 102_400,
            PcmMode::Baseband => 20_480,
        }
    }
}

/// Shared cancellation flag for streaming sessions.
///
/// Clone the token and hand one half to the session call; `cancel()` from
/// any thread makes the session abort at its next loop iteration, still
/// running its cleanup path.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ports() {
        let ep = Endpoint::new("modem.local", 17000);
        assert_eq!(ep.command_port(), 17000);
        assert_eq!(ep.data_port(), 17001);
        assert_eq!(ep.pcm_log_port(), 17002);
        assert_eq!(ep.pcm_io_port(), 17003);
    }

    #[test]
    fn test_default_endpoint() {
        let ep = Endpoint::default();
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.command_port(), DEFAULT_BASE_PORT);
    }

    #[test]
    fn test_pcm_mode_wire_values() {
        assert_eq!(PcmMode::Passband.flag(), 0);
        assert_eq!(PcmMode::Baseband.flag(), 1);
        assert_eq!(PcmMode::Passband.sample_rate(), 102_400);
        assert_eq!(PcmMode::Baseband.sample_rate(), 20_480);
    }

    #[test]
    fn test_cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
