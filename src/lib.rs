//! Host-side driver for networked acoustic modems.
//!
//! The modem exposes four TCP ports derived from one base port: a
//! command/reply channel plus dedicated ports for bulk data upload and PCM
//! streaming. Commands are line-delimited JSON objects; the device answers
//! with CR-terminated JSON frames, both solicited and unsolicited, on the
//! same connection, with no request/reply correlation id. The driver
//! therefore runs a background reader that decodes every incoming frame
//! onto a FIFO [`ReplyQueue`], and callers match replies by content.
//!
//! # Getting started
//!
//! ```no_run
//! use acoustic_modem::{CancelToken, Endpoint, Modem, PcmMode, UploadConfig};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! fn main() -> acoustic_modem::Result<()> {
//!     let mut modem = Modem::connect(&Endpoint::new("modem.local", 17000))?;
//!
//!     // Enumerate the device's self-describing parameters.
//!     let catalog = modem.load_parameters()?;
//!     println!("{} parameters", catalog.len());
//!
//!     // Fire a test packet at 100 mW.
//!     modem.send_ping(0.1)?;
//!
//!     // Stream a payload file over the data port.
//!     let cancel = CancelToken::new();
//!     modem.upload_file(Path::new("payload.bin"), &UploadConfig::default(), &cancel)?;
//!
//!     // Capture two seconds of passband PCM.
//!     modem.record_pcm_file(
//!         Path::new("capture.pcm"),
//!         Duration::from_secs(2),
//!         PcmMode::Passband,
//!         &cancel,
//!     )?;
//!
//!     modem.close();
//!     Ok(())
//! }
//! ```
//!
//! # Streaming sessions
//!
//! Upload, PCM playback, and PCM capture each open their own socket on the
//! relevant derived port, run entirely on the caller's thread, and release
//! socket and file on every exit path. Baseband and passband sampling share
//! the modem's converter, so baseband capture and normal reception are
//! mutually exclusive; the capture session restores passband mode on exit,
//! including error paths.
//!
//! # Failure model
//!
//! Connection loss is not recovered automatically: a failed operation
//! surfaces [`Error::Connection`] and the caller decides whether to
//! reconnect. Malformed reply frames are logged and dropped inside the
//! reader without disturbing the foreground.

mod error;
mod modem;
pub mod params;
mod pcm;
pub mod protocol;
mod reply_queue;
mod rx_worker;
pub mod types;
mod upload;

pub use error::{Error, Result};
pub use modem::Modem;
pub use params::{ParameterCatalog, ParameterElement, ParameterFormat};
pub use reply_queue::ReplyQueue;
pub use types::{CancelToken, Endpoint, PcmMode, DEFAULT_BASE_PORT};
pub use upload::UploadConfig;
