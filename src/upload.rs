//! Streaming file upload over the dedicated data port.
//!
//! The upload handshake runs on the command channel: payload mode is
//! configured, then the session blocks on the reply queue until the device
//! acknowledges with an `Info` frame mentioning `PayloadMode`. Only then is
//! the data port opened. The bulk transfer itself never touches the reply
//! queue.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::modem::Modem;
use crate::protocol::{CONSOLE_PACKET_BYTES, CONSOLE_TIMEOUT_MS, UPLOAD_CHUNK_BYTES};
use crate::types::CancelToken;

/// Configuration for a streaming upload session.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Transmit power in watts.
    pub power_watts: f32,
    /// Bound on the wait for the device's `PayloadMode` acknowledgement.
    /// Without the acknowledgement the data port is never opened.
    pub handshake_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            power_watts: 0.1,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

const DATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn run(
    modem: &Modem,
    path: &Path,
    config: &UploadConfig,
    cancel: &CancelToken,
) -> Result<u64> {
    // Probe the file before touching the network.
    let metadata = std::fs::metadata(path).map_err(|err| Error::resource(path, err))?;
    if !metadata.is_file() {
        return Err(Error::resource(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let nbytes = metadata.len();
    let file = File::open(path).map_err(|err| Error::resource(path, err))?;

    // Stale status frames would confuse the handshake below.
    modem.drain_replies();

    modem.set_value_i("TCPecho", 0)?;
    modem.set_value_i("ConsolePacketBytes", CONSOLE_PACKET_BYTES)?;
    modem.set_value_i("ConsoleTimeoutMS", CONSOLE_TIMEOUT_MS)?;
    modem.set_value_i("StreamingTxLen", nbytes as i64)?;
    modem.set_value_i("PayloadMode", 1)?;
    modem.set_value_f("TxPowerWatts", config.power_watts)?;

    modem.wait_for_reply_matching(
        "PayloadMode acknowledgement",
        config.handshake_timeout,
        mentions_payload_mode,
    )?;

    let endpoint = modem.endpoint();
    let addr = endpoint.resolve(endpoint.data_port())?;
    let socket = TcpStream::connect_timeout(&addr, DATA_CONNECT_TIMEOUT)?;
    socket.set_nodelay(true)?;
    socket.set_write_timeout(Some(DATA_WRITE_TIMEOUT))?;

    info!("uploading {} ({} bytes)", path.display(), nbytes);
    let sent = copy_file(file, path, &socket, cancel)?;
    debug!("upload complete, {} bytes sent", sent);
    Ok(sent)
}

/// The device acknowledges payload mode with an `Info` frame; depending on
/// firmware the field is an object keyed by `PayloadMode` or a plain string
/// mentioning it.
fn mentions_payload_mode(reply: &Value) -> bool {
    match reply.get("Info") {
        Some(Value::Object(map)) => map.contains_key("PayloadMode"),
        Some(Value::String(text)) => text.contains("PayloadMode"),
        _ => false,
    }
}

/// Stream the whole file in fixed-size chunks, looping every write to
/// completion. A write failure is fatal to the session.
fn copy_file(file: File, path: &Path, mut socket: &TcpStream, cancel: &CancelToken) -> Result<u64> {
    let mut reader = BufReader::new(file);
    let mut chunk = vec![0u8; UPLOAD_CHUNK_BYTES];
    let mut sent: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = reader
            .read(&mut chunk)
            .map_err(|err| Error::resource(path, err))?;
        if n == 0 {
            return Ok(sent);
        }
        socket.write_all(&chunk[..n])?;
        sent += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_mode_matched_as_object_key() {
        assert!(mentions_payload_mode(&json!({"Info": {"PayloadMode": 1}})));
        assert!(!mentions_payload_mode(&json!({"Info": {"Other": 1}})));
    }

    #[test]
    fn test_payload_mode_matched_as_substring() {
        assert!(mentions_payload_mode(
            &json!({"Info": "PayloadMode set to 1"})
        ));
        assert!(!mentions_payload_mode(&json!({"Info": "Carrier locked"})));
    }

    #[test]
    fn test_unrelated_reply_not_matched() {
        assert!(!mentions_payload_mode(&json!({"Element": {"Name": "x"}})));
    }
}
