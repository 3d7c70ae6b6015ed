//! Wire protocol: command encoding and CR-delimited reply framing.
//!
//! Commands travel as one-line JSON objects terminated by `\n`. Replies are
//! byte runs terminated by a single CR (0x0D); the device may prepend
//! arbitrary non-JSON console text, so the payload starts at the first `{`
//! of the frame. The wire carries no request/reply correlation id.

use log::warn;
use serde_json::Value;

/// Reply frame terminator.
pub const FRAME_TERMINATOR: u8 = 0x0D;

/// Placeholder arguments carried by commands that take none.
pub const UNUSED_ARGUMENTS: &str = "Unused Arguments";

/// Total size of one PCM frame on the log port.
pub const PCM_FRAME_BYTES: usize = 2568;

/// Fixed per-frame overhead ahead of the samples in a captured PCM frame.
pub const PCM_FRAME_OVERHEAD: usize = 2;

/// Sample payload carried by one full PCM frame.
pub const PCM_PAYLOAD_BYTES: usize = PCM_FRAME_BYTES - PCM_FRAME_OVERHEAD;

/// PCM samples are 32-bit IEEE-754 floats.
pub const BYTES_PER_SAMPLE: u32 = 4;

/// Console frame size set up before a streaming upload.
pub const CONSOLE_PACKET_BYTES: i64 = 256;

/// Console timeout set up before a streaming upload.
pub const CONSOLE_TIMEOUT_MS: i64 = 500;

/// Chunk size for bulk uploads on the data port.
pub(crate) const UPLOAD_CHUNK_BYTES: usize = 4096;

// Command names understood by the modem firmware.
pub const CMD_SET_VALUE: &str = "SetValue";
pub const CMD_GET_VALUE: &str = "GetValue";
pub const CMD_GET_PARAMETERS: &str = "GetParameters";
pub const CMD_TRANSMIT_JSON: &str = "TransmitJSON";
pub const CMD_START_NET_PLAY: &str = "StartNetPlay";
pub const EVENT_PLAY_QUEUE_EMPTY: &str = "Event_playPcmQueueEmpty";

/// Encode a command/argument pair into its wire form.
///
/// Produces exactly `{ "Command": "<command>", "Arguments": "<arguments>" }\n`.
/// No escaping is performed; callers must not pass arguments containing a
/// literal `"` (the wire format has none).
pub fn encode_command(command: &str, arguments: &str) -> Vec<u8> {
    format!(
        "{{ \"Command\": \"{}\", \"Arguments\": \"{}\" }}\n",
        command, arguments
    )
    .into_bytes()
}

/// Encode a `TransmitJSON` command carrying `payload` as a raw JSON value.
///
/// Unlike [`encode_command`], the payload is embedded unquoted.
pub fn encode_transmit_json(payload: &str) -> Vec<u8> {
    format!(
        "{{ \"Command\": \"{}\", \"Arguments\": {} }}\n",
        CMD_TRANSMIT_JSON, payload
    )
    .into_bytes()
}

/// Stateful splitter turning a raw byte stream into decoded reply objects.
///
/// Bytes may arrive in arbitrary fragment sizes, down to one at a time;
/// frames are never lost or duplicated across fragment boundaries. Frames
/// whose payload fails to parse are dropped and counted, never delivered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    decode_errors: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every reply completed by this fragment.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut decoded = Vec::new();
        for &byte in bytes {
            if byte == FRAME_TERMINATOR {
                if let Some(reply) = self.finish_frame() {
                    decoded.push(reply);
                }
            } else {
                self.pending.push(byte);
            }
        }
        decoded
    }

    /// Number of frames dropped because their payload did not parse.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    fn finish_frame(&mut self) -> Option<Value> {
        let frame = std::mem::take(&mut self.pending);
        let Some(start) = frame.iter().position(|&b| b == b'{') else {
            // Blank frames between replies are normal; anything else is a
            // frame we cannot interpret.
            if !frame.iter().all(u8::is_ascii_whitespace) {
                self.decode_errors += 1;
                warn!(
                    "discarding reply frame with no JSON payload: {:?}",
                    String::from_utf8_lossy(&frame)
                );
            }
            return None;
        };

        match serde_json::from_slice(&frame[start..]) {
            Ok(reply) => Some(reply),
            Err(err) => {
                self.decode_errors += 1;
                warn!(
                    "unparseable JSON reply ({}): {:?}",
                    err,
                    String::from_utf8_lossy(&frame[start..])
                );
                None
            }
        }
    }
}
