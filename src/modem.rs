//! Control-channel connection to a modem.
//!
//! A [`Modem`] owns the persistent command-port TCP connection and the
//! background reply reader that feeds the shared [`ReplyQueue`]. All
//! higher-level operations (parameter enumeration, value get/set, the
//! streaming sessions) go through it.
//!
//! # Example
//!
//! ```no_run
//! use acoustic_modem::{Endpoint, Modem};
//!
//! fn main() -> acoustic_modem::Result<()> {
//!     let mut modem = Modem::connect(&Endpoint::default())?;
//!     modem.load_parameters()?;
//!     modem.send_ping(0.1)?;
//!     modem.close();
//!     Ok(())
//! }
//! ```

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::params::{EnumStep, ParameterCatalog, ParameterElement};
use crate::pcm;
use crate::protocol::{self, encode_command, encode_transmit_json};
use crate::reply_queue::ReplyQueue;
use crate::rx_worker;
use crate::types::{CancelToken, Endpoint, PcmMode};
use crate::upload::{self, UploadConfig};

/// Bound on the control-port TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Reply wait for one parameter-enumeration step.
const PARAMETER_TIMEOUT: Duration = Duration::from_secs(3);

/// Reply wait for a cycle-count query.
const CYCLE_COUNT_TIMEOUT: Duration = Duration::from_secs(3);

/// A live control-channel connection to a modem.
///
/// Commands are written synchronously; replies arrive asynchronously on the
/// reply queue in decode order, with no request/reply correlation. One
/// background reader thread runs for the lifetime of the connection and is
/// joined by [`Modem::close`].
pub struct Modem {
    endpoint: Endpoint,
    writer: Mutex<TcpStream>,
    replies: ReplyQueue,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    catalog: ParameterCatalog,
    /// Guards the record file handle against concurrent record sessions.
    record_lock: Mutex<()>,
}

impl Modem {
    /// Open the command-port connection and start the reply reader.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        info!(
            "connecting to modem at {}:{}",
            endpoint.host(),
            endpoint.command_port()
        );
        let addr = endpoint.resolve(endpoint.command_port())?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        let replies = ReplyQueue::new();
        let running = Arc::new(AtomicBool::new(true));
        let reader = rx_worker::spawn(stream.try_clone()?, replies.clone(), Arc::clone(&running))?;

        Ok(Self {
            endpoint: endpoint.clone(),
            writer: Mutex::new(stream),
            replies,
            running,
            reader: Some(reader),
            catalog: ParameterCatalog::default(),
            record_lock: Mutex::new(()),
        })
    }

    /// The endpoint this modem was connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The shared reply queue.
    pub fn replies(&self) -> &ReplyQueue {
        &self.replies
    }

    /// Send one command frame.
    ///
    /// The frame is written in a single call serialized through an internal
    /// lock, so concurrent senders never interleave. `arguments` must not
    /// contain a literal `"`: the wire format has no escaping.
    pub fn send(&self, command: &str, arguments: &str) -> Result<()> {
        let frame = encode_command(command, arguments);
        debug!("-> {} {}", command, arguments);
        self.lock_writer().write_all(&frame)?;
        Ok(())
    }

    /// Send a command that takes no arguments.
    pub fn send_command(&self, command: &str) -> Result<()> {
        self.send(command, protocol::UNUSED_ARGUMENTS)
    }

    /// Transmit a caller-supplied JSON payload over the acoustic link.
    ///
    /// The payload is parsed first; if it is not valid JSON the call fails
    /// with [`Error::Validation`] and nothing is written to the wire.
    pub fn transmit_json(&self, payload: &str) -> Result<()> {
        serde_json::from_str::<Value>(payload).map_err(Error::Validation)?;
        let frame = encode_transmit_json(payload);
        debug!("-> TransmitJSON {}", payload);
        self.lock_writer().write_all(&frame)?;
        Ok(())
    }

    /// Wait up to `timeout` for the oldest undelivered reply.
    pub fn wait_for_reply(&self, timeout: Duration) -> Option<Value> {
        self.replies.get(timeout)
    }

    /// Discard every queued reply without blocking.
    pub fn drain_replies(&self) -> usize {
        self.replies.drain()
    }

    /// Consume replies until one satisfies `matches`, bounded by `limit`.
    ///
    /// Unrelated frames pulled off the queue while waiting are discarded;
    /// the wire has no correlation ids, so this is the protocol's matching
    /// model.
    pub fn wait_for_reply_matching(
        &self,
        what: &'static str,
        limit: Duration,
        mut matches: impl FnMut(&Value) -> bool,
    ) -> Result<Value> {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(what, limit));
            }
            match self.replies.get(remaining) {
                Some(reply) if matches(&reply) => return Ok(reply),
                Some(other) => trace!("ignoring unrelated reply while waiting for {}: {}", what, other),
                None => return Err(Error::timeout(what, limit)),
            }
        }
    }

    // =========================================================================
    // Parameter catalog
    // =========================================================================

    /// Enumerate the device's parameter catalog.
    ///
    /// Walks the linked element list from index 0, strictly sequentially.
    /// On a per-step timeout the walk aborts with [`Error::Timeout`]; the
    /// elements committed so far remain available via [`Modem::parameters`].
    pub fn load_parameters(&mut self) -> Result<&ParameterCatalog> {
        self.load_parameters_with(|_| {})
    }

    /// Enumerate parameters, reporting every channel-0 element to `observer`.
    ///
    /// The observer sees terminal elements too; whether they are stored is
    /// the catalog's concern, not the observer's.
    pub fn load_parameters_with<F>(&mut self, mut observer: F) -> Result<&ParameterCatalog>
    where
        F: FnMut(&ParameterElement),
    {
        self.catalog = ParameterCatalog::default();
        let mut idx: i64 = 0;
        loop {
            self.send(protocol::CMD_GET_PARAMETERS, &idx.to_string())?;
            let reply = self.wait_for_reply_matching("parameter element", PARAMETER_TIMEOUT, |r| {
                r.get("Element").is_some()
            })?;
            let payload = reply.get("Element").cloned().unwrap_or(Value::Null);
            let element: ParameterElement = serde_json::from_value(payload)
                .map_err(|err| Error::Protocol(format!("malformed parameter element: {}", err)))?;

            if element.channel == 0 {
                observer(&element);
            }
            match self.catalog.absorb(element) {
                EnumStep::Continue(next) => idx = next,
                EnumStep::Done => break,
            }
        }
        debug!("parameter catalog built: {} entries", self.catalog.len());
        Ok(&self.catalog)
    }

    /// The catalog built by the last [`Modem::load_parameters`] call.
    pub fn parameters(&self) -> &ParameterCatalog {
        &self.catalog
    }

    // =========================================================================
    // Value access and convenience commands
    // =========================================================================

    /// Set an integer-valued parameter.
    pub fn set_value_i(&self, name: &str, value: i64) -> Result<()> {
        self.send(protocol::CMD_SET_VALUE, &format!("{} int {} 0", name, value))
    }

    /// Set a float-valued parameter.
    pub fn set_value_f(&self, name: &str, value: f32) -> Result<()> {
        self.send(
            protocol::CMD_SET_VALUE,
            &format!("{} float {} 0", name, value),
        )
    }

    /// Request an integer-valued parameter; the reply lands on the queue.
    pub fn get_value_i(&self, name: &str) -> Result<()> {
        // Two spaces: the value slot is empty on reads.
        self.send(protocol::CMD_GET_VALUE, &format!("{} int  0", name))
    }

    /// Request a float-valued parameter; the reply lands on the queue.
    pub fn get_value_f(&self, name: &str) -> Result<()> {
        self.send(protocol::CMD_GET_VALUE, &format!("{} float  0", name))
    }

    /// Transmit a test packet at the given power.
    pub fn send_ping(&self, power_watts: f32) -> Result<()> {
        self.set_value_f("TxPowerWatts", power_watts)?;
        self.set_value_i("CarrierTxMode", 0)?;
        self.send_command("Event_sendTestPacket")
    }

    /// Transmit a ranging packet at the given power.
    pub fn send_range(&self, power_watts: f32) -> Result<()> {
        self.set_value_f("TxPowerWatts", power_watts)?;
        self.set_value_i("CarrierTxMode", 0)?;
        self.send_command("Event_sendRanging")
    }

    /// Put the receiver into listening mode.
    pub fn start_rx(&self) -> Result<()> {
        self.send_command("Event_StartRx")
    }

    /// Run the transmitter calibration sequence at 1 W.
    pub fn calibrate(&self) -> Result<()> {
        self.set_value_f("TxPowerWatts", 1.0)?;
        self.send_command("Event_startTxCal")
    }

    /// Request the firmware version; the reply lands on the queue.
    pub fn request_version(&self) -> Result<()> {
        self.send_command("GetVersion")
    }

    /// Set the device real-time clock from a formatted clock string.
    pub fn set_rtc(&self, clock: &str) -> Result<()> {
        self.send("SetRTC", clock)
    }

    /// Request the device real-time clock; the reply lands on the queue.
    pub fn request_rtc(&self) -> Result<()> {
        self.send_command("GetRTC")
    }

    /// Select the receiver gain-adjustment mode.
    pub fn set_gain_mode(&self, mode: i64) -> Result<()> {
        self.set_value_i("GainAdjustMode", mode)
    }

    /// Request the in-band energy estimate; the reply lands on the queue.
    pub fn request_inband_energy(&self) -> Result<()> {
        self.get_value_f("GetInbandEnergy")
    }

    /// Query per-module cycle counts.
    ///
    /// Drains stale replies, requests `APP_CycleCount`, and waits for the
    /// reply carrying the `"Application.0"` statistics block. Formatting
    /// the numbers is the caller's concern.
    pub fn read_cycle_counts(&self) -> Result<Value> {
        self.drain_replies();
        self.get_value_i("APP_CycleCount")?;
        self.wait_for_reply_matching("cycle counts", CYCLE_COUNT_TIMEOUT, |r| {
            r.get("Application.0").is_some()
        })
    }

    // =========================================================================
    // Target-side capture and playback
    // =========================================================================

    /// Start recording on the device itself, into a file on the target.
    pub fn start_target_recording(&self, filename: &str, duration_s: u32) -> Result<()> {
        self.send("StartRecording", &format!("{} {}", filename, duration_s))
    }

    /// Stop a target-side recording.
    pub fn stop_target_recording(&self) -> Result<()> {
        self.send_command("StopRecording")
    }

    /// Start playback of a file stored on the target, scaled by `scale`.
    pub fn start_target_playback(&self, filename: &str, scale: f32) -> Result<()> {
        self.send("StartPlaying", &format!("{} {}", filename, scale))
    }

    /// Stop a target-side playback.
    pub fn stop_target_playback(&self) -> Result<()> {
        self.send_command("StopPlaying")
    }

    // =========================================================================
    // Streaming sessions
    // =========================================================================

    /// Upload a file over the dedicated data port.
    ///
    /// Configures payload mode, waits (bounded) for the device's
    /// acknowledgement, then streams the file. Returns the bytes sent.
    /// See the session protocol notes on [`UploadConfig`].
    pub fn upload_file(
        &self,
        path: &Path,
        config: &UploadConfig,
        cancel: &CancelToken,
    ) -> Result<u64> {
        upload::run(self, path, config, cancel)
    }

    /// Play a raw 32-bit-float PCM file through the modem's converter.
    ///
    /// Blocks for roughly the duration of the audio: after the last chunk
    /// is queued the call waits out the expected playback time before
    /// signalling the device that the queue is empty. Returns bytes sent.
    pub fn play_pcm_file(&self, path: &Path, mode: PcmMode, cancel: &CancelToken) -> Result<u64> {
        pcm::play(self, path, mode, cancel)
    }

    /// Capture PCM from the modem's converter into a file.
    ///
    /// `RecordMode` is restored to passband on every exit path, because
    /// baseband capture and normal reception share the converter. Returns
    /// the payload bytes written.
    pub fn record_pcm_file(
        &self,
        path: &Path,
        duration: Duration,
        mode: PcmMode,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let _guard = self
            .record_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pcm::record(self, path, duration, mode, cancel)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop the reply reader and close the control connection.
    ///
    /// The reader thread is joined before the socket is shut down, so no
    /// read ever races the close. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("reply reader panicked");
            }
        }
        let _ = self.lock_writer().shutdown(Shutdown::Both);
        info!("modem connection closed");
    }

    fn lock_writer(&self) -> MutexGuard<'_, TcpStream> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Modem {
    fn drop(&mut self) {
        self.close();
    }
}
