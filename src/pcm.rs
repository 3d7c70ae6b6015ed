//! PCM playback and capture sessions on the modem's log port.
//!
//! Both sessions open their own connection to the PCM log port, drive a
//! framed byte-transfer loop on the caller's thread, and release socket and
//! file on every exit path. Timing matters: the device produces and drains
//! sample data in real time, so socket timeouts here usually mean
//! backpressure, not failure, so transfers retry under a bounded stall
//! budget instead of spinning forever.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::modem::Modem;
use crate::protocol::{
    BYTES_PER_SAMPLE, CMD_START_NET_PLAY, EVENT_PLAY_QUEUE_EMPTY, PCM_FRAME_BYTES,
    PCM_FRAME_OVERHEAD,
};
use crate::types::{CancelToken, PcmMode};

const PCM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket send/recv timeout; one tick of the stall budget.
const PCM_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive timed-out socket operations tolerated before the session
/// gives up. Progress resets the count.
const STALL_LIMIT: u32 = 30;

/// Total stall budget implied by `STALL_LIMIT`, for error reporting.
const STALL_BUDGET: Duration = Duration::from_secs(30);

/// Expected real-time playback duration for a number of queued bytes.
///
/// Derived from bytes queued for send, not bytes confirmed drained by the
/// device, an inherent approximation of the protocol.
pub(crate) fn playback_duration(bytes_sent: u64, mode: PcmMode) -> Duration {
    let bytes_per_second = f64::from(BYTES_PER_SAMPLE) * f64::from(mode.sample_rate());
    Duration::from_secs_f64(bytes_sent as f64 / bytes_per_second)
}

/// Capture target in bytes for a requested duration.
///
/// Computed in bytes for both modes: duration × sample rate × 4 bytes per
/// 32-bit float sample.
pub(crate) fn target_byte_count(duration: Duration, mode: PcmMode) -> u64 {
    let bytes_per_second = f64::from(BYTES_PER_SAMPLE) * f64::from(mode.sample_rate());
    (duration.as_secs_f64() * bytes_per_second).round() as u64
}

pub(crate) fn play(modem: &Modem, path: &Path, mode: PcmMode, cancel: &CancelToken) -> Result<u64> {
    let file = File::open(path).map_err(|err| Error::resource(path, err))?;
    let socket = connect_pcm(modem)?;

    modem.set_value_i("PlayMode", mode.flag())?;
    modem.send(CMD_START_NET_PLAY, "0 0")?;
    info!("playing {} ({:?})", path.display(), mode);

    let started = Instant::now();
    let sent = send_samples(&socket, file, path, cancel)?;

    let duration = playback_duration(sent, mode);
    debug!("queued {} bytes, expected playback {:?}", sent, duration);

    // The device drains its queue in real time; wait out the expected
    // duration before declaring the queue empty.
    wait_until(started + duration, cancel)?;
    modem.send_command(EVENT_PLAY_QUEUE_EMPTY)?;
    Ok(sent)
}

pub(crate) fn record(
    modem: &Modem,
    path: &Path,
    duration: Duration,
    mode: PcmMode,
    cancel: &CancelToken,
) -> Result<u64> {
    let target_bytes = target_byte_count(duration, mode);
    let file = File::create(path).map_err(|err| Error::resource(path, err))?;
    let socket = connect_pcm(modem)?;

    modem.set_value_i("RecordMode", mode.flag())?;
    info!(
        "recording {} bytes ({:?}, {:?}) into {}",
        target_bytes,
        mode,
        duration,
        path.display()
    );

    let result = capture(&socket, file, path, target_bytes, cancel);

    // Baseband capture and normal reception share the converter; passband
    // mode must come back regardless of how the capture ended.
    let restore = modem.set_value_i("RecordMode", 0);
    match (result, restore) {
        (Ok(captured), Ok(())) => Ok(captured),
        (Err(err), restore) => {
            if let Err(restore_err) = restore {
                warn!("failed to restore RecordMode after capture: {}", restore_err);
            }
            Err(err)
        }
        (Ok(_), Err(restore_err)) => Err(restore_err),
    }
}

fn connect_pcm(modem: &Modem) -> Result<TcpStream> {
    let endpoint = modem.endpoint();
    let addr = endpoint.resolve(endpoint.pcm_log_port())?;
    let socket = TcpStream::connect_timeout(&addr, PCM_CONNECT_TIMEOUT)?;
    socket.set_read_timeout(Some(PCM_IO_TIMEOUT))?;
    socket.set_write_timeout(Some(PCM_IO_TIMEOUT))?;
    Ok(socket)
}

/// Send the whole file in fixed-size frames, each queued exactly once.
fn send_samples(
    socket: &TcpStream,
    file: File,
    path: &Path,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut reader = BufReader::new(file);
    let mut frame = vec![0u8; PCM_FRAME_BYTES];
    let mut sent: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = fill_frame(&mut reader, &mut frame).map_err(|err| Error::resource(path, err))?;
        if n == 0 {
            return Ok(sent);
        }
        send_with_retry(socket, &frame[..n], cancel)?;
        sent += n as u64;
        if n < frame.len() {
            // Short frame: the source is exhausted.
            return Ok(sent);
        }
    }
}

/// Read until the frame is full or the source ends; returns bytes read.
fn fill_frame(reader: &mut impl Read, frame: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < frame.len() {
        match reader.read(&mut frame[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Write one frame to completion, absorbing bounded backpressure stalls.
fn send_with_retry(mut socket: &TcpStream, frame: &[u8], cancel: &CancelToken) -> Result<()> {
    let mut offset = 0;
    let mut stalls = 0u32;
    while offset < frame.len() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match socket.write(&frame[offset..]) {
            Ok(0) => {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pcm socket closed during playback",
                )))
            }
            Ok(n) => {
                offset += n;
                stalls = 0;
            }
            Err(err) if is_transient(&err) => {
                stalls += 1;
                if stalls >= STALL_LIMIT {
                    return Err(Error::timeout("pcm send progress", STALL_BUDGET));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Receive framed PCM until `target_bytes` of payload have been written.
fn capture(
    mut socket: &TcpStream,
    file: File,
    path: &Path,
    target_bytes: u64,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut writer = BufWriter::new(file);
    let mut frame = [0u8; PCM_FRAME_BYTES];
    let mut captured: u64 = 0;
    let mut frames: u64 = 0;
    let mut stalls = 0u32;

    while captured < target_bytes {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match socket.read(&mut frame) {
            Ok(0) => {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pcm socket closed during capture",
                )))
            }
            Ok(n) => {
                stalls = 0;
                // Each frame carries a fixed header ahead of the samples.
                let payload = &frame[PCM_FRAME_OVERHEAD.min(n)..n];
                writer
                    .write_all(payload)
                    .map_err(|err| Error::resource(path, err))?;
                captured += payload.len() as u64;
                frames += 1;
                if frames % 80 == 0 {
                    debug!("captured {} / {} bytes", captured, target_bytes);
                }
            }
            Err(err) if is_transient(&err) => {
                stalls += 1;
                if stalls >= STALL_LIMIT {
                    return Err(Error::timeout("pcm capture progress", STALL_BUDGET));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }

    writer.flush().map_err(|err| Error::resource(path, err))?;
    Ok(captured)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Sleep in cancel-aware slices until `deadline`.
fn wait_until(deadline: Instant, cancel: &CancelToken) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(Duration::from_millis(200)));
    }
}
