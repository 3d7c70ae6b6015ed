//! Background reader for the control socket.
//!
//! One reader thread runs per connection, turning the raw reply byte
//! stream into decoded objects on the shared queue. Transport and decode
//! problems are contained here; the foreground only ever sees the queue.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::protocol::FrameDecoder;
use crate::reply_queue::ReplyQueue;

/// Per-read timeout. Not an error condition: it bounds how long the loop
/// can go without observing the running flag, and therefore the shutdown
/// latency of the channel.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawn the reader thread on a cloned control-socket handle.
pub(crate) fn spawn(
    stream: TcpStream,
    replies: ReplyQueue,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    thread::Builder::new()
        .name("modem-rx".into())
        .spawn(move || run(stream, replies, running))
}

fn run(mut stream: TcpStream, replies: ReplyQueue, running: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];
    let mut idle_timeouts: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!("control socket closed by peer, reply reader exiting");
                break;
            }
            Ok(n) => {
                for reply in decoder.push(&buf[..n]) {
                    trace!("<- {}", reply);
                    replies.push(reply);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                idle_timeouts += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!("control socket read failed, reply reader exiting: {}", err);
                break;
            }
        }
    }

    debug!(
        "reply reader stopped ({} undecodable frames dropped, {} idle timeouts)",
        decoder.decode_errors(),
        idle_timeouts
    );
}
