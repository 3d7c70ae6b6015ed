//! Scripted mock modem server for end-to-end tests.
//!
//! Binds the four derived TCP ports of an [`Endpoint`] on localhost and
//! runs one accept loop per port in background threads. Command-port
//! behavior is pluggable: a responder closure inspects each decoded
//! command and returns raw (already CR-terminated) reply frames to write
//! back, so tests can script handshakes, enumerations, and silence.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use acoustic_modem::Endpoint;
use serde_json::Value;

/// Inspects one decoded command, returns raw reply frames to send back.
pub type Responder = Box<dyn FnMut(&Value) -> Vec<Vec<u8>> + Send>;

/// Behavior of a mock modem instance.
pub struct MockConfig {
    pub responder: Responder,
    /// Raw frames written on the command connection before anything else.
    pub greeting: Vec<Vec<u8>>,
    /// Frames written on the PCM port once a client connects, paced so the
    /// client sees one frame per read. `None` makes the PCM port a sink.
    pub pcm_feed: Option<Vec<Vec<u8>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            responder: Box::new(|_| Vec::new()),
            greeting: Vec::new(),
            pcm_feed: None,
        }
    }
}

pub struct MockModem {
    pub endpoint: Endpoint,
    /// Every command decoded on the command port, in arrival order.
    pub commands: Arc<Mutex<Vec<Value>>>,
    /// Everything received on the data port.
    pub data_bytes: Arc<Mutex<Vec<u8>>>,
    /// Number of connections accepted on the data port.
    pub data_connections: Arc<AtomicUsize>,
    /// Everything received on the PCM port (sink mode).
    pub pcm_bytes: Arc<Mutex<Vec<u8>>>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    _io_listener: TcpListener,
}

impl MockModem {
    pub fn start(config: MockConfig) -> Self {
        let (listeners, base) = bind_consecutive_ports();
        let endpoint = Endpoint::new("127.0.0.1", base);
        let mut listeners = listeners.into_iter();
        let cmd_listener = listeners.next().unwrap();
        let data_listener = listeners.next().unwrap();
        let pcm_listener = listeners.next().unwrap();
        let io_listener = listeners.next().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let data_bytes = Arc::new(Mutex::new(Vec::new()));
        let data_connections = Arc::new(AtomicUsize::new(0));
        let pcm_bytes = Arc::new(Mutex::new(Vec::new()));

        let mut threads = Vec::new();

        {
            let running = Arc::clone(&running);
            let commands = Arc::clone(&commands);
            let mut responder = config.responder;
            let greeting = config.greeting;
            threads.push(thread::spawn(move || {
                accept_loop(cmd_listener, &running, |stream, running| {
                    serve_command_port(stream, running, &commands, &mut responder, &greeting);
                });
            }));
        }

        {
            let running = Arc::clone(&running);
            let data_bytes = Arc::clone(&data_bytes);
            let data_connections = Arc::clone(&data_connections);
            threads.push(thread::spawn(move || {
                accept_loop(data_listener, &running, |stream, running| {
                    data_connections.fetch_add(1, Ordering::SeqCst);
                    sink(stream, running, &data_bytes);
                });
            }));
        }

        {
            let running = Arc::clone(&running);
            let pcm_bytes = Arc::clone(&pcm_bytes);
            let pcm_feed = config.pcm_feed;
            threads.push(thread::spawn(move || {
                accept_loop(pcm_listener, &running, |stream, running| {
                    match &pcm_feed {
                        Some(frames) => feed_frames(stream, running, frames),
                        None => sink(stream, running, &pcm_bytes),
                    }
                });
            }));
        }

        Self {
            endpoint,
            commands,
            data_bytes,
            data_connections,
            pcm_bytes,
            running,
            threads,
            _io_listener: io_listener,
        }
    }

    /// Snapshot of the decoded commands received so far.
    pub fn received_commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    /// Poll until `predicate` holds over the received commands.
    pub fn wait_for_commands(&self, predicate: impl Fn(&[Value]) -> bool) {
        wait_for(|| predicate(&self.commands.lock().unwrap()));
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for MockModem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A reply frame as the device emits it: console prefix, JSON, CR.
pub fn reply_frame(value: &Value) -> Vec<u8> {
    format!("Modem Status:{}\r", value).into_bytes()
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Bind four consecutive localhost ports, retrying on collisions.
fn bind_consecutive_ports() -> (Vec<TcpListener>, u16) {
    for _ in 0..50 {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);
        if base > u16::MAX - 4 {
            continue;
        }
        let listeners: Option<Vec<TcpListener>> = (0..4)
            .map(|offset| TcpListener::bind(("127.0.0.1", base + offset)).ok())
            .collect();
        if let Some(listeners) = listeners {
            return (listeners, base);
        }
    }
    panic!("could not allocate four consecutive ports");
}

fn accept_loop(
    listener: TcpListener,
    running: &AtomicBool,
    mut handler: impl FnMut(TcpStream, &AtomicBool),
) {
    listener.set_nonblocking(true).unwrap();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_millis(50)))
                    .unwrap();
                handler(stream, running);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }
    }
}

fn serve_command_port(
    mut stream: TcpStream,
    running: &AtomicBool,
    commands: &Mutex<Vec<Value>>,
    responder: &mut Responder,
    greeting: &[Vec<u8>],
) {
    for frame in greeting {
        let _ = stream.write_all(frame);
    }

    let mut pending = Vec::new();
    let mut buf = [0u8; 512];
    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let Ok(command) = serde_json::from_slice::<Value>(&line) else {
                        continue;
                    };
                    let replies = responder(&command);
                    commands.lock().unwrap().push(command);
                    for reply in replies {
                        let _ = stream.write_all(&reply);
                    }
                }
            }
            Err(err) if is_timeout(&err) => continue,
            Err(_) => break,
        }
    }
}

fn sink(mut stream: TcpStream, running: &AtomicBool, captured: &Mutex<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => captured.lock().unwrap().extend_from_slice(&buf[..n]),
            Err(err) if is_timeout(&err) => continue,
            Err(_) => break,
        }
    }
}

fn feed_frames(mut stream: TcpStream, running: &AtomicBool, frames: &[Vec<u8>]) {
    for frame in frames {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if stream.write_all(frame).is_err() {
            return;
        }
        // Pace the frames so the client sees one per read.
        thread::sleep(Duration::from_millis(5));
    }
    // Keep the connection open until the client hangs up.
    let mut buf = [0u8; 64];
    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) if is_timeout(&err) => continue,
            Err(_) => break,
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
