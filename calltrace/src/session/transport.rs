//! Unix-socket transport between in-process agents and the host
//!
//! Each agent opens one stream connection and writes frames on it (see
//! `calltrace_common` for the layout). The host writes single control bytes
//! back. One reader thread per connection decodes frame boundaries and
//! forwards raw frames to the session's channel; it never interprets them.

use anyhow::{Context, Result};
use calltrace_common::{FrameHeader, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{AgentId, Inbound};

/// How often the accept loop checks for shutdown
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Connections = Arc<Mutex<HashMap<AgentId, UnixStream>>>;

/// Listens for agents and keeps a write handle to each of them
pub struct AgentServer {
    path: PathBuf,
    connections: Connections,
    accepting: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl AgentServer {
    /// Bind the socket and start accepting agents
    ///
    /// A stale socket file left by an earlier run is replaced.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound
    pub fn bind(path: impl AsRef<Path>, tx: Sender<Inbound>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind agent socket {}", path.display()))?;
        listener.set_nonblocking(true).context("Failed to make agent socket non-blocking")?;
        info!("Waiting for agents on {}", path.display());

        let connections: Connections = Arc::default();
        let accepting = Arc::new(AtomicBool::new(true));

        let accept_thread = {
            let connections = Arc::clone(&connections);
            let accepting = Arc::clone(&accepting);
            thread::Builder::new()
                .name("calltrace-accept".to_string())
                .spawn(move || accept_loop(&listener, &connections, &accepting, &tx))
                .context("Failed to spawn accept thread")?
        };

        Ok(Self { path, connections, accepting, accept_thread: Some(accept_thread) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Agents currently connected
    #[must_use]
    pub fn connected(&self) -> usize {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Refuse agents that connect from now on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Send one control byte to every connected agent
    ///
    /// Returns how many agents were reached. An agent whose socket is already
    /// gone is skipped; its reader thread reports the disconnect.
    ///
    /// # Errors
    /// Never fails today; kept fallible for transports that can
    pub fn broadcast(&self, control: u8) -> Result<usize> {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut reached = 0;
        for (agent, stream) in connections.iter_mut() {
            match stream.write_all(&[control]).and_then(|()| stream.flush()) {
                Ok(()) => reached += 1,
                Err(e) => debug!("agent {agent}: control byte 0x{control:02x} not delivered: {e}"),
            }
        }
        Ok(reached)
    }

    fn shutdown(&mut self) {
        self.stop_accepting();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: &UnixListener,
    connections: &Connections,
    accepting: &AtomicBool,
    tx: &Sender<Inbound>,
) {
    static NEXT_AGENT: AtomicU64 = AtomicU64::new(1);

    while accepting.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                warn!("Failed to accept agent connection: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };

        let agent = NEXT_AGENT.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = register(agent, stream, connections, tx) {
            warn!("agent {agent}: {e:#}");
        }
    }
    debug!("Accept loop stopped");
}

fn register(
    agent: AgentId,
    stream: UnixStream,
    connections: &Connections,
    tx: &Sender<Inbound>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let reader = stream.try_clone().context("Failed to clone agent stream")?;

    // Connected must be queued before any frame of this agent.
    if tx.send(Inbound::Connected { agent }).is_err() {
        return Ok(());
    }
    connections.lock().unwrap_or_else(PoisonError::into_inner).insert(agent, stream);
    info!("agent {agent} connected");

    let connections = Arc::clone(connections);
    let tx = tx.clone();
    thread::Builder::new()
        .name(format!("calltrace-agent-{agent}"))
        .spawn(move || {
            read_frames(agent, reader, &tx);
            connections.lock().unwrap_or_else(PoisonError::into_inner).remove(&agent);
            let _ = tx.send(Inbound::Disconnected { agent });
        })
        .context("Failed to spawn agent reader")?;
    Ok(())
}

/// Forward frames until the agent closes the connection or sends garbage
fn read_frames(agent: AgentId, mut stream: UnixStream, tx: &Sender<Inbound>) {
    loop {
        let result = read_frame(&mut stream);
        let message = match result {
            Ok(Some((header, payload))) => Inbound::Frame { agent, header, payload },
            Ok(None) => {
                debug!("agent {agent} closed its connection");
                return;
            }
            Err(e) => Inbound::TransportError { agent, message: e.to_string() },
        };
        let failed = matches!(message, Inbound::TransportError { .. });
        if tx.send(message).is_err() || failed {
            return;
        }
    }
}

/// Read one frame; `None` on a clean close between frames
///
/// # Errors
/// Returns an error on a close in the middle of a frame, an oversized
/// payload, or any socket error
pub fn read_frame<R: Read>(stream: &mut R) -> io::Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        match stream.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} header bytes"),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let header = FrameHeader::decode(&header);
    if header.len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {MAX_FRAME_PAYLOAD} byte limit", header.len),
        ));
    }

    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

/// Write one frame the way an agent does
///
/// # Errors
/// Returns an error if the payload is too large or the write fails
pub fn write_frame<W: Write>(stream: &mut W, pid: i32, tid: i32, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_PAYLOAD)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "frame payload too large"))?;
    stream.write_all(&FrameHeader { pid, tid, len }.encode())?;
    stream.write_all(payload)
}
