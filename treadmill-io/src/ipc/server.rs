//! Unix-domain socket server
//!
//! Single-threaded and poll-driven: one [`IpcServer::poll`] call waits up to
//! the given timeout for activity, accepts at most one new client, reads
//! commands from every ready client, then flushes each client's ring backlog.
//!
//! ```text
//!             ┌──────────────┐ accept  ┌──────────┐
//! listener ──▶│  poll(2)     │────────▶│ clients  │ (≤ MAX_CLIENTS)
//!             │  ≤ timeout   │  read   │ buf+cursor│
//!             └──────────────┘────────▶└────┬─────┘
//!                                           │ lines → IpcCommand → on_command
//!        EventRing ── drain_since(cursor) ──┘ → outbox → write
//! ```
//!
//! # Client lifecycle
//!
//! - New clients start at the ring's current total and only see later events
//! - A fifth connection receives `{"type":"error","msg":"too many clients"}`
//!   and is closed
//! - EOF or a hard socket error removes the client and reports the remaining
//!   count to `on_disconnect`
//! - A partial line longer than [`CMD_BUF_SIZE`] is discarded

use super::messages::{Event, IpcCommand};
use crate::core::EventRing;
use crate::error::{Error, Result};
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MAX_CLIENTS: usize = 4;

/// Per-client partial line buffer
pub const CMD_BUF_SIZE: usize = 1024;

/// Upper bound on one `poll` wait used by the controller
pub const POLL_TIMEOUT: Duration = Duration::from_millis(20);

struct Client {
    id: u64,
    stream: UnixStream,
    buf: [u8; CMD_BUF_SIZE],
    len: usize,
    /// Next ring sequence number owed to this client
    cursor: u64,
    /// Drained but not yet written
    outbox: Vec<u8>,
}

impl Client {
    fn new(id: u64, stream: UnixStream, cursor: u64) -> Self {
        Self {
            id,
            stream,
            buf: [0u8; CMD_BUF_SIZE],
            len: 0,
            cursor,
            outbox: Vec::new(),
        }
    }

    /// Read what is available and hand out complete lines
    ///
    /// Returns `false` once the client is gone.
    fn receive<C: FnMut(IpcCommand)>(&mut self, on_command: &mut C) -> bool {
        if self.len == CMD_BUF_SIZE {
            log::warn!("IPC client {}: line exceeds {} bytes, discarded", self.id, CMD_BUF_SIZE);
            self.len = 0;
        }

        let n = match self.stream.read(&mut self.buf[self.len..]) {
            Ok(0) => return false,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return true;
            }
            Err(e) => {
                log::debug!("IPC client {}: read failed: {}", self.id, e);
                return false;
            }
        };
        self.len += n;

        let mut start = 0;
        while let Some(pos) = self.buf[start..self.len].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + pos];
            start += pos + 1;

            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match IpcCommand::parse(line) {
                IpcCommand::Unknown => log::debug!("IPC client {}: ignoring {:?}", self.id, line),
                cmd => on_command(cmd),
            }
        }
        self.buf.copy_within(start..self.len, 0);
        self.len -= start;
        true
    }

    /// Top up the outbox from the ring and write as much as the socket takes
    ///
    /// Returns `false` on a hard write failure.
    fn flush(&mut self, ring: &EventRing) -> bool {
        if self.outbox.is_empty() {
            let drain = ring.drain_since(self.cursor, &mut self.outbox);
            if drain.skipped > 0 {
                log::warn!("IPC client {}: fell behind, {} events lost", self.id, drain.skipped);
            }
            self.cursor = drain.cursor;
        }

        let mut written = 0;
        while written < self.outbox.len() {
            match self.stream.write(&self.outbox[written..]) {
                Ok(0) => return false,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("IPC client {}: write failed: {}", self.id, e);
                    return false;
                }
            }
        }
        self.outbox.drain(..written);
        true
    }
}

/// Command/event server on a Unix socket
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    ring: Arc<EventRing>,
    clients: Vec<Client>,
    next_id: u64,
}

impl IpcServer {
    /// Bind `path`, replacing any stale socket file
    pub fn bind<P: AsRef<Path>>(path: P, ring: Arc<EventRing>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;
        listener.set_nonblocking(true)?;
        log::info!("IPC server listening on {}", path.display());

        Ok(Self {
            listener,
            path,
            ring,
            clients: Vec::with_capacity(MAX_CLIENTS),
            next_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Wait up to `timeout`, service the listener and clients once
    pub fn poll<C, D>(&mut self, timeout: Duration, mut on_command: C, mut on_disconnect: D) -> Result<()>
    where
        C: FnMut(IpcCommand),
        D: FnMut(usize),
    {
        let ready = self.wait(timeout)?;

        if ready[0] {
            self.accept();
        }

        let mut alive = vec![true; self.clients.len()];
        for (i, client) in self.clients.iter_mut().enumerate() {
            if ready.get(i + 1).copied().unwrap_or(false) {
                alive[i] = client.receive(&mut on_command);
            }
        }
        self.remove_dead(&alive, &mut on_disconnect);

        let ring = Arc::clone(&self.ring);
        let alive: Vec<bool> = self.clients.iter_mut().map(|c| c.flush(&ring)).collect();
        self.remove_dead(&alive, &mut on_disconnect);
        Ok(())
    }

    /// `poll(2)` over the listener and clients; index 0 is the listener
    fn wait(&self, timeout: Duration) -> Result<Vec<bool>> {
        let mut fds: Vec<libc::pollfd> = std::iter::once(self.listener.as_raw_fd())
            .chain(self.clients.iter().map(|c| c.stream.as_raw_fd()))
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: fds is a valid, exclusively borrowed array of fds.len() pollfd
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(vec![false; fds.len()]);
            }
            return Err(Error::Io(err));
        }

        Ok(fds
            .iter()
            .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .collect())
    }

    fn accept(&mut self) {
        let mut stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("IPC accept failed: {}", e);
                return;
            }
        };

        if self.clients.len() >= MAX_CLIENTS {
            log::warn!("IPC client rejected: {} already connected", MAX_CLIENTS);
            match Event::error("too many clients").to_line() {
                Ok(line) => {
                    if let Err(e) = stream.write_all(line.as_bytes()) {
                        log::debug!("Rejection notice not delivered: {}", e);
                    }
                }
                Err(e) => log::warn!("Rejection notice not encoded: {}", e),
            }
            return;
        }

        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("IPC client dropped, cannot set non-blocking: {}", e);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.clients.push(Client::new(id, stream, self.ring.total()));
        log::info!("IPC client {} connected ({} total)", id, self.clients.len());
    }

    fn remove_dead<D: FnMut(usize)>(&mut self, alive: &[bool], on_disconnect: &mut D) {
        let mut index = 0;
        let mut gone = Vec::new();
        self.clients.retain(|client| {
            let keep = alive.get(index).copied().unwrap_or(true);
            index += 1;
            if !keep {
                gone.push(client.id);
            }
            keep
        });

        let mut remaining = self.clients.len() + gone.len();
        for id in gone {
            remaining -= 1;
            log::info!("IPC client {} disconnected ({} remaining)", id, remaining);
            on_disconnect(remaining);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.clients.clear();
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            log::warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}
