//! Blocking client for the daemon socket
//!
//! Commands go out on a shared write half; events are read line by line from
//! a buffered read half. [`TreadmillClient::start_heartbeat`] runs a
//! dedicated thread so a busy caller never starves the watchdog.

use super::messages::{Event, IpcCommand};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default heartbeat period, well inside the daemon's 4 s timeout
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

struct Heartbeat {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct TreadmillClient {
    writer: Arc<Mutex<UnixStream>>,
    reader: BufReader<UnixStream>,
    /// Bytes of the current line, kept across read timeouts
    line: Vec<u8>,
    heartbeat: Option<Heartbeat>,
}

impl TreadmillClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        let reader = BufReader::new(stream.try_clone()?);
        log::debug!("Connected to {}", path.as_ref().display());
        Ok(Self {
            writer: Arc::new(Mutex::new(stream)),
            reader,
            line: Vec::new(),
            heartbeat: None,
        })
    }

    pub fn send(&self, cmd: IpcCommand) -> Result<()> {
        send_on(&self.writer, cmd)
    }

    /// Target speed in mph
    pub fn set_speed(&self, mph: f64) -> Result<()> {
        self.send(IpcCommand::Speed(mph))
    }

    /// Target incline in percent
    pub fn set_incline(&self, percent: i32) -> Result<()> {
        self.send(IpcCommand::Incline(percent))
    }

    pub fn set_emulate(&self, enabled: bool) -> Result<()> {
        self.send(IpcCommand::Emulate(enabled))
    }

    pub fn set_proxy(&self, enabled: bool) -> Result<()> {
        self.send(IpcCommand::Proxy(enabled))
    }

    pub fn request_status(&self) -> Result<()> {
        self.send(IpcCommand::Status)
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.send(IpcCommand::Heartbeat)
    }

    pub fn quit(&self) -> Result<()> {
        self.send(IpcCommand::Quit)
    }

    /// Send heartbeats every `interval` from a background thread
    pub fn start_heartbeat(&mut self, interval: Duration) -> Result<()> {
        self.stop_heartbeat();

        let running = Arc::new(AtomicBool::new(true));
        let writer = Arc::clone(&self.writer);
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    if let Err(e) = send_on(&writer, IpcCommand::Heartbeat) {
                        log::warn!("Heartbeat failed, stopping: {}", e);
                        break;
                    }
                    thread::sleep(interval);
                }
            })?;

        self.heartbeat = Some(Heartbeat { running, handle });
        Ok(())
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.running.store(false, Ordering::Relaxed);
            if hb.handle.join().is_err() {
                log::error!("Heartbeat thread panicked");
            }
        }
    }

    /// Bound how long [`next_event`](Self::next_event) blocks
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.reader.get_ref().set_read_timeout(timeout)?)
    }

    /// Next event from the daemon
    ///
    /// `Ok(None)` means the daemon closed the connection. Lines that do not
    /// parse as events are skipped. A read timeout surfaces as an I/O error
    /// of kind `WouldBlock` or `TimedOut`; a line cut by the timeout is
    /// completed by the next call.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            let event = match std::str::from_utf8(&self.line) {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => Event::from_line(text)
                    .map_err(|e| log::debug!("Skipping unparseable line {:?}: {}", text, e))
                    .ok(),
                Err(e) => {
                    log::debug!("Skipping non-UTF-8 line: {}", e);
                    None
                }
            };
            self.line.clear();
            if let Some(event) = event {
                return Ok(Some(event));
            }
        }
    }
}

impl Drop for TreadmillClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn send_on(writer: &Mutex<UnixStream>, cmd: IpcCommand) -> Result<()> {
    let line = cmd
        .to_line()
        .ok_or_else(|| Error::InvalidParameter("cannot send an unknown command".to_string()))?;
    let mut stream = writer.lock();
    match stream.write_all(line.as_bytes()) {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            Err(Error::Other("daemon closed the connection".to_string()))
        }
        other => Ok(other?),
    }
}

/// True for errors produced by an expired read timeout
pub fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn pair() -> (tempfile::TempDir, UnixListener, TreadmillClient, UnixStream) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let client = TreadmillClient::connect(&path).unwrap();
        let (server, _) = listener.accept().unwrap();
        (dir, listener, client, server)
    }

    #[test]
    fn test_commands_on_the_wire() {
        let (_dir, _l, client, mut server) = pair();
        client.set_speed(2.5).unwrap();
        client.set_incline(4).unwrap();
        client.set_proxy(true).unwrap();
        drop(client);

        let mut text = String::new();
        server.read_to_string(&mut text).unwrap();
        let cmds: Vec<_> = text.lines().map(IpcCommand::parse).collect();
        assert_eq!(
            cmds,
            vec![IpcCommand::Speed(2.5), IpcCommand::Incline(4), IpcCommand::Proxy(true)]
        );
    }

    #[test]
    fn test_reads_events_and_skips_garbage() {
        let (_dir, _l, mut client, mut server) = pair();
        server
            .write_all(b"garbage\n\n{\"type\":\"error\",\"msg\":\"x\"}\n")
            .unwrap();
        drop(server);

        assert_eq!(client.next_event().unwrap(), Some(Event::error("x")));
        assert_eq!(client.next_event().unwrap(), None);
    }

    #[test]
    fn test_heartbeat_thread() {
        let (_dir, _l, mut client, mut server) = pair();
        client.start_heartbeat(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.stop_heartbeat();
        drop(client);

        let mut text = String::new();
        server.read_to_string(&mut text).unwrap();
        let beats = text.lines().filter(|l| IpcCommand::parse(l) == IpcCommand::Heartbeat).count();
        assert!(beats >= 2, "only {} heartbeats", beats);
    }

    #[test]
    fn test_line_split_by_timeout_is_kept() {
        let (_dir, _l, mut client, mut server) = pair();
        client.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        server.write_all(b"{\"type\":\"error\",").unwrap();
        let err = client.next_event().unwrap_err();
        assert!(is_timeout(&err));

        server.write_all(b"\"msg\":\"late\"}\n").unwrap();
        assert_eq!(client.next_event().unwrap(), Some(Event::error("late")));
    }

    #[test]
    fn test_read_timeout_reported() {
        let (_dir, _l, mut client, _server) = pair();
        client.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let err = client.next_event().unwrap_err();
        assert!(is_timeout(&err));
    }
}
