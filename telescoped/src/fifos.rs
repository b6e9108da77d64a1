//! The fifo command plane.
//!
//! One pair per device, named from the server's perspective: commands
//! arrive on `<Device>.in`, responses leave on `<Device>.out`. Requests
//! are ASCII lines; responses are `"<code> <text>"` where `code < 0` is
//! fatal, `0` completion and `> 0` intermediate progress. Every command
//! gets at least one response, and nothing follows a `code <= 0` line.
//!
//! Both ends are opened `O_RDWR | O_NONBLOCK` so the daemon neither sees
//! EOF when a client disconnects nor blocks when no reader is attached.

use crate::Respond;
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// The device channels this daemon serves.
pub const FIFO_NAMES: [&str; 6] = ["Tel", "Dome", "Focus", "Filter", "Lights", "Power"];

#[derive(Debug, Error)]
pub enum FifoError {
    #[error("fifo {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_err(path: &Path, e: nix::errno::Errno) -> FifoError {
    FifoError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    }
}

/// One device's command/response pair.
pub struct FifoPair {
    name: &'static str,
    in_fd: OwnedFd,
    out_fd: OwnedFd,
    rxbuf: Vec<u8>,
}

impl FifoPair {
    /// Create (if needed) and open the pair under `dir`.
    pub fn create(dir: &Path, name: &'static str) -> Result<Self, FifoError> {
        std::fs::create_dir_all(dir).map_err(|source| FifoError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let in_path = dir.join(format!("{name}.in"));
        let out_path = dir.join(format!("{name}.out"));

        for path in [&in_path, &out_path] {
            match mkfifo(path.as_path(), Mode::from_bits_truncate(0o664)) {
                Ok(()) => {}
                Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(io_err(path, e)),
            }
        }

        let flags = OFlag::O_RDWR | OFlag::O_NONBLOCK;
        let in_fd = open(in_path.as_path(), flags, Mode::empty())
            .map_err(|e| io_err(&in_path, e))?;
        let out_fd = open(out_path.as_path(), flags, Mode::empty())
            .map_err(|e| io_err(&out_path, e))?;

        Ok(Self {
            name,
            in_fd,
            out_fd,
            rxbuf: Vec::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drain available bytes and return the next complete request line.
    pub fn try_read_line(&mut self) -> Option<String> {
        let mut chunk = [0u8; 512];
        loop {
            match nix::unistd::read(&self.in_fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => {
                    warn!(fifo = self.name, "read error: {e}");
                    break;
                }
            }
        }
        let nl = self.rxbuf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.rxbuf.drain(..=nl).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            return self.try_read_line();
        }
        Some(line)
    }

    /// Write one response line. A full pipe (no reader draining) drops
    /// the line rather than stalling the loop.
    pub fn write_response(&mut self, code: i32, text: &str) {
        let line = format!("{code} {text}\n");
        debug!(fifo = self.name, code, text, "response");
        if let Err(e) = nix::unistd::write(&self.out_fd, line.as_bytes()) {
            if e != nix::errno::Errno::EAGAIN {
                warn!(fifo = self.name, "write error: {e}");
            }
        }
    }
}

impl Respond for FifoPair {
    fn send(&mut self, code: i32, text: &str) {
        self.write_response(code, text);
    }
}

/// Wait up to `timeout_ms` for any command fifo to become readable.
/// Returns the indices with pending input.
pub fn wait_readable(pairs: &[FifoPair], timeout_ms: u16) -> Vec<usize> {
    let mut fds: Vec<PollFd> = pairs
        .iter()
        .map(|p| PollFd::new(p.in_fd.as_fd(), PollFlags::POLLIN))
        .collect();

    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(n) if n > 0 => fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| {
                fd.revents()
                    .map(|r| r.contains(PollFlags::POLLIN))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn request_and_response_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut pair = FifoPair::create(dir.path(), "Tel").unwrap();

        // No traffic yet.
        assert_eq!(pair.try_read_line(), None);

        // A client writes a command into Tel.in...
        let mut client_in = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("Tel.in"))
            .unwrap();
        client_in.write_all(b"getmjd\n").unwrap();

        assert_eq!(pair.try_read_line().as_deref(), Some("getmjd"));
        assert_eq!(pair.try_read_line(), None);

        // ...and reads the response from Tel.out.
        pair.write_response(0, "51544.5");
        let mut client_out = std::fs::OpenOptions::new()
            .read(true)
            .open(dir.path().join("Tel.out"))
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client_out.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0 51544.5\n");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut pair = FifoPair::create(dir.path(), "Dome").unwrap();
        let mut client = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("Dome.in"))
            .unwrap();
        client.write_all(b"\n\n  \nauto\n").unwrap();
        assert_eq!(pair.try_read_line().as_deref(), Some("auto"));
    }

    #[test]
    fn poll_reports_pending_input() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = vec![
            FifoPair::create(dir.path(), "Tel").unwrap(),
            FifoPair::create(dir.path(), "Focus").unwrap(),
        ];

        assert!(wait_readable(&pairs, 10).is_empty());

        let mut client = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("Focus.in"))
            .unwrap();
        client.write_all(b"auto\n").unwrap();

        let ready = wait_readable(&pairs, 100);
        assert_eq!(ready, vec![1]);
    }

    #[test]
    fn recreate_over_existing_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let _first = FifoPair::create(dir.path(), "Lights").unwrap();
        // A second daemon start finds the fifos already present.
        let _second = FifoPair::create(dir.path(), "Lights").unwrap();
    }
}
