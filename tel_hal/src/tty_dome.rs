//! Vendor dome controller on a serial line.
//!
//! The controller speaks fixed-format ASCII frames: a write is
//! `@00WD0010` followed by five 16-bit hex fields (control word, motion
//! word, dome position, high screen, low screen), an XOR checksum and
//! `*\r\n`; a read request is answered with the same five fields. Dome
//! position is tenths of a degree, so this backend reports positions in
//! tenths and installations using it configure 3600 counts per revolution.
//!
//! Motion has no script engine on this controller; the backend synthesizes
//! the shared progress-line protocol from status polls (at most one poll
//! per second, 1 ms readiness waits in between).

use crate::transport::{CounterSpace, MotorChannel, Program, TransportError};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::VecDeque;
use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// data0 bits
pub const RD_NOTREADY: u16 = 0x0004;
pub const RD_MANUAL: u16 = 0x0002;
pub const RW_EMG: u16 = 0x0001;

// data1 bits
pub const RD_SLIT_OPEN_LIMIT: u16 = 0x0080;
pub const RD_SLIT_CLOSE_LIMIT: u16 = 0x0040;
pub const RW_SLIT_OPEN: u16 = 0x0020;
pub const RW_SLIT_CLOSE: u16 = 0x0010;
pub const RW_DOME_CW: u16 = 0x0002;
pub const RW_DOME_CCW: u16 = 0x0001;
pub const WD_DOME_GOABS: u16 = 0x0004;

/// Status words as carried in one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DomeFrame {
    pub data0: u16,
    pub data1: u16,
    /// Dome azimuth, tenths of a degree.
    pub dome_pos: u16,
    pub hiscreen_pos: u16,
    pub loscreen_pos: u16,
}

/// XOR checksum over the frame body.
fn frame_fcs(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Build a command frame for the given words.
pub fn command_frame(f: &DomeFrame) -> String {
    let body = format!(
        "@00WD0010{:04X}{:04X}{:04X}{:04X}{:04X}",
        f.data0, f.data1, f.dome_pos, f.hiscreen_pos, f.loscreen_pos
    );
    format!("{body}{:02X}*\r\n", frame_fcs(&body))
}

/// Build the status read request frame.
pub fn read_request_frame() -> String {
    let body = "@00RD00100005";
    format!("{body}{:02X}*\r\n", frame_fcs(body))
}

/// Parse a status response frame; `None` if malformed or checksum fails.
pub fn parse_frame(line: &str) -> Option<DomeFrame> {
    let line = line.trim_end_matches(['\r', '\n', '*']);
    // Header + 5 fields + checksum.
    let header = "@00RD00";
    if !line.starts_with(header) || line.len() < header.len() + 5 * 4 + 2 {
        return None;
    }
    let body_end = header.len() + 5 * 4;
    let body = &line[..body_end];
    let fcs = u8::from_str_radix(&line[body_end..body_end + 2], 16).ok()?;
    if fcs != frame_fcs(body) {
        return None;
    }
    let field = |i: usize| {
        u16::from_str_radix(&body[header.len() + i * 4..header.len() + (i + 1) * 4], 16).ok()
    };
    Some(DomeFrame {
        data0: field(0)?,
        data1: field(1)?,
        dome_pos: field(2)?,
        hiscreen_pos: field(3)?,
        loscreen_pos: field(4)?,
    })
}

/// What the backend is currently watching for.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    Seek { target_tenths: i64, tol_tenths: i64 },
    RoofOpen,
    RoofClose,
}

/// A dome controller on a serial port.
pub struct TtyDome {
    path: String,
    fd: Option<OwnedFd>,
    cmd: DomeFrame,
    status: DomeFrame,
    status_valid: bool,
    pending: Option<Pending>,
    outbox: VecDeque<String>,
    rxbuf: Vec<u8>,
    last_poll: Option<Instant>,
}

/// Status poll cadence.
const POLL_PERIOD: Duration = Duration::from_secs(1);

impl TtyDome {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            fd: None,
            cmd: DomeFrame::default(),
            status: DomeFrame::default(),
            status_valid: false,
            pending: None,
            outbox: VecDeque::new(),
            rxbuf: Vec::new(),
            last_poll: None,
        }
    }

    fn fd_ref(&self) -> Result<&OwnedFd, TransportError> {
        self.fd.as_ref().ok_or(TransportError::NotOpen)
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        let fd = self.fd_ref()?;
        nix::unistd::write(fd, frame.as_bytes())
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
        Ok(())
    }

    fn push_command(&mut self) -> Result<(), TransportError> {
        let frame = command_frame(&self.cmd);
        debug!(frame = frame.trim(), "tty dome command");
        self.send(&frame)
    }

    /// 1 ms readiness check on the serial fd.
    fn readable(&self) -> bool {
        let Ok(fd) = self.fd_ref() else { return false };
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::from(1u8)), Ok(n) if n > 0)
    }

    /// Drain the serial buffer, parse any complete frame into `status`.
    fn pump(&mut self) {
        while self.readable() {
            let mut chunk = [0u8; 256];
            let Ok(fd) = self.fd_ref() else { return };
            match nix::unistd::read(fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        while let Some(cr) = self.rxbuf.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = self.rxbuf.drain(..=cr).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = parse_frame(&line) {
                self.status = frame;
                self.status_valid = true;
            } else if !line.trim().is_empty() {
                warn!(line = %line.trim(), "unparseable dome frame");
            }
        }
        self.evaluate_pending();
    }

    /// Ask for status at the poll cadence.
    fn maybe_request_status(&mut self) {
        let due = self
            .last_poll
            .map(|t| t.elapsed() >= POLL_PERIOD)
            .unwrap_or(true);
        if due && self.fd.is_some() {
            self.last_poll = Some(Instant::now());
            let _ = self.send(&read_request_frame());
        }
    }

    /// Convert fresh status into protocol lines for the active operation.
    fn evaluate_pending(&mut self) {
        if !self.status_valid {
            return;
        }
        if self.status.data0 & RD_NOTREADY != 0 || self.status.data0 & RW_EMG != 0 {
            if self.pending.take().is_some() {
                self.outbox.push_back("-1: controller not ready".into());
            }
            return;
        }
        match self.pending {
            Some(Pending::Seek {
                target_tenths,
                tol_tenths,
            }) => {
                let pos = i64::from(self.status.dome_pos);
                let mut err = (pos - target_tenths).rem_euclid(3600);
                if err > 1800 {
                    err -= 3600;
                }
                if err.abs() <= tol_tenths.max(1) {
                    self.pending = None;
                    self.outbox.push_back("0: azimuth reached".into());
                }
            }
            Some(Pending::RoofOpen) => {
                if self.status.data1 & RD_SLIT_OPEN_LIMIT != 0 {
                    self.pending = None;
                    self.outbox.push_back("0: open".into());
                }
            }
            Some(Pending::RoofClose) => {
                if self.status.data1 & RD_SLIT_CLOSE_LIMIT != 0 {
                    self.pending = None;
                    self.outbox.push_back("0: closed".into());
                }
            }
            None => {}
        }
    }
}

impl MotorChannel for TtyDome {
    fn open(&mut self) -> Result<(), TransportError> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        use nix::sys::termios::{
            cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
            LocalFlags, OutputFlags, SetArg,
        };

        if self.fd.is_some() {
            return Ok(());
        }
        let fd = open(
            self.path.as_str(),
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;

        let mut tio =
            tcgetattr(&fd).map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
        tio.input_flags = InputFlags::IGNBRK;
        tio.output_flags = OutputFlags::empty();
        tio.local_flags = LocalFlags::empty();
        tio.control_flags = ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
        cfsetispeed(&mut tio, BaudRate::B9600)
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
        cfsetospeed(&mut tio, BaudRate::B9600)
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
        tcsetattr(&fd, SetArg::TCSANOW, &tio)
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;

        self.fd = Some(fd);
        self.rxbuf.clear();
        self.status_valid = false;
        Ok(())
    }

    fn close(&mut self) {
        self.fd = None;
        self.pending = None;
        self.rxbuf.clear();
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn set_pos(&mut self, _space: CounterSpace, _counts: i64) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("tty dome: set_pos"))
    }

    fn set_vel(&mut self, _counts_per_s: i64) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("tty dome: set_vel"))
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        self.cmd.data1 &=
            !(RW_DOME_CW | RW_DOME_CCW | RW_SLIT_OPEN | RW_SLIT_CLOSE | WD_DOME_GOABS);
        self.push_command()
    }

    fn read_pos(&mut self, _space: CounterSpace) -> Result<i64, TransportError> {
        self.fd_ref()?;
        self.maybe_request_status();
        self.pump();
        Ok(i64::from(self.status.dome_pos))
    }

    fn read_vel(&mut self) -> Result<i64, TransportError> {
        // The controller does not report speed; motion is inferred from
        // the commanded bits.
        let moving = self.cmd.data1
            & (RW_DOME_CW | RW_DOME_CCW | RW_SLIT_OPEN | RW_SLIT_CLOSE | WD_DOME_GOABS);
        Ok(i64::from(moving != 0))
    }

    fn read_clock(&mut self) -> Result<i64, TransportError> {
        Err(TransportError::Unsupported("tty dome: clock"))
    }

    fn read_working(&mut self) -> Result<bool, TransportError> {
        Ok(self.pending.is_some())
    }

    fn run_program(&mut self, prog: &Program) -> Result<(), TransportError> {
        match prog {
            Program::DomeSeek {
                target_counts,
                tol_counts,
            } => {
                let target = target_counts.rem_euclid(3600);
                self.cmd.dome_pos = target as u16;
                self.cmd.data1 |= WD_DOME_GOABS;
                self.pending = Some(Pending::Seek {
                    target_tenths: target,
                    tol_tenths: *tol_counts,
                });
                self.push_command()
            }
            Program::RoofSeek { dir } => {
                self.cmd.data1 &= !(RW_SLIT_OPEN | RW_SLIT_CLOSE);
                match dir {
                    1 => {
                        self.cmd.data1 |= RW_SLIT_OPEN;
                        self.pending = Some(Pending::RoofOpen);
                    }
                    -1 => {
                        self.cmd.data1 |= RW_SLIT_CLOSE;
                        self.pending = Some(Pending::RoofClose);
                    }
                    _ => self.pending = None,
                }
                self.push_command()
            }
            Program::DomeJog { dir } => {
                self.cmd.data1 &= !(RW_DOME_CW | RW_DOME_CCW);
                if *dir > 0 {
                    self.cmd.data1 |= RW_DOME_CW;
                } else if *dir < 0 {
                    self.cmd.data1 |= RW_DOME_CCW;
                }
                self.push_command()
            }
            Program::DomeStop => self.stop(),
            // No homing needed: the controller reports absolute azimuth.
            Program::FindDomeHome => {
                self.outbox.push_back("0: homed".into());
                Ok(())
            }
            Program::DomeParams { .. } => Ok(()),
            _ => Err(TransportError::Unsupported("tty dome: program")),
        }
    }

    fn is_ready(&mut self) -> bool {
        if self.fd.is_some() {
            self.maybe_request_status();
            self.pump();
        }
        !self.outbox.is_empty()
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.fd_ref()?;
        Ok(self.outbox.pop_front())
    }

    fn interrupt(&mut self) -> Result<(), TransportError> {
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_xor_of_body() {
        assert_eq!(frame_fcs("@"), b'@');
        assert_eq!(frame_fcs("@@"), 0);
    }

    #[test]
    fn command_frame_shape() {
        let f = DomeFrame {
            data0: 0x0060,
            data1: RW_SLIT_OPEN,
            dome_pos: 1800,
            hiscreen_pos: 0,
            loscreen_pos: 0,
        };
        let s = command_frame(&f);
        assert!(s.starts_with("@00WD00100060"));
        assert!(s.ends_with("*\r\n"));
        // 5 hex fields of 4 chars each.
        assert_eq!(s.len(), "@00WD0010".len() + 20 + 2 + 3);
    }

    #[test]
    fn response_frame_roundtrip() {
        let f = DomeFrame {
            data0: 0x0060,
            data1: RD_SLIT_OPEN_LIMIT,
            dome_pos: 2477,
            hiscreen_pos: 10,
            loscreen_pos: 20,
        };
        let body = format!(
            "@00RD00{:04X}{:04X}{:04X}{:04X}{:04X}",
            f.data0, f.data1, f.dome_pos, f.hiscreen_pos, f.loscreen_pos
        );
        let line = format!("{body}{:02X}*\r", frame_fcs(&body));
        assert_eq!(parse_frame(&line), Some(f));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let body = "@00RD0000600080099D000A0014";
        let line = format!("{body}00*\r");
        assert_eq!(parse_frame(&line), None);
    }

    #[test]
    fn short_or_foreign_frames_are_rejected() {
        assert_eq!(parse_frame("@00RD0012"), None);
        assert_eq!(parse_frame("@00WD00100000000000000000000000*"), None);
        assert_eq!(parse_frame(""), None);
    }

    #[test]
    fn mount_style_ops_are_unsupported() {
        let mut d = TtyDome::new("/dev/null");
        assert!(matches!(
            d.set_pos(CounterSpace::Motor, 5),
            Err(TransportError::Unsupported(_))
        ));
        assert!(matches!(
            d.read_clock(),
            Err(TransportError::Unsupported(_))
        ));
    }
}
