//! Controller nodes reached through the CSI gateway daemon.
//!
//! The gateway owns the controller network and its packet framing; each
//! connection here is one node's script session: program text goes down,
//! status lines come back. Two sessions per device (one for commands, one
//! for status reads) is the usual arrangement, mirrored by the device state
//! machines owning two `CsiNode`s.

use crate::transport::{CounterSpace, MotorChannel, Program, TransportError};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default TCP port of the CSI gateway daemon.
pub const CSIMCD_PORT: u16 = 7623;

/// Interrupt byte: the gateway maps ETX to a controller interrupt packet.
const INTR_BYTE: u8 = 0x03;

/// Bound on one read transaction (write request, await reply line).
const REPLY_TIMEOUT: Duration = Duration::from_millis(250);

/// Bound on a blocked write draining.
const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// One script session with a controller node.
pub struct CsiNode {
    addr: i32,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    rxbuf: Vec<u8>,
}

impl CsiNode {
    /// Session for controller node `addr` via the gateway at `host:port`.
    pub fn new(addr: i32, host: &str, port: u16) -> Self {
        Self {
            addr,
            host: host.to_string(),
            port,
            stream: None,
            rxbuf: Vec::new(),
        }
    }

    /// The controller node address this session is attached to.
    pub fn addr(&self) -> i32 {
        self.addr
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }

    /// Write program text, waiting briefly if the socket back-pressures.
    fn write_wire(&mut self, wire: &str) -> Result<(), TransportError> {
        let mut data = wire.as_bytes().to_vec();
        data.push(b'\n');
        let stream = self.stream_mut()?;
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut off = 0;
        while off < data.len() {
            match stream.write(&data[off..]) {
                Ok(n) => off += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::ReplyTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drain whatever the socket has without blocking.
    fn pump(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 512];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break, // peer gone; read_line will come up empty
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(node = self.addr, "csi read error: {e}");
                    break;
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let nl = self.rxbuf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.rxbuf.drain(..=nl).collect();
        let s = String::from_utf8_lossy(&line).trim().to_string();
        Some(s)
    }

    /// Issue a value read (`=reg;`) and wait, bounded, for the reply.
    fn transact_int(&mut self, wire: &str) -> Result<i64, TransportError> {
        self.write_wire(wire)?;
        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            self.pump();
            if let Some(line) = self.take_line() {
                return line
                    .trim()
                    .parse()
                    .map_err(|_| TransportError::BadReply(line));
            }
            if Instant::now() >= deadline {
                return Err(TransportError::ReplyTimeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl MotorChannel for CsiNode {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let sockaddr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad gateway address {}:{}", self.host, self.port),
                ))
            })?;
        let stream = TcpStream::connect_timeout(&sockaddr, Duration::from_secs(2))?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.rxbuf.clear();

        // Attach this session to its node.
        let attach = format!("attach({});", self.addr);
        self.write_wire(&attach)?;
        debug!(node = self.addr, "csi session open");
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.rxbuf.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn set_pos(&mut self, space: CounterSpace, counts: i64) -> Result<(), TransportError> {
        self.run_program(&Program::SetTargetPos { space, counts })
    }

    fn set_vel(&mut self, counts_per_s: i64) -> Result<(), TransportError> {
        self.run_program(&Program::SetVelocity { counts_per_s })
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.set_vel(0)
    }

    fn read_pos(&mut self, space: CounterSpace) -> Result<i64, TransportError> {
        match space {
            CounterSpace::Encoder => self.transact_int("=epos;"),
            CounterSpace::Motor => self.transact_int("=mpos;"),
        }
    }

    fn read_vel(&mut self) -> Result<i64, TransportError> {
        self.transact_int("=mvel;")
    }

    fn read_clock(&mut self) -> Result<i64, TransportError> {
        self.transact_int("=clock;")
    }

    fn read_working(&mut self) -> Result<bool, TransportError> {
        Ok(self.transact_int("=working;")? != 0)
    }

    fn run_program(&mut self, prog: &Program) -> Result<(), TransportError> {
        self.write_wire(&prog.wire())
    }

    fn is_ready(&mut self) -> bool {
        self.pump();
        self.rxbuf.contains(&b'\n')
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotOpen);
        }
        self.pump();
        Ok(self.take_line())
    }

    fn interrupt(&mut self) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        stream.write_all(&[INTR_BYTE])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    /// A gateway stand-in that answers every read with a fixed value.
    fn fake_gateway(reply: &'static str) -> (SocketAddr, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim().to_string();
                        let is_read = line.starts_with('=');
                        lines.push(line);
                        if is_read {
                            writer.write_all(reply.as_bytes()).unwrap();
                            writer.write_all(b"\n").unwrap();
                        }
                    }
                }
            }
            lines
        });
        (addr, handle)
    }

    #[test]
    fn open_attaches_and_reads_position() {
        let (addr, handle) = fake_gateway("123456");
        let mut node = CsiNode::new(7, &addr.ip().to_string(), addr.port());
        node.open().unwrap();
        assert!(node.is_open());

        let pos = node.read_pos(CounterSpace::Encoder).unwrap();
        assert_eq!(pos, 123_456);

        node.run_program(&Program::ZeroClock).unwrap();
        node.close();

        let seen = handle.join().unwrap();
        assert_eq!(seen[0], "attach(7);");
        assert_eq!(seen[1], "=epos;");
        assert_eq!(seen[2], "clock=0;");
    }

    #[test]
    fn bad_reply_is_an_error() {
        let (addr, _handle) = fake_gateway("not-a-number");
        let mut node = CsiNode::new(1, &addr.ip().to_string(), addr.port());
        node.open().unwrap();
        assert!(matches!(
            node.read_vel(),
            Err(TransportError::BadReply(_))
        ));
    }

    #[test]
    fn closed_node_refuses_io() {
        let mut node = CsiNode::new(1, "127.0.0.1", 1);
        assert!(matches!(node.read_vel(), Err(TransportError::NotOpen)));
        assert!(!node.is_open());
    }
}
