//! Telescope control daemon library.
//!
//! The daemon listens on per-device command fifos, steps one cooperative
//! state machine per device each poll, and publishes the live status
//! record through shared memory. The binary in `main.rs` wires these
//! modules to the filesystem; everything else is driveable in-process
//! against the virtual motion controllers, which is how the integration
//! tests run a full observatory without hardware.
//!
//! - [`ctx`] - shared daemon context (status record, site, mesh)
//! - [`fifos`] - the fifo command plane
//! - [`axisdrv`] - per-axis homing and limit-discovery sequences
//! - [`tel`] / [`track`] / [`cook`] - the mount
//! - [`dome`] - dome and shutter
//! - [`focus`] / [`focustemp`] - focuser and autofocus tables
//! - [`filter`] - filter wheel
//! - [`guard`] - the (inert) emergency-stop hook

pub mod axisdrv;
pub mod cook;
pub mod ctx;
pub mod dome;
pub mod error;
pub mod fifos;
pub mod filter;
pub mod focus;
pub mod focustemp;
pub mod guard;
pub mod tel;
pub mod track;

/// Sink for fifo responses: `code <= 0` terminates a command, `code > 0`
/// is intermediate progress.
pub trait Respond {
    fn send(&mut self, code: i32, text: &str);
}

/// Response collector for tests and internal broadcasts.
#[derive(Debug, Default)]
pub struct Replies(pub Vec<(i32, String)>);

impl Respond for Replies {
    fn send(&mut self, code: i32, text: &str) {
        self.0.push((code, text.to_string()));
    }
}

impl Replies {
    pub fn new() -> Self {
        Self::default()
    }

    /// The terminal (code <= 0) response, if one arrived.
    pub fn terminal(&self) -> Option<&(i32, String)> {
        self.0.iter().find(|(code, _)| *code <= 0)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}
