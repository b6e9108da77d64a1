//! Shared library for the telescope control daemon workspace.
//!
//! This crate carries everything more than one process (or crate) needs to
//! agree on:
//!
//! - [`state`] - device state enums published through shared memory
//! - [`motor`] - the per-motor record (`MotorInfo`) and axis identifiers
//! - [`axes`] - mount pointing-model parameters (`TelAxes`)
//! - [`wx`] - weather / auxiliary-sensor snapshot
//! - [`config`] - config-file loading and validation
//! - [`shm`] - the `TelStatShm` publication record and its seqlock
//!   writer/reader
//! - [`consts`] - protocol-wide constants

pub mod axes;
pub mod config;
pub mod consts;
pub mod motor;
pub mod shm;
pub mod state;
pub mod wx;
