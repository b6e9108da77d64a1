//! The `TelStatShm` publication record and its seqlock writer/reader.
//!
//! The daemon is the only writer; UI and queue processes attach read-only.
//! The mapped segment is a versioned header followed by the payload:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ ShmHeader (64 B) │ TelStatShm (fixed, repr(C))  │
//! └──────────────────┴──────────────────────────────┘
//! ```
//!
//! Readers that predate the seqlock may still read fields directly and
//! tolerate per-field torn values (all fields are naturally aligned
//! primitives); new readers use [`ShmReader::snapshot`] for a consistent
//! copy. The payload layout is append-only so separately compiled readers
//! keep working.

use crate::axes::TelAxes;
use crate::consts::{NMOT, TELSTATSHMKEY};
use crate::motor::MotorInfo;
use crate::state::{CoverState, DomeState, FilterState, ShutterState, TelState};
use crate::wx::WxStats;

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Magic bytes identifying a valid status segment.
pub const TELSTAT_MAGIC: [u8; 8] = *b"TELSTAT\0";

/// Shared-memory error type.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment has bad magic")]
    BadMagic,

    #[error("segment layout hash mismatch: ours {ours:#x}, theirs {theirs:#x}")]
    LayoutMismatch { ours: u32, theirs: u32 },

    #[error("segment too small: {0} bytes")]
    TooSmall(usize),

    #[error("writer did not settle within the retry budget")]
    Unstable,
}

/// Compile-time hash of the payload layout.
///
/// Changes whenever size or alignment change, so a reader built against a
/// different layout refuses to attach instead of misreading fields.
pub const fn layout_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E37_79B9) ^ align.wrapping_mul(0x517C_C1B7)
}

// ─── Header ─────────────────────────────────────────────────────────

/// Segment header, 64 bytes.
///
/// `write_seq` uses the odd/even protocol: odd while a publish is in
/// progress, even once committed. It is accessed as `AtomicU32` at runtime.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct ShmHeader {
    /// Must equal `TELSTAT_MAGIC`.
    pub magic: [u8; 8],
    /// `layout_hash::<TelStatShm>()` of the writer.
    pub layout_hash: u32,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// Publish counter; increments once per publish.
    pub heartbeat: u64,
    /// Seqlock word. Odd = publish in progress.
    pub write_seq: u32,
    pub _pad: [u8; 36],
}

static_assertions::const_assert_eq!(core::mem::size_of::<ShmHeader>(), 64);

// ─── Payload sub-records ────────────────────────────────────────────

/// Time and site circumstance, as consumed by the coordinate kernel.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NowShm {
    /// Modified Julian Date, UTC.
    pub mjd: f64,
    /// Site latitude, rad +N.
    pub lat: f64,
    /// Site longitude, rad +E.
    pub lng: f64,
    /// Timezone offset, hours west of UTC.
    pub tz: f64,
    /// Ambient temperature, °C.
    pub temp: f64,
    /// Atmospheric pressure, mB.
    pub pressure: f64,
    /// Elevation, earth radii above sea level.
    pub elev: f64,
    /// Epoch for computed places; `EOD_EPOCH` for apparent.
    pub epoch: f64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<NowShm>(), 64);

impl Default for NowShm {
    fn default() -> Self {
        // SAFETY: all fields numeric; zero is valid.
        unsafe { core::mem::zeroed() }
    }
}

/// The currently running observation block, if any.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Scan {
    /// Target name, NUL-terminated.
    pub name: [u8; 32],
    /// Catalog RA, rad.
    pub obj_ra: f64,
    /// Catalog Dec, rad.
    pub obj_dec: f64,
    /// Catalog epoch, MJD.
    pub obj_epoch: f64,
    /// Scheduled RA offset, rad.
    pub rao: f64,
    /// Scheduled Dec offset, rad.
    pub deco: f64,
    /// Unix time the scan started; 0 when idle.
    pub starttm: i64,
    /// Exposure duration, s.
    pub duration: i32,
    /// Scheduled filter, ASCII.
    pub filter: u8,
    /// Scan is running.
    pub running: u8,
    pub _pad: [u8; 2],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Scan>(), 88);

impl Default for Scan {
    fn default() -> Self {
        // SAFETY: all fields numeric or byte arrays; zero is valid.
        unsafe { core::mem::zeroed() }
    }
}

// ─── The published record ───────────────────────────────────────────

/// Everything observers may know about the telescope, in one record.
///
/// Field groups, in layout order: circumstance, pointing model, current
/// scan, weather, per-motor records, cooked (actual) coordinates, desired
/// coordinates, applied offsets, dome azimuths, then the state bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TelStatShm {
    pub now: NowShm,
    pub tax: TelAxes,
    pub scan: Scan,
    pub wxs: WxStats,
    /// Motor records indexed by `MotorId`.
    pub minfo: [MotorInfo; NMOT],

    // Cooked position, from encoders.
    pub calt: f64,
    pub caz: f64,
    pub cara: f64,
    pub cadec: f64,
    pub caha: f64,
    pub cj2kra: f64,
    pub cj2kdec: f64,
    pub cpa: f64,

    // Desired position, from the current objective.
    pub dalt: f64,
    pub daz: f64,
    pub dara: f64,
    pub dadec: f64,
    pub daha: f64,
    pub dj2kra: f64,
    pub dj2kdec: f64,
    pub dpa: f64,

    /// Mesh correction currently backed out of the cooked place, rad.
    pub mdha: f64,
    pub mddec: f64,
    /// Last jog offsets, rad.
    pub jdha: f64,
    pub jddec: f64,

    /// Current dome azimuth, rad E of N.
    pub domeaz: f64,
    /// Dome target azimuth, rad E of N.
    pub dometaz: f64,

    /// Suggested poll interval for readers, ms.
    pub dt: i32,

    pub telstate: u8,
    pub domestate: u8,
    pub shutterstate: u8,
    pub filterstate: u8,
    pub coverstate: u8,
    /// Dome follows telescope azimuth.
    pub autodome: u8,
    /// Focus follows filter and temperature.
    pub autofocus: u8,
    /// A tracking offset has been applied on the controllers.
    pub tracking_offset_applied: u8,
    /// An operator paddle motion is active.
    pub paddle_active: u8,
    /// Legacy flag: either of the two above.
    pub jogging_ison: u8,
    /// Current filter, ASCII.
    pub filter: u8,
    pub _pad: [u8; 1],
}

static_assertions::const_assert_eq!(core::mem::size_of::<TelStatShm>(), 1056);
static_assertions::const_assert_eq!(core::mem::align_of::<TelStatShm>(), 8);

impl Default for TelStatShm {
    fn default() -> Self {
        // SAFETY: every field is numeric, a byte array, or a nested
        // repr(C) struct of the same; zero is valid throughout.
        unsafe { core::mem::zeroed() }
    }
}

impl TelStatShm {
    #[inline]
    pub fn telstate(&self) -> TelState {
        TelState::from_u8(self.telstate).unwrap_or_default()
    }

    #[inline]
    pub fn domestate(&self) -> DomeState {
        DomeState::from_u8(self.domestate).unwrap_or_default()
    }

    #[inline]
    pub fn shutterstate(&self) -> ShutterState {
        ShutterState::from_u8(self.shutterstate).unwrap_or_default()
    }

    #[inline]
    pub fn filterstate(&self) -> FilterState {
        FilterState::from_u8(self.filterstate).unwrap_or_default()
    }

    #[inline]
    pub fn coverstate(&self) -> CoverState {
        CoverState::from_u8(self.coverstate).unwrap_or_default()
    }

    /// Recompute the legacy `jogging_ison` flag from its split parts.
    #[inline]
    pub fn refresh_jogging_flag(&mut self) {
        self.jogging_ison =
            u8::from(self.tracking_offset_applied != 0 || self.paddle_active != 0);
    }
}

/// Default filesystem path of the status segment.
pub fn default_segment_path() -> PathBuf {
    PathBuf::from(format!("/dev/shm/telstatshm-{TELSTATSHMKEY:08x}"))
}

// ─── Mapping ────────────────────────────────────────────────────────

const SEGMENT_LEN: usize =
    core::mem::size_of::<ShmHeader>() + core::mem::size_of::<TelStatShm>();

/// The mapped segment. Both ends hold a shared writable mapping; the
/// seqlock above it coordinates access.
struct ShmMap {
    map: MmapMut,
}

impl ShmMap {
    fn map(file: &std::fs::File) -> Result<Self, ShmError> {
        // SAFETY: shared mapping of a regular file; the length checks
        // below reject segments too small for the header + payload.
        let map = unsafe { MmapOptions::new().map_mut(file)? };
        if map.len() < SEGMENT_LEN {
            return Err(ShmError::TooSmall(map.len()));
        }
        Ok(Self { map })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }

    #[inline]
    fn header_ptr(&self) -> *mut ShmHeader {
        self.base().cast()
    }

    #[inline]
    fn payload_ptr(&self) -> *mut TelStatShm {
        // SAFETY: the segment is at least SEGMENT_LEN long (checked at
        // map time) and the payload follows the 64-byte header.
        unsafe { self.base().add(core::mem::size_of::<ShmHeader>()).cast() }
    }

    #[inline]
    fn seq(&self) -> &AtomicU32 {
        let off = core::mem::offset_of!(ShmHeader, write_seq);
        // SAFETY: write_seq is a naturally aligned u32 inside the mapping.
        unsafe { AtomicU32::from_ptr(self.base().add(off).cast()) }
    }

    #[inline]
    fn heartbeat(&self) -> &AtomicU64 {
        let off = core::mem::offset_of!(ShmHeader, heartbeat);
        // SAFETY: heartbeat is a naturally aligned u64 inside the mapping.
        unsafe { AtomicU64::from_ptr(self.base().add(off).cast()) }
    }
}

// ─── Writer ─────────────────────────────────────────────────────────

/// Exclusive publisher of the status segment.
pub struct ShmWriter {
    map: ShmMap,
}

impl ShmWriter {
    /// Create (or truncate) the segment at `path` and zero it.
    pub fn create(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(SEGMENT_LEN as u64)?;

        let mut map = ShmMap::map(&file)?;

        // Always start from a zeroed record.
        map.map.fill(0);
        // SAFETY: header area is mapped and at least 64 writable bytes.
        unsafe {
            let hdr = map.header_ptr();
            (*hdr).magic = TELSTAT_MAGIC;
            (*hdr).layout_hash = layout_hash::<TelStatShm>();
            (*hdr).payload_size = core::mem::size_of::<TelStatShm>() as u32;
        }

        Ok(Self { map })
    }

    /// Publish a new snapshot under the seqlock.
    pub fn publish(&mut self, stat: &TelStatShm) {
        let seq = self.map.seq();
        seq.fetch_add(1, Ordering::Relaxed); // now odd
        fence(Ordering::Release);

        // SAFETY: payload area is size_of::<TelStatShm>() writable bytes;
        // we are the only writer.
        unsafe {
            core::ptr::copy_nonoverlapping(stat, self.map.payload_ptr(), 1);
        }

        fence(Ordering::Release);
        seq.fetch_add(1, Ordering::Relaxed); // even again
        self.map.heartbeat().fetch_add(1, Ordering::Relaxed);
    }
}

// ─── Reader ─────────────────────────────────────────────────────────

/// Read-only view of the status segment.
pub struct ShmReader {
    map: ShmMap,
}

impl ShmReader {
    /// Attach to an existing segment and validate its header.
    ///
    /// The mapping is shared read-write so the seqlock word can be read
    /// atomically; a reader never stores through it.
    pub fn attach(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = ShmMap::map(&file)?;

        // SAFETY: header area is mapped and at least 64 bytes.
        let hdr = unsafe { *map.header_ptr() };
        if hdr.magic != TELSTAT_MAGIC {
            return Err(ShmError::BadMagic);
        }
        let ours = layout_hash::<TelStatShm>();
        if hdr.layout_hash != ours {
            return Err(ShmError::LayoutMismatch {
                ours,
                theirs: hdr.layout_hash,
            });
        }
        Ok(Self { map })
    }

    /// Take a consistent snapshot of the record.
    ///
    /// Retries while the writer holds the seqlock odd; gives up after a
    /// bounded number of attempts rather than spinning forever.
    pub fn snapshot(&self) -> Result<TelStatShm, ShmError> {
        let seq = self.map.seq();
        for _ in 0..1000 {
            let s1 = seq.load(Ordering::Acquire);
            if s1 % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: payload is mapped readable; a torn read here is
            // detected by the seq comparison below.
            let copy = unsafe { core::ptr::read(self.map.payload_ptr()) };
            fence(Ordering::Acquire);
            let s2 = seq.load(Ordering::Acquire);
            if s1 == s2 {
                return Ok(copy);
            }
        }
        Err(ShmError::Unstable)
    }

    /// Publish counter, for staleness detection.
    pub fn heartbeat(&self) -> u64 {
        self.map.heartbeat().load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::MotorId;

    #[test]
    fn payload_layout_is_stable() {
        assert_eq!(core::mem::size_of::<TelStatShm>(), 1056);
        assert_eq!(core::mem::size_of::<ShmHeader>(), 64);
    }

    #[test]
    fn layout_hash_distinguishes_types() {
        assert_ne!(layout_hash::<TelStatShm>(), layout_hash::<ShmHeader>());
        assert_eq!(layout_hash::<TelStatShm>(), layout_hash::<TelStatShm>());
    }

    #[test]
    fn default_record_is_quiescent() {
        let stat = TelStatShm::default();
        assert_eq!(stat.telstate(), TelState::Stopped);
        assert_eq!(stat.domestate(), DomeState::Absent);
        assert_eq!(stat.minfo[MotorId::Hour.index()].have, 0);
        assert_eq!(stat.jogging_ison, 0);
    }

    #[test]
    fn jogging_flag_derivation() {
        let mut stat = TelStatShm::default();
        stat.refresh_jogging_flag();
        assert_eq!(stat.jogging_ison, 0);
        stat.paddle_active = 1;
        stat.refresh_jogging_flag();
        assert_eq!(stat.jogging_ison, 1);
        stat.paddle_active = 0;
        stat.tracking_offset_applied = 1;
        stat.refresh_jogging_flag();
        assert_eq!(stat.jogging_ison, 1);
    }

    #[test]
    fn writer_reader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telstat");

        let mut writer = ShmWriter::create(&path).unwrap();
        let reader = ShmReader::attach(&path).unwrap();

        // Freshly created segment reads back zeroed.
        let snap = reader.snapshot().unwrap();
        assert_eq!(snap.now.mjd, 0.0);
        assert_eq!(reader.heartbeat(), 0);

        let mut stat = TelStatShm::default();
        stat.now.mjd = 60_000.25;
        stat.telstate = TelState::Tracking as u8;
        stat.minfo[MotorId::Hour.index()].cpos = 1.25;
        writer.publish(&stat);

        let snap = reader.snapshot().unwrap();
        assert_eq!(snap.now.mjd, 60_000.25);
        assert_eq!(snap.telstate(), TelState::Tracking);
        assert_eq!(snap.minfo[MotorId::Hour.index()].cpos, 1.25);
        assert_eq!(reader.heartbeat(), 1);
    }

    #[test]
    fn reader_rejects_foreign_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; SEGMENT_LEN]).unwrap();
        assert!(matches!(ShmReader::attach(&path), Err(ShmError::BadMagic)));

        let short = dir.path().join("short");
        std::fs::write(&short, vec![0u8; 10]).unwrap();
        assert!(matches!(
            ShmReader::attach(&short),
            Err(ShmError::TooSmall(10))
        ));
    }
}
