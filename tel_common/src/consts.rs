//! Protocol-wide constants.

/// Seconds per day.
pub const SPD: f64 = 86_400.0;

/// Number of sample points in one uploaded tracking profile.
pub const PPTRACK: usize = 60;

/// Maximum tolerated difference between host and controller clocks while
/// tracking, in seconds. Exceeding it aborts the track.
pub const MAXJITTER: f64 = 10.0;

/// Full range of the paddle velocity argument (`j<dir> <vel>`).
pub const VEL_MAX: i32 = 32_768;

/// Key identifying the status shared-memory segment. Readers compiled
/// separately locate the segment by this value, so it never changes.
pub const TELSTATSHMKEY: u32 = 0x4E56_361E;

/// Number of motors carried in the published `minfo` array:
/// hour angle, declination, rotator, focus, filter.
pub const NMOT: usize = 5;

/// Mirror-cover script timeout, seconds.
pub const COVER_TIMEOUT: f64 = 30.0;

/// A weather alert is honoured only while its timestamp is younger than
/// this many seconds.
pub const WX_ALERT_WINDOW: i64 = 30;

/// FLI filter wheels are re-homed after this many selections to stop
/// cumulative drift.
pub const FLI_REHOME_AFTER_MOVES: u32 = 25;
