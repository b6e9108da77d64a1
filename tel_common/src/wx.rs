//! Weather and auxiliary-sensor snapshot.
//!
//! The daemon does not run the weather station; an external feed writes the
//! alert flag and auxiliary temperatures, and the dome/focus machines read
//! them. The struct is part of the published record.

use bitflags::bitflags;

/// Number of auxiliary temperature sensor slots.
pub const MAUXTP: usize = 3;

bitflags! {
    /// Which auxiliary temperature slots hold live values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AuxTempMask: u32 {
        const AUX0 = 1 << 0;
        const AUX1 = 1 << 1;
        const AUX2 = 1 << 2;
    }
}

/// Weather snapshot as published in shared memory.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WxStats {
    /// Weather alert asserted.
    pub alert: u8,
    pub _pad: [u8; 3],
    /// Bitmask of valid `auxt` slots (`AuxTempMask` bits).
    pub auxtmask: u32,
    /// Unix time of the last update.
    pub updtime: i64,
    /// Auxiliary temperatures, °C.
    pub auxt: [f64; MAUXTP],
}

static_assertions::const_assert_eq!(core::mem::size_of::<WxStats>(), 40);

impl Default for WxStats {
    fn default() -> Self {
        // SAFETY: all fields are numeric; all-zeros is valid.
        unsafe { core::mem::zeroed() }
    }
}

impl WxStats {
    /// Alert is honoured only while fresh.
    #[inline]
    pub fn alert_active(&self, now_unix: i64, window_s: i64) -> bool {
        self.alert != 0 && now_unix - self.updtime < window_s
    }

    /// Highest-priority defined auxiliary temperature, if any.
    ///
    /// Higher slot numbers take priority, matching the sensor wiring
    /// convention (the most specific probe is installed last).
    pub fn aux_temp(&self) -> Option<f64> {
        let mask = AuxTempMask::from_bits_truncate(self.auxtmask);
        (0..MAUXTP).rev().find_map(|i| {
            if mask.contains(AuxTempMask::from_bits_truncate(1 << i)) {
                Some(self.auxt[i])
            } else {
                None
            }
        })
    }

    /// Store a temperature in an aux slot and mark it valid.
    pub fn set_aux_temp(&mut self, slot: usize, temp: f64, now_unix: i64) {
        if slot < MAUXTP {
            self.auxt[slot] = temp;
            self.auxtmask |= 1 << slot;
            self.updtime = now_unix;
        }
    }
}
