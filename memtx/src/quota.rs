use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{
    error::Error,
    numeric::{self, Packable},
};

type Units = u32;

/// Quota is accounted in units of this many bytes.
pub const QUOTA_UNIT_SIZE: usize = 1024;
/// The largest total a quota can represent.
pub const QUOTA_MAX: usize = Units::MAX as usize * QUOTA_UNIT_SIZE;

#[inline]
fn to_units(bytes: usize) -> Units {
    numeric::units(bytes, QUOTA_UNIT_SIZE).min(Units::MAX as usize) as Units
}

#[inline]
const fn to_bytes(units: Units) -> usize {
    units as usize * QUOTA_UNIT_SIZE
}

/// A lock-free memory budget.
///
/// Total and used units share one 64-bit word: the total in the high half,
/// the used amount in the low half, so both are always read together.
pub struct Quota {
    value: CachePadded<AtomicU64>,
}

impl core::fmt::Debug for Quota {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (total, used) = self.load();
        f.debug_struct("Quota")
            .field("total", &to_bytes(total))
            .field("used", &to_bytes(used))
            .finish()
    }
}

impl Quota {
    /// Creates a quota of `total` bytes, rounded up to whole units.
    pub fn new(total: usize) -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(Units::pack(to_units(total), 0))),
        }
    }

    #[inline]
    fn load(&self) -> (Units, Units) {
        Units::unpack(self.value.load(Ordering::Acquire))
    }

    #[inline]
    pub fn total(&self) -> usize {
        to_bytes(self.load().0)
    }

    #[inline]
    pub fn used(&self) -> usize {
        to_bytes(self.load().1)
    }

    #[inline]
    pub fn available(&self) -> usize {
        let (total, used) = self.load();
        to_bytes(total - used)
    }

    /// Changes the total. Fails if the new total is below what is already
    /// in use. Returns the effective total in bytes.
    pub fn set(&self, new_total: usize) -> Result<usize, Error> {
        let units = to_units(new_total);
        let backoff = Backoff::new();
        let mut cur = self.value.load(Ordering::Acquire);
        loop {
            let (_, used) = Units::unpack(cur);
            if units < used {
                return Err(Error::QuotaExceeded {
                    requested: to_bytes(used),
                    available: to_bytes(units),
                });
            }
            let new = Units::pack(units, used);
            match self
                .value
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(to_bytes(units)),
                Err(changed) => {
                    cur = changed;
                    backoff.spin();
                }
            }
        }
    }

    /// Reserves `size` bytes rounded up to whole units and returns the
    /// reserved amount.
    pub fn reserve(&self, size: usize) -> Result<usize, Error> {
        let units = to_units(size);
        let backoff = Backoff::new();
        let mut cur = self.value.load(Ordering::Acquire);
        loop {
            let (total, used) = Units::unpack(cur);
            let want = used as u64 + units as u64;
            if want > total as u64 {
                return Err(Error::QuotaExceeded {
                    requested: size,
                    available: to_bytes(total - used),
                });
            }
            let new = Units::pack(total, want as Units);
            match self
                .value
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(to_bytes(units)),
                Err(changed) => {
                    cur = changed;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns `size` bytes, rounded up to whole units, to the quota.
    pub fn release(&self, size: usize) -> usize {
        let units = to_units(size);
        let backoff = Backoff::new();
        let mut cur = self.value.load(Ordering::Acquire);
        loop {
            let (total, used) = Units::unpack(cur);
            debug_assert!(used >= units, "quota released more than it was used");
            let new = Units::pack(total, used.saturating_sub(units));
            match self
                .value
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return to_bytes(units),
                Err(changed) => {
                    cur = changed;
                    backoff.spin();
                }
            }
        }
    }
}
