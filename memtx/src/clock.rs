//! Low-resolution monotonic clock for hot paths.

#[cfg(all(target_os = "linux", feature = "unix"))]
mod imp {
    use nix::time::{ClockId, clock_gettime};

    /// Seconds on `CLOCK_MONOTONIC_COARSE`, which is read without a syscall
    /// and ticks at scheduler resolution.
    #[inline]
    pub fn monotonic_lowres() -> f64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC_COARSE) {
            Ok(ts) => ts.tv_sec() as f64 + ts.tv_nsec() as f64 * 1e-9,
            Err(_) => super::fallback(),
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "unix")))]
mod imp {
    #[inline]
    pub fn monotonic_lowres() -> f64 {
        super::fallback()
    }
}

pub use self::imp::monotonic_lowres;

fn fallback() -> f64 {
    use std::time::Instant;

    static BASE: spin::Once<Instant> = spin::Once::new();
    BASE.call_once(Instant::now).elapsed().as_secs_f64()
}
