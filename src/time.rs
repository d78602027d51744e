use core::fmt::Debug;

/// Generic abstraction for a check/countdown timer.
///
/// The engine never reads wall clock time directly. All timers (positive ACK, NAK
/// activity, check limit, inactivity) are created through a [crate::TimerCreator] and
/// polled through this trait, which keeps the handlers usable with simulated time in
/// tests.
pub trait Countdown: Debug {
    fn has_expired(&self) -> bool;
    fn reset(&mut self);
}
