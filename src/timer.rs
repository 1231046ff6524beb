//! Fixed-rate frame timer on a non-blocking timerfd

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::warn;

pub struct FrameTimer {
    fd: TimerFd,
    interval: Duration,
}

impl FrameTimer {
    /// Arm a monotonic timer firing every `interval`
    pub fn new(interval: Duration) -> nix::Result<Self> {
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        fd.set(Expiration::Interval(TimeSpec::from(interval)), TimerSetTimeFlags::empty())?;
        Ok(Self { fd, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Consume pending expirations. Several missed ones count as one tick.
    pub fn take_tick(&self) -> bool {
        match self.fd.wait() {
            Ok(()) => true,
            Err(Errno::EAGAIN) => false,
            Err(e) => {
                warn!("Timer read failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missed_ticks_coalesce() {
        let timer = FrameTimer::new(Duration::from_millis(20)).unwrap();
        assert_eq!(timer.interval(), Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(70));
        assert!(timer.take_tick());
        assert!(!timer.take_tick());
    }
}
