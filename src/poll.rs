//! Polling helpers for waiting on physical events
//!
//! [wait] is the plain busy-wait. It has no timeout and blocks until the probe reports the
//! target value. [try_wait] takes a fallible probe, as device reads can fail, and an optional
//! timeout for conditions the fixture itself should produce.

use std::time::{Duration, Instant};

/// Result of a bounded wait
pub type PollResult<T, E> = Result<T, PollError<E>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Error produced by [try_wait]
pub enum PollError<E> {
    /// The probe did not reach the target value in time
    #[error("Timeout after {0:?} waiting for condition")]
    Timeout(Duration),
    /// The probe itself failed
    #[error("Probe failed")]
    Probe(#[source] E),
}

/// Polls `probe` until it returns `target`, sleeping `interval` between polls.
///
/// This never returns if the condition never occurs.
pub fn wait<F: FnMut() -> bool>(mut probe: F, target: bool, interval: Duration) {
    while probe() != target {
        std::thread::sleep(interval);
    }
}

/// Polls a fallible `probe` until it returns `Ok(target)`.
///
/// The first probe error is returned immediately. With `timeout` set to [None] this waits
/// forever, like [wait].
pub fn try_wait<F, E>(
    mut probe: F,
    target: bool,
    interval: Duration,
    timeout: Option<Duration>,
) -> PollResult<(), E>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();
    loop {
        if probe().map_err(PollError::Probe)? == target {
            return Ok(());
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                return Err(PollError::Timeout(limit));
            }
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_on_transition() {
        let mut calls = 0;
        wait(
            || {
                calls += 1;
                calls >= 4
            },
            true,
            Duration::from_millis(1),
        );
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_wait_for_false() {
        let mut values = vec![false, true, true].into_iter();
        let mut seen = Vec::new();
        wait(
            || {
                let v = values.next().unwrap_or(false);
                seen.push(v);
                v
            },
            false,
            Duration::ZERO,
        );
        // Returns on the first poll already matching
        assert_eq!(seen, vec![false]);
    }

    #[test]
    fn test_try_wait_propagates_error() {
        let mut calls = 0;
        let res: PollResult<(), &str> = try_wait(
            || {
                calls += 1;
                if calls == 3 { Err("bus error") } else { Ok(false) }
            },
            true,
            Duration::ZERO,
            None,
        );
        assert_eq!(res, Err(PollError::Probe("bus error")));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_try_wait_timeout() {
        let res: PollResult<(), ()> =
            try_wait(|| Ok(true), false, Duration::from_millis(1), Some(Duration::from_millis(10)));
        assert_eq!(res, Err(PollError::Timeout(Duration::from_millis(10))));
    }
}
