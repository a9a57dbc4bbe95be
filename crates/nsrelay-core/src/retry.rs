//! Retry combinators for blocking calls.

use std::thread;
use std::time::Duration;

use nix::errno::Errno;

/// Call `op` until it stops failing with `EINTR`.
pub fn retry_interrupted<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Call `op` up to `attempts` times, sleeping `backoff` between failures.
///
/// Returns the first success, or the error of the last attempt. `attempts`
/// of zero is treated as one.
pub fn retry_with_backoff<T, E>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E>
where
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::debug!(attempt, error = %e, "Attempt failed, retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_interrupted_skips_eintr() {
        let mut calls = 0;
        let result = retry_interrupted(|| {
            calls += 1;
            if calls < 3 { Err(Errno::EINTR) } else { Ok(calls) }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_retry_interrupted_passes_other_errors() {
        let result: nix::Result<()> = retry_interrupted(|| Err(Errno::EBADF));
        assert_eq!(result, Err(Errno::EBADF));
    }

    #[test]
    fn test_retry_with_backoff_succeeds_eventually() {
        let result: Result<u32, String> = retry_with_backoff(5, Duration::ZERO, |attempt| {
            if attempt < 4 {
                Err(format!("attempt {attempt}"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(4));
    }

    #[test]
    fn test_retry_with_backoff_gives_up() {
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(3, Duration::ZERO, |_| {
            calls += 1;
            Err("busy".to_string())
        });
        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), String> = retry_with_backoff(0, Duration::ZERO, |_| {
            calls += 1;
            Err("nope".to_string())
        });
        assert_eq!(calls, 1);
    }
}
