//! Platform socket layer.
//!
//! This module exposes the small set of OS primitives the selectors need
//! (socket creation with buffer sizing, non-blocking connect with a
//! timeout, `poll`, close) with identical names and semantics on Unix and
//! Windows. Everything else goes through `std::net`.

use std::io;
use std::net::TcpStream;
use std::time::Duration;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub(crate) use windows::*;

/// Converts an optional timeout to the milliseconds argument of
/// `poll`-style calls, rounding up so short timeouts do not spin.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Applies the per-connection socket options to an accepted or
/// connected stream.
pub(crate) fn configure_stream(
    stream: &TcpStream,
    buffer_size: usize,
    nodelay: bool,
) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    sys_set_buffer_sizes(raw_stream(stream), buffer_size)?;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
