//! Internal utilities.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Waits up to `timeout` for `fd` to become readable.
///
/// Uses `poll(2)` on the single descriptor. An interrupted wait reports
/// "not readable" rather than an error.
///
/// # Errors
///
/// Returns the OS error if `poll` fails, or `InvalidInput` if `fd` is not
/// an open descriptor.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // Round up so sub-millisecond waits do not spin.
    let millis = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
    let millis = libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pfd` is a valid, exclusively borrowed `pollfd` and the count
    // passed matches the single entry.
    let rc = unsafe { libc::poll(&raw mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not open",
        ));
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}
