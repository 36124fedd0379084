//! Descriptor-level plumbing shared by the owner and the worker.

use std::os::fd::RawFd;

use crate::error::{errno, Error};
use crate::socket::{FLAG_KEEPALIVE, FLAG_NODELAY};

fn setsockopt_int(fd: RawFd, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> Result<(), Error> {
	let result = unsafe {
		libc::setsockopt(
			fd,
			level,
			option,
			&value as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	};
	if result == -1 {
		Err(Error(errno()))
	} else {
		Ok(())
	}
}

/// Sets the descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags == -1 {
		return Err(Error(errno()));
	}
	let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
	if result == -1 {
		return Err(Error(errno()));
	}
	Ok(())
}

/// Applies the option bits named by `mask`: TCP_NODELAY and
/// SO_KEEPALIVE. Bits outside the mask are left untouched so the caller
/// can diff against the previous flags.
pub(crate) fn apply_flags(fd: RawFd, flags: u8, mask: u8) -> Result<(), Error> {
	if mask & FLAG_NODELAY != 0 {
		let value = (flags & FLAG_NODELAY != 0) as libc::c_int;
		setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, value)?;
	}
	if mask & FLAG_KEEPALIVE != 0 {
		let value = (flags & FLAG_KEEPALIVE != 0) as libc::c_int;
		setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, value)?;
	}
	Ok(())
}

/// Applies receive/send buffer size preferences; `None` keeps the
/// kernel default.
pub(crate) fn apply_buffer_sizes(
	fd: RawFd,
	size_read: Option<i32>,
	size_write: Option<i32>,
) -> Result<(), Error> {
	if let Some(size) = size_read {
		setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
	}
	if let Some(size) = size_write {
		setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size)?;
	}
	Ok(())
}

/// Reads and clears the pending socket error (SO_ERROR). Returns 0 when
/// there is none. Used to learn the outcome of a non-blocking connect
/// once the descriptor signals writability.
pub(crate) fn take_socket_error(fd: RawFd) -> i32 {
	let mut error: libc::c_int = 0;
	let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

	let result = unsafe {
		libc::getsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_ERROR,
			&mut error as *mut _ as *mut libc::c_void,
			&mut len,
		)
	};
	if result == -1 {
		return errno();
	}

	error
}

/// Suppresses SIGPIPE per-socket where the platform supports it. On
/// Linux the write path passes MSG_NOSIGNAL instead.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) fn set_nosigpipe(fd: RawFd) {
	let _ = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub(crate) fn set_nosigpipe(_fd: RawFd) {}
