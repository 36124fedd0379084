use libc::{
	EACCES, EADDRINUSE, EAFNOSUPPORT, EAGAIN, EALREADY, EBADF, ECONNABORTED, ECONNREFUSED,
	ECONNRESET, EFAULT, EHOSTUNREACH, EINPROGRESS, EINTR, EINVAL, EISCONN, EMFILE, EMSGSIZE,
	ENETRESET, ENETUNREACH, ENFILE, ENOBUFS, ENOMEM, ENOTCONN, ENOTSOCK, EOPNOTSUPP, EPERM,
	EPIPE, EPROTONOSUPPORT, ESHUTDOWN, ETIMEDOUT,
};
use libc::{
	EAI_AGAIN, EAI_BADFLAGS, EAI_FAIL, EAI_FAMILY, EAI_MEMORY, EAI_NONAME, EAI_OVERFLOW,
	EAI_SERVICE, EAI_SOCKTYPE, EAI_SYSTEM,
};

// glibc resolver codes the libc crate does not export
pub const EAI_ADDRFAMILY: i32 = -9;
pub const EAI_NODATA: i32 = -5;

/// A normalized socket error code: POSIX errno or a getaddrinfo `EAI_*`
/// value. Error codes attached to socket events use the same space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{}", error_description(*.0))]
pub struct Error(pub i32);

impl Error {
	/// Returns the raw normalized code.
	#[inline]
	pub fn code(self) -> i32 {
		self.0
	}

	/// True for the transient "try again later" code.
	#[inline]
	pub fn would_block(self) -> bool {
		self.0 == EAGAIN
	}
}

/// Returns current errno value.
#[inline]
pub fn errno() -> i32 {
	#[cfg(target_os = "linux")]
	unsafe {
		*libc::__errno_location()
	}
	#[cfg(not(target_os = "linux"))]
	unsafe {
		*libc::__error()
	}
}

struct ErrorEntry {
	code: i32,
	name: &'static str,
	description: &'static str,
}

macro_rules! errordecl {
	($code:ident, $desc:expr) => {
		ErrorEntry {
			code: $code,
			name: stringify!($code),
			description: $desc,
		}
	};
}

static ERROR_TABLE: &[ErrorEntry] = &[
	errordecl!(EACCES, "Permission denied"),
	errordecl!(EADDRINUSE, "Local address in use"),
	errordecl!(EAFNOSUPPORT, "The specified address family is not supported"),
	errordecl!(EINPROGRESS, "Operation in progress"),
	errordecl!(EINVAL, "Invalid argument passed"),
	errordecl!(EMFILE, "Process file table overflow"),
	errordecl!(ENFILE, "System limit of open files exceeded"),
	errordecl!(ENOBUFS, "Out of memory"),
	errordecl!(ENOMEM, "Out of memory"),
	errordecl!(EPERM, "Permission denied"),
	errordecl!(EPROTONOSUPPORT, "Protocol not supported"),
	errordecl!(EAGAIN, "Resource temporarily unavailable"),
	errordecl!(EALREADY, "Operation already in progress"),
	errordecl!(EBADF, "Bad file descriptor"),
	errordecl!(ECONNREFUSED, "Connection refused by server"),
	errordecl!(EFAULT, "Socket address outside address space"),
	errordecl!(EINTR, "Interrupted by signal"),
	errordecl!(EISCONN, "Socket already connected"),
	errordecl!(ENETUNREACH, "Network unreachable"),
	errordecl!(ENOTSOCK, "File descriptor not a socket"),
	errordecl!(ETIMEDOUT, "Connection attempt timed out"),
	errordecl!(EHOSTUNREACH, "No route to host"),
	errordecl!(ENOTCONN, "Socket not connected"),
	errordecl!(ENETRESET, "Connection reset by network"),
	errordecl!(EOPNOTSUPP, "Operation not supported"),
	errordecl!(ESHUTDOWN, "Socket has been shut down"),
	errordecl!(EMSGSIZE, "Message too large"),
	errordecl!(ECONNABORTED, "Connection aborted"),
	errordecl!(ECONNRESET, "Connection reset by peer"),
	errordecl!(EPIPE, "Local endpoint has been closed"),
	// getaddrinfo related
	errordecl!(
		EAI_ADDRFAMILY,
		"Network host does not have any network addresses in the requested address family"
	),
	errordecl!(EAI_AGAIN, "Temporary failure in name resolution"),
	errordecl!(EAI_BADFLAGS, "Invalid value for ai_flags"),
	errordecl!(EAI_FAIL, "Nonrecoverable failure in name resolution"),
	errordecl!(EAI_FAMILY, "The ai_family member is not supported"),
	errordecl!(EAI_MEMORY, "Memory allocation failure"),
	errordecl!(EAI_NODATA, "No address associated with nodename"),
	errordecl!(
		EAI_NONAME,
		"Neither nodename nor servname provided, or not known"
	),
	errordecl!(EAI_OVERFLOW, "Argument buffer overflow"),
	errordecl!(
		EAI_SERVICE,
		"The servname parameter is not supported for ai_socktype"
	),
	errordecl!(EAI_SOCKTYPE, "The ai_socktype member is not supported"),
	errordecl!(EAI_SYSTEM, "Other system error"),
];

/// Returns the symbolic name of a normalized error code, or the code
/// itself as a decimal string if it is not in the table.
pub fn error_string(error: i32) -> String {
	for entry in ERROR_TABLE {
		if entry.code == error {
			return entry.name.into();
		}
	}

	format!("{}", error)
}

/// Returns "`NAME` - description" for a normalized error code, or the
/// code itself as a decimal string if it is not in the table.
pub fn error_description(error: i32) -> String {
	for entry in ERROR_TABLE {
		if entry.code == error {
			return format!("{} - {}", entry.name, entry.description);
		}
	}

	format!("{}", error)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn table_codes_have_names_and_descriptions() {
		for entry in ERROR_TABLE {
			assert_eq!(error_string(entry.code), entry.name);
			let desc = error_description(entry.code);
			assert!(desc.starts_with(entry.name));
			assert!(desc.len() > entry.name.len() + 3);
		}
	}

	#[test]
	fn unknown_codes_render_numerically() {
		assert_eq!(error_string(987654), "987654");
		assert_eq!(error_description(987654), "987654");
	}

	#[test]
	fn description_is_never_empty() {
		for code in -50..200 {
			assert!(!error_description(code).is_empty());
		}
	}

	#[test]
	fn error_display_uses_description() {
		assert_eq!(
			Error(ECONNREFUSED).to_string(),
			"ECONNREFUSED - Connection refused by server"
		);
		assert!(Error(EAGAIN).would_block());
		assert!(!Error(EPIPE).would_block());
	}
}
