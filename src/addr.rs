//! Socket address storage, numeric formatting and name resolution.

use std::ffi::CStr;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use crate::error::{errno, Error};

const HOST_BUF_LEN: usize = 1025; // NI_MAXHOST
const SERV_BUF_LEN: usize = 32; // NI_MAXSERV

/// An owned socket address: `sockaddr_storage` plus the actual length.
///
/// Large enough for any address family; obtained from `getsockname`,
/// `getpeername`, a resolver record or a std address.
pub struct SockAddr {
	storage: libc::sockaddr_storage,
	len: libc::socklen_t,
}

impl SockAddr {
	/// Copies a raw sockaddr into owned storage.
	///
	/// # Safety
	/// `addr` must point to `len` valid bytes of a sockaddr.
	pub(crate) unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Self {
		let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
		let len = len.min(mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t);
		unsafe {
			ptr::copy_nonoverlapping(
				addr as *const u8,
				&mut storage as *mut _ as *mut u8,
				len as usize,
			);
		}
		Self { storage, len }
	}

	/// Builds a `SockAddr` from a std socket address. No resolution is
	/// performed; the address is copied field by field.
	pub fn from_std(addr: std::net::SocketAddr) -> Self {
		match addr {
			std::net::SocketAddr::V4(a) => {
				let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
				sin.sin_family = libc::AF_INET as libc::sa_family_t;
				sin.sin_port = a.port().to_be();
				sin.sin_addr = libc::in_addr {
					s_addr: u32::from_ne_bytes(a.ip().octets()),
				};
				unsafe {
					Self::from_raw(
						&sin as *const _ as *const libc::sockaddr,
						mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
					)
				}
			}
			std::net::SocketAddr::V6(a) => {
				let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
				sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
				sin6.sin6_port = a.port().to_be();
				sin6.sin6_flowinfo = a.flowinfo();
				sin6.sin6_scope_id = a.scope_id();
				sin6.sin6_addr = libc::in6_addr {
					s6_addr: a.ip().octets(),
				};
				unsafe {
					Self::from_raw(
						&sin6 as *const _ as *const libc::sockaddr,
						mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
					)
				}
			}
		}
	}

	/// The address family (`AF_INET`, `AF_INET6`, ...).
	pub fn family(&self) -> libc::c_int {
		self.storage.ss_family as libc::c_int
	}

	/// The port in host byte order, if the family carries one.
	pub fn port(&self) -> Option<u16> {
		match self.family() {
			libc::AF_INET => {
				let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
				Some(u16::from_be(sin.sin_port))
			}
			libc::AF_INET6 => {
				let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
				Some(u16::from_be(sin6.sin6_port))
			}
			_ => None,
		}
	}

	pub(crate) fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
		(&self.storage as *const _ as *const libc::sockaddr, self.len)
	}
}

/// Formats a socket address as printable `host` or `host:port` text.
///
/// Uses the numeric name-info facility only, never DNS. IPv6 hosts are
/// bracketed when the port is shown. With `strip_zone_index`, anything
/// from `%` to the end of an IPv6 host is removed. Returns the empty
/// string if the address cannot be formatted.
pub fn format_address(addr: &SockAddr, with_port: bool, strip_zone_index: bool) -> String {
	let mut hostbuf = [0 as libc::c_char; HOST_BUF_LEN];
	let mut servbuf = [0 as libc::c_char; SERV_BUF_LEN];

	let (sa, len) = addr.as_raw();
	let res = unsafe {
		libc::getnameinfo(
			sa,
			len,
			hostbuf.as_mut_ptr(),
			HOST_BUF_LEN as libc::socklen_t,
			servbuf.as_mut_ptr(),
			SERV_BUF_LEN as libc::socklen_t,
			libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
		)
	};
	if res != 0 {
		return String::new();
	}

	let mut host = unsafe { CStr::from_ptr(hostbuf.as_ptr()) }
		.to_string_lossy()
		.into_owned();
	let port = unsafe { CStr::from_ptr(servbuf.as_ptr()) }
		.to_string_lossy()
		.into_owned();

	// IPv6 uses colons as separator, need to enclose the address
	// to avoid ambiguity if also showing the port
	if addr.family() == libc::AF_INET6 {
		if strip_zone_index {
			if let Some(pos) = host.find('%') {
				host.truncate(pos);
			}
		}
		if with_port {
			host = format!("[{}]", host);
		}
	}

	if with_port {
		format!("{}:{}", host, port)
	} else {
		host
	}
}

/// `getsockname` into owned storage.
pub(crate) fn local_name(fd: RawFd) -> Result<SockAddr, Error> {
	let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
	let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

	let res = unsafe {
		libc::getsockname(
			fd,
			&mut storage as *mut _ as *mut libc::sockaddr,
			&mut len,
		)
	};
	if res == -1 {
		return Err(Error(errno()));
	}

	Ok(SockAddr { storage, len })
}

/// `getpeername` into owned storage.
pub(crate) fn peer_name(fd: RawFd) -> Result<SockAddr, Error> {
	let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
	let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

	let res = unsafe {
		libc::getpeername(
			fd,
			&mut storage as *mut _ as *mut libc::sockaddr,
			&mut len,
		)
	};
	if res == -1 {
		return Err(Error(errno()));
	}

	Ok(SockAddr { storage, len })
}

/// An owned `getaddrinfo` result list, freed on drop.
pub(crate) struct AddrInfoList {
	head: *mut libc::addrinfo,
}

impl AddrInfoList {
	/// Blocking name resolution for stream sockets.
	///
	/// `host` of `None` with `passive` resolves wildcard addresses for
	/// binding. Returns the normalized resolver code on failure;
	/// `EAI_SYSTEM` is replaced by the underlying errno.
	pub fn resolve(
		host: Option<&CStr>,
		service: &CStr,
		family: libc::c_int,
		passive: bool,
	) -> Result<Self, i32> {
		let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
		hints.ai_family = family;
		hints.ai_socktype = libc::SOCK_STREAM;
		if passive {
			hints.ai_flags = libc::AI_PASSIVE | libc::AI_NUMERICSERV;
		}

		let mut head: *mut libc::addrinfo = ptr::null_mut();
		let res = unsafe {
			libc::getaddrinfo(
				host.map_or(ptr::null(), |h| h.as_ptr()),
				service.as_ptr(),
				&hints,
				&mut head,
			)
		};
		if res != 0 {
			if res == libc::EAI_SYSTEM {
				return Err(errno());
			}
			return Err(res);
		}

		Ok(Self { head })
	}

	pub fn iter(&self) -> AddrInfoIter<'_> {
		AddrInfoIter {
			cur: self.head,
			_marker: PhantomData,
		}
	}
}

impl Drop for AddrInfoList {
	fn drop(&mut self) {
		if !self.head.is_null() {
			unsafe { libc::freeaddrinfo(self.head) };
		}
	}
}

pub(crate) struct AddrInfoIter<'a> {
	cur: *const libc::addrinfo,
	_marker: PhantomData<&'a AddrInfoList>,
}

impl<'a> Iterator for AddrInfoIter<'a> {
	type Item = &'a libc::addrinfo;

	fn next(&mut self) -> Option<Self::Item> {
		if self.cur.is_null() {
			return None;
		}
		let item = unsafe { &*self.cur };
		self.cur = item.ai_next;
		Some(item)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fmt(addr: &str, with_port: bool, strip_zone: bool) -> String {
		let parsed: std::net::SocketAddr = addr.parse().unwrap();
		format_address(&SockAddr::from_std(parsed), with_port, strip_zone)
	}

	#[test]
	fn formats_ipv4_with_and_without_port() {
		assert_eq!(fmt("127.0.0.1:8080", true, false), "127.0.0.1:8080");
		assert_eq!(fmt("127.0.0.1:8080", false, false), "127.0.0.1");
	}

	#[test]
	fn formats_ipv6_with_brackets_only_when_port_shown() {
		assert_eq!(fmt("[2001:db8::1]:21", true, false), "[2001:db8::1]:21");
		assert_eq!(fmt("[2001:db8::1]:21", false, false), "2001:db8::1");
	}

	#[test]
	fn strips_zone_index_on_request() {
		let parsed: std::net::SocketAddr = "[fe80::1]:21".parse().unwrap();
		let std::net::SocketAddr::V6(mut v6) = parsed else {
			unreachable!()
		};
		v6.set_scope_id(1);
		let addr = SockAddr::from_std(std::net::SocketAddr::V6(v6));

		let kept = format_address(&addr, false, false);
		assert!(kept.starts_with("fe80::1"));
		assert_eq!(format_address(&addr, false, true), "fe80::1");
		assert_eq!(format_address(&addr, true, true), "[fe80::1]:21");
	}

	#[test]
	fn family_and_port_accessors() {
		let addr = SockAddr::from_std("127.0.0.1:4242".parse().unwrap());
		assert_eq!(addr.family(), libc::AF_INET);
		assert_eq!(addr.port(), Some(4242));

		let addr = SockAddr::from_std("[::1]:4243".parse().unwrap());
		assert_eq!(addr.family(), libc::AF_INET6);
		assert_eq!(addr.port(), Some(4243));
	}

	#[test]
	fn resolves_numeric_hosts() {
		let host = std::ffi::CString::new("127.0.0.1").unwrap();
		let service = std::ffi::CString::new("80").unwrap();
		let list = AddrInfoList::resolve(Some(&host), &service, libc::AF_UNSPEC, false).unwrap();
		let mut seen = 0;
		for addr in list.iter() {
			assert_eq!(addr.ai_family, libc::AF_INET);
			seen += 1;
		}
		assert!(seen >= 1);
	}
}
