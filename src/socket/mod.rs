//! The owner-facing socket handle.
//!
//! A `Socket` is driven from the consumer's event-loop thread and never
//! blocks there: a dedicated worker thread performs name resolution,
//! the connect loop and readiness waits, and posts `SocketEvent`s to
//! the dispatcher. Error codes are the normalized POSIX space from
//! [`crate::error`].

mod options;
mod reaper;
pub(crate) mod worker;

use std::ffi::CString;
use std::sync::Arc;
use std::time::Duration;

use crate::addr::{format_address, local_name, peer_name, AddrInfoList};
use crate::error::{errno, Error};
use crate::event::{Callback, EventDispatcher, EventKind, HandlerId, SocketEvent, SourceId};
use self::options::{apply_buffer_sizes, apply_flags, set_nonblocking, set_nosigpipe};
use self::worker::{
	send_events, Shared, SocketWorker, WAIT_ACCEPT, WAIT_CLOSE, WAIT_EVENT_COUNT, WAIT_READ,
	WAIT_WRITE,
};

/// Disable Nagle's algorithm (TCP_NODELAY).
pub const FLAG_NODELAY: u8 = 0x01;
/// Probe idle connections for dead peers (SO_KEEPALIVE).
pub const FLAG_KEEPALIVE: u8 = 0x02;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Lifecycle state of a socket.
///
/// Connection events arrive only while Listening or Connecting; read
/// and write events only while Connected; the close event moves the
/// socket to Closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
	/// How the socket is initially, and again after `close`.
	None,
	Listening,
	Connecting,
	Connected,
	/// Remote side closed; a final close event is (or was) pending.
	Closing,
	Closed,
}

/// Requested address family for `connect` and `listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
	Unspec,
	Ipv4,
	Ipv6,
}

impl AddressFamily {
	fn to_raw(self) -> libc::c_int {
		match self {
			AddressFamily::Unspec => libc::AF_UNSPEC,
			AddressFamily::Ipv4 => libc::AF_INET,
			AddressFamily::Ipv6 => libc::AF_INET6,
		}
	}
}

/// A non-blocking TCP endpoint with a dedicated worker thread.
pub struct Socket {
	dispatcher: EventDispatcher,
	shared: Arc<Shared>,
	worker: Option<SocketWorker>,
	host: String,
}

impl Socket {
	/// Creates a socket in state `None`. Events go to `handler` once one
	/// is set; a socket without a handler produces no events.
	pub fn new(dispatcher: EventDispatcher, handler: Option<HandlerId>) -> Self {
		let shared = Arc::new(Shared::with_config(
			SourceId::new(),
			0,
			[None, None],
			handler,
			None,
		));
		Self {
			dispatcher,
			shared,
			worker: None,
			host: String::new(),
		}
	}

	/// The stable identity carried by this socket's events.
	pub fn source(&self) -> SourceId {
		self.shared.source
	}

	pub fn state(&self) -> SocketState {
		self.shared.lock().state
	}

	/// Starts connecting to `host:port`, resolving the host name on the
	/// worker thread and trying each resolved address in order.
	///
	/// Valid only in state `None`. `Ok(())` means the attempt is in
	/// progress; the outcome arrives as `HostAddress`, `ConnectionNext`
	/// and finally `Connection` events. Fails synchronously with
	/// `EISCONN` in any other state and `EINVAL` for a port outside
	/// 1..=65535 or an unrepresentable host.
	pub fn connect(&mut self, host: &str, port: u32, family: AddressFamily) -> Result<(), Error> {
		if self.state() != SocketState::None {
			return Err(Error(libc::EISCONN));
		}
		if port == 0 || port > 65535 {
			return Err(Error(libc::EINVAL));
		}
		let host_c = CString::new(host).map_err(|_| Error(libc::EINVAL))?;
		let port_c = CString::new(port.to_string()).map_err(|_| Error(libc::EINVAL))?;

		if self.worker.is_some() && self.shared.lock().started {
			let busy = {
				let mut inner = self.shared.lock();
				if inner.threadwait {
					false
				} else {
					self.shared.wakeup(&mut inner);
					true
				}
			};
			if busy {
				// Give the worker a moment to park itself.
				std::thread::sleep(Duration::from_millis(100));
				if !self.shared.lock().threadwait {
					// Still inside a blocking call, e.g. getaddrinfo.
					log::debug!("socket worker stuck in a blocking call, rotating it out");
					let source = self.shared.source;
					let (flags, buffer_sizes, handler, read_cb) = {
						let inner = self.shared.lock();
						(
							inner.flags,
							inner.buffer_sizes,
							inner.handler,
							inner.read_cb.clone(),
						)
					};
					self.detach_worker();
					self.shared = Arc::new(Shared::with_config(
						source,
						flags,
						buffer_sizes,
						handler,
						read_cb,
					));
				}
			}
		}

		let shared = self.shared.clone();
		let worker = self.worker.get_or_insert_with(|| SocketWorker::new(shared));
		{
			let mut inner = worker.shared.lock();
			inner.state = SocketState::Connecting;
			inner.family = family.to_raw();
			inner.host = Some(host_c);
			inner.port = Some(port_c);
		}
		self.host = host.to_owned();

		if let Err(err) = worker.start(&self.dispatcher) {
			let mut inner = self.shared.lock();
			inner.state = SocketState::None;
			inner.host = None;
			inner.port = None;
			drop(inner);
			self.worker = None;
			return Err(err);
		}

		Ok(())
	}

	/// Non-blocking read. On `EAGAIN` the worker is asked to re-arm read
	/// readiness, so a `Read` event follows once data arrives.
	pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
		let fd = self.shared.lock().fd;
		let res = unsafe { libc::recv(fd, buffer.as_mut_ptr().cast(), buffer.len(), 0) };
		if res == -1 {
			let err = errno();
			if err == libc::EAGAIN {
				let mut inner = self.shared.lock();
				if inner.waiting & WAIT_READ == 0 {
					inner.waiting |= WAIT_READ;
					self.shared.wakeup(&mut inner);
				}
			}
			return Err(Error(err));
		}

		if res == 0 {
			// EOF reached; let the worker surface the held-back close
			// event now that the peer's bytes are drained.
			let mut inner = self.shared.lock();
			if inner.triggered & WAIT_CLOSE != 0 && inner.waiting & WAIT_CLOSE == 0 {
				inner.waiting |= WAIT_CLOSE;
				self.shared.wakeup(&mut inner);
			}
		}

		Ok(res as usize)
	}

	/// Non-blocking read that leaves the data in the kernel buffer.
	/// Never arms readiness.
	pub fn peek(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
		let fd = self.shared.lock().fd;
		let res = unsafe {
			libc::recv(
				fd,
				buffer.as_mut_ptr().cast(),
				buffer.len(),
				libc::MSG_PEEK,
			)
		};
		if res == -1 {
			return Err(Error(errno()));
		}
		Ok(res as usize)
	}

	/// Non-blocking write. Returns the number of bytes accepted, which
	/// may be less than `buffer.len()`. On `EAGAIN` the worker is asked
	/// to re-arm write readiness, so a `Write` event follows once the
	/// send buffer drains.
	pub fn write(&mut self, buffer: &[u8]) -> Result<usize, Error> {
		let fd = self.shared.lock().fd;
		let res = unsafe { libc::send(fd, buffer.as_ptr().cast(), buffer.len(), SEND_FLAGS) };
		if res == -1 {
			let err = errno();
			if err == libc::EAGAIN {
				let mut inner = self.shared.lock();
				if inner.waiting & WAIT_WRITE == 0 {
					inner.waiting |= WAIT_WRITE;
					self.shared.wakeup(&mut inner);
				}
			}
			return Err(Error(err));
		}
		Ok(res as usize)
	}

	/// Closes the socket and resets it to state `None`. Pending events
	/// for the current handler are dropped, so the handler receives
	/// nothing further for this socket. Idempotent.
	pub fn close(&mut self) {
		let handler = {
			let mut inner = self.shared.lock();
			let fd = inner.fd;
			inner.fd = -1;
			inner.host = None;
			inner.port = None;
			if fd != -1 {
				unsafe { libc::close(fd) };
			}
			inner.state = SocketState::None;
			inner.triggered = 0;
			inner.triggered_errors = [0; WAIT_EVENT_COUNT];
			if !inner.threadwait {
				self.shared.wakeup(&mut inner);
			}
			inner.handler
		};

		if let Some(handler) = handler {
			self.dispatcher.remove_pending_handler(handler);
		}
	}

	/// Starts listening for inbound connections. With port 0 the kernel
	/// chooses one; query it with [`local_port`](Self::local_port). A
	/// `Connection(0)` event announces each pending connection; call
	/// [`accept`](Self::accept) to take it.
	pub fn listen(&mut self, family: AddressFamily, port: u32) -> Result<(), Error> {
		if self.state() != SocketState::None {
			return Err(Error(libc::EALREADY));
		}
		if port > 65535 {
			return Err(Error(libc::EINVAL));
		}
		let service = CString::new(port.to_string()).map_err(|_| Error(libc::EINVAL))?;

		let list = AddrInfoList::resolve(None, &service, family.to_raw(), true).map_err(Error)?;

		let mut fd = -1;
		let mut last_err = 0;
		for addr in list.iter() {
			fd = unsafe {
				libc::socket(
					addr.ai_family,
					addr.ai_socktype | libc::SOCK_CLOEXEC,
					addr.ai_protocol,
				)
			};
			if fd == -1 {
				last_err = errno();
				continue;
			}
			let _ = set_nonblocking(fd);
			if unsafe { libc::bind(fd, addr.ai_addr, addr.ai_addrlen) } == 0 {
				break;
			}
			last_err = errno();
			unsafe { libc::close(fd) };
			fd = -1;
		}
		drop(list);
		if fd == -1 {
			return Err(Error(if last_err != 0 {
				last_err
			} else {
				libc::EADDRNOTAVAIL
			}));
		}

		if unsafe { libc::listen(fd, 1) } != 0 {
			let err = errno();
			unsafe { libc::close(fd) };
			return Err(Error(err));
		}

		{
			let mut inner = self.shared.lock();
			inner.fd = fd;
			inner.family = family.to_raw();
			inner.state = SocketState::Listening;
		}

		let shared = self.shared.clone();
		let worker = self.worker.get_or_insert_with(|| SocketWorker::new(shared));
		if let Err(err) = worker.start(&self.dispatcher) {
			self.close();
			return Err(err);
		}

		// Arm after start: a restarted worker clears the waiting mask.
		{
			let mut inner = self.shared.lock();
			inner.waiting |= WAIT_ACCEPT;
			self.shared.wakeup(&mut inner);
		}

		Ok(())
	}

	/// Accepts a pending inbound connection.
	///
	/// The returned socket starts Connected with its own worker armed
	/// for read and write, inherits this listener's buffer-size
	/// preferences and has no event handler yet. `EAGAIN` means nothing
	/// was pending.
	pub fn accept(&mut self) -> Result<Socket, Error> {
		let (fd, buffer_sizes) = {
			let mut inner = self.shared.lock();
			inner.waiting |= WAIT_ACCEPT;
			self.shared.wakeup(&mut inner);
			(inner.fd, inner.buffer_sizes)
		};

		let new_fd = unsafe {
			libc::accept4(
				fd,
				std::ptr::null_mut(),
				std::ptr::null_mut(),
				libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
			)
		};
		if new_fd == -1 {
			return Err(Error(errno()));
		}

		set_nosigpipe(new_fd);
		let _ = apply_buffer_sizes(new_fd, buffer_sizes[0], buffer_sizes[1]);

		let mut socket = Socket::new(self.dispatcher.clone(), None);
		{
			let mut inner = socket.shared.lock();
			inner.fd = new_fd;
			inner.state = SocketState::Connected;
			inner.buffer_sizes = buffer_sizes;
			inner.waiting = WAIT_READ | WAIT_WRITE;
		}
		let shared = socket.shared.clone();
		let mut worker = SocketWorker::new(shared);
		worker.start(&socket.dispatcher)?;
		socket.worker = Some(worker);

		Ok(socket)
	}

	/// Changes which handler receives this socket's events.
	///
	/// Queued events for the old handler are retargeted in place (or
	/// dropped when the handler is removed). Installing a handler on a
	/// Connected socket that had none synthesizes `Write(0)` and
	/// `Read(0)` so the new consumer starts driving I/O; on a Closing
	/// socket the already-triggered events are flushed.
	pub fn set_event_handler(&mut self, handler: Option<HandlerId>) {
		let mut inner = self.shared.lock();
		let old = inner.handler;

		match (old, handler) {
			(Some(old), None) => self.dispatcher.remove_pending_handler(old),
			(Some(old), Some(new)) => {
				self.dispatcher
					.update_pending(old, self.shared.source, new, self.shared.source)
			}
			_ => {}
		}

		inner.handler = handler;

		if let Some(new) = handler {
			if old.is_none() && inner.state == SocketState::Connected {
				// The readiness level is unknown to the new consumer;
				// prod it to try both directions.
				self.dispatcher.send(SocketEvent::new(
					new,
					self.shared.source,
					EventKind::Write,
					0,
					None,
				));
				self.dispatcher.send(SocketEvent::new(
					new,
					self.shared.source,
					EventKind::Read,
					0,
					None,
				));
			} else if inner.state == SocketState::Closing {
				send_events(&mut inner, self.shared.source, &self.dispatcher);
			}
		}
	}

	/// The local address formatted without port; empty on failure is
	/// never returned, errors are explicit.
	pub fn local_ip(&self, strip_zone_index: bool) -> Result<String, Error> {
		let addr = local_name(self.shared.lock().fd)?;
		Ok(format_address(&addr, false, strip_zone_index))
	}

	/// The peer address formatted without port.
	pub fn peer_ip(&self, strip_zone_index: bool) -> Result<String, Error> {
		let addr = peer_name(self.shared.lock().fd)?;
		Ok(format_address(&addr, false, strip_zone_index))
	}

	/// The hostname passed to [`connect`](Self::connect).
	pub fn peer_host(&self) -> &str {
		&self.host
	}

	pub fn local_port(&self) -> Result<u16, Error> {
		let addr = local_name(self.shared.lock().fd)?;
		addr.port().ok_or(Error(libc::EINVAL))
	}

	pub fn remote_port(&self) -> Result<u16, Error> {
		let addr = peer_name(self.shared.lock().fd)?;
		addr.port().ok_or(Error(libc::EINVAL))
	}

	/// The bound address family, or `Unspec` when there is none.
	pub fn address_family(&self) -> AddressFamily {
		match local_name(self.shared.lock().fd) {
			Ok(addr) => match addr.family() {
				libc::AF_INET => AddressFamily::Ipv4,
				libc::AF_INET6 => AddressFamily::Ipv6,
				_ => AddressFamily::Unspec,
			},
			Err(_) => AddressFamily::Unspec,
		}
	}

	pub fn flags(&self) -> u8 {
		self.shared.lock().flags
	}

	/// Applies `FLAG_NODELAY` / `FLAG_KEEPALIVE`, diffing against the
	/// current flags so only changed options hit the descriptor.
	pub fn set_flags(&mut self, flags: u8) {
		let mut inner = self.shared.lock();
		if inner.fd != -1 {
			let _ = apply_flags(inner.fd, flags, flags ^ inner.flags);
		}
		inner.flags = flags;
	}

	/// Stores receive/send buffer size preferences and applies them to
	/// the current descriptor if there is one. Sockets spawned by
	/// [`accept`](Self::accept) inherit the listener's preferences.
	pub fn set_buffer_sizes(&mut self, size_read: Option<i32>, size_write: Option<i32>) {
		let mut inner = self.shared.lock();
		inner.buffer_sizes = [size_read, size_write];
		if inner.fd != -1 {
			let _ = apply_buffer_sizes(inner.fd, size_read, size_write);
		}
	}

	/// Installs a hook the worker invokes immediately before posting
	/// each `Read` event.
	pub fn set_synchronous_read_callback(&mut self, callback: Option<Arc<dyn Callback>>) {
		self.shared.lock().read_cb = callback;
	}

	/// Joins detached workers whose threads have finished; with `force`,
	/// waits for all of them. Call at process shutdown with `force`.
	pub fn cleanup(force: bool) {
		reaper::cleanup(force);
	}

	fn detach_worker(&mut self) {
		let Some(mut worker) = self.worker.take() else {
			return;
		};

		let mut inner = self.shared.lock();
		inner.detached = true;
		inner.host = None;
		inner.port = None;
		inner.waiting = 0;

		if inner.finished {
			drop(inner);
			worker.join();
		} else if !inner.started {
			// The thread was never spawned; nothing to wait for.
		} else {
			inner.quit = true;
			self.shared.wakeup(&mut inner);
			drop(inner);
			reaper::detach(worker);
		}

		Socket::cleanup(false);
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		if self.state() != SocketState::None {
			self.close();
		}
		self.detach_worker();
		self.dispatcher.remove_pending_source(self.shared.source);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::EventLoop;

	#[test]
	fn connect_rejects_bad_ports() {
		let event_loop = EventLoop::new();
		let mut socket = Socket::new(event_loop.dispatcher(), None);
		assert_eq!(
			socket.connect("127.0.0.1", 0, AddressFamily::Ipv4),
			Err(Error(libc::EINVAL))
		);
		assert_eq!(
			socket.connect("::1", 65536, AddressFamily::Ipv6),
			Err(Error(libc::EINVAL))
		);
		assert_eq!(socket.state(), SocketState::None);
	}

	#[test]
	fn connect_twice_reports_isconn() {
		let event_loop = EventLoop::new();
		let mut socket = Socket::new(event_loop.dispatcher(), None);
		socket
			.connect("127.0.0.1", 9, AddressFamily::Ipv4)
			.unwrap();
		assert_eq!(
			socket.connect("127.0.0.1", 9, AddressFamily::Ipv4),
			Err(Error(libc::EISCONN))
		);
		socket.close();
		assert_eq!(socket.state(), SocketState::None);
	}

	#[test]
	fn close_is_idempotent() {
		let event_loop = EventLoop::new();
		let mut socket = Socket::new(event_loop.dispatcher(), None);
		socket.close();
		socket.close();
		assert_eq!(socket.state(), SocketState::None);
	}

	#[test]
	fn listen_twice_reports_already() {
		let event_loop = EventLoop::new();
		let mut socket = Socket::new(event_loop.dispatcher(), None);
		socket.listen(AddressFamily::Ipv4, 0).unwrap();
		assert_eq!(
			socket.listen(AddressFamily::Ipv4, 0),
			Err(Error(libc::EALREADY))
		);
		let port = socket.local_port().unwrap();
		assert!(port >= 1);
	}
}
