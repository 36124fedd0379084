//! The per-socket worker thread and its readiness primitive.
//!
//! Each active socket owns one worker. The worker performs the blocking
//! pieces on the socket's behalf: name resolution, the sequential
//! connect loop and the readiness wait. The owner thread never blocks;
//! it stages instructions under the worker mutex and wakes the worker
//! through a self-pipe (or the condition variable while the worker is
//! between jobs).

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::addr::{format_address, AddrInfoList, SockAddr};
use crate::error::{errno, Error};
use crate::event::{Callback, EventDispatcher, EventKind, HandlerId, SocketEvent, SourceId};
use crate::socket::options::{apply_buffer_sizes, apply_flags, set_nonblocking, set_nosigpipe, take_socket_error};
use crate::socket::SocketState;

pub(crate) const WAIT_CONNECT: u8 = 0x01;
pub(crate) const WAIT_READ: u8 = 0x02;
pub(crate) const WAIT_WRITE: u8 = 0x04;
pub(crate) const WAIT_ACCEPT: u8 = 0x08;
pub(crate) const WAIT_CLOSE: u8 = 0x10;
pub(crate) const WAIT_EVENT_COUNT: usize = 5;

#[cfg(any(target_os = "linux", target_os = "android"))]
const POLL_RDHUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_RDHUP: libc::c_short = 0;

/// Owner/worker shared state. Every field both parties touch lives
/// behind the one mutex; the worker releases it only around the
/// readiness syscall and around name resolution.
pub(crate) struct Inner {
	/// Current descriptor, -1 when the socket has none. Written by the
	/// worker during connect, taken out by the owner on close.
	pub fd: RawFd,
	pub state: SocketState,
	/// Requested address family for connect/listen (`AF_*`).
	pub family: libc::c_int,
	pub flags: u8,
	pub buffer_sizes: [Option<i32>; 2],
	pub handler: Option<HandlerId>,
	pub read_cb: Option<Arc<dyn Callback>>,

	// Pending host/port to resolve; owned by the worker once taken.
	pub host: Option<CString>,
	pub port: Option<CString>,

	/// Readiness bits the worker is interested in.
	pub waiting: u8,
	/// Readiness bits observed but not yet turned into events. Only the
	/// worker clears these, when it emits the corresponding event.
	pub triggered: u8,
	pub triggered_errors: [i32; WAIT_EVENT_COUNT],

	pub started: bool,
	pub quit: bool,
	pub finished: bool,
	/// Worker is parked on the condition variable waiting for
	/// instructions; a wakeup signals instead of writing to the pipe.
	pub threadwait: bool,
	/// The owning socket has departed; the worker must not touch the
	/// descriptor or emit events any more.
	pub detached: bool,

	pub wake_tx: Option<OwnedFd>,
}

pub(crate) struct Shared {
	pub source: SourceId,
	inner: Mutex<Inner>,
	cond: Condvar,
}

impl Shared {
	/// A fresh shared block; configuration fields carry over when a
	/// worker is rotated out while stuck in a blocking call.
	pub fn with_config(
		source: SourceId,
		flags: u8,
		buffer_sizes: [Option<i32>; 2],
		handler: Option<HandlerId>,
		read_cb: Option<Arc<dyn Callback>>,
	) -> Self {
		Self {
			source,
			inner: Mutex::new(Inner {
				fd: -1,
				state: SocketState::None,
				family: libc::AF_UNSPEC,
				flags,
				buffer_sizes,
				handler,
				read_cb,
				host: None,
				port: None,
				waiting: 0,
				triggered: 0,
				triggered_errors: [0; WAIT_EVENT_COUNT],
				started: false,
				quit: false,
				finished: false,
				threadwait: false,
				detached: false,
				wake_tx: None,
			}),
			cond: Condvar::new(),
		}
	}

	pub fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Cancels a readiness wait or the idle wait. Idempotent: wakeups
	/// posted before the worker observes one coalesce in the pipe.
	pub fn wakeup(&self, inner: &mut Inner) {
		if !inner.started || inner.finished {
			return;
		}

		if inner.threadwait {
			inner.threadwait = false;
			self.cond.notify_one();
			return;
		}

		if let Some(tx) = &inner.wake_tx {
			let byte = [0u8; 1];
			loop {
				let res = unsafe { libc::write(tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
				// A full pipe means a wakeup is already pending.
				if res != -1 || errno() != libc::EINTR {
					break;
				}
			}
		}
	}
}

fn wake_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
	let mut fds = [0 as libc::c_int; 2];
	let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
	if res == -1 {
		return Err(Error(errno()));
	}
	Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Owner-side handle to the worker thread.
pub(crate) struct SocketWorker {
	pub shared: Arc<Shared>,
	pub thread: Option<JoinHandle<()>>,
}

impl SocketWorker {
	pub fn new(shared: Arc<Shared>) -> Self {
		Self {
			shared,
			thread: None,
		}
	}

	/// Spawns the worker thread on first use; subsequent starts reset
	/// the waiting mask and wake the parked thread.
	pub fn start(&mut self, dispatcher: &EventDispatcher) -> Result<(), Error> {
		let mut inner = self.shared.lock();
		if inner.started {
			inner.waiting = 0;
			self.shared.wakeup(&mut inner);
			return Ok(());
		}
		inner.started = true;

		let (wake_rx, wake_tx) = wake_pipe()?;
		inner.wake_tx = Some(wake_tx);
		drop(inner);

		let ctx = WorkerCtx {
			shared: self.shared.clone(),
			dispatcher: dispatcher.clone(),
			wake_rx,
		};
		let spawned = std::thread::Builder::new()
			.name("socket-worker".into())
			.spawn(move || ctx.run());
		match spawned {
			Ok(thread) => {
				self.thread = Some(thread);
				Ok(())
			}
			Err(_) => {
				let mut inner = self.shared.lock();
				inner.started = false;
				inner.wake_tx = None;
				Err(Error(libc::EAGAIN))
			}
		}
	}

	pub fn join(&mut self) {
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

enum TryResult {
	/// The wait was cancelled (quit, detach or close); unwind.
	Abort,
	/// Connected; the service loop takes over.
	Connected,
	/// This address failed; `emitted_final` is true when a terminal
	/// `Connection` event was already sent for it.
	Next { emitted_final: bool },
}

struct WorkerCtx {
	shared: Arc<Shared>,
	dispatcher: EventDispatcher,
	wake_rx: OwnedFd,
}

impl WorkerCtx {
	fn run(&self) {
		log::trace!("socket worker started");
		let mut inner = self.shared.lock();
		'outer: loop {
			inner = match self.idle_loop(inner) {
				Some(guard) => guard,
				None => break 'outer,
			};

			if inner.state == SocketState::Listening {
				loop {
					inner = match self.idle_loop(inner) {
						Some(guard) => guard,
						None => break 'outer,
					};
					if inner.fd == -1 {
						inner.waiting = 0;
						break;
					}
					let (guard, ok) = self.do_wait(inner, 0);
					inner = guard;
					if !ok {
						break;
					}
					send_events(&mut inner, self.shared.source, &self.dispatcher);
				}
			} else {
				if inner.state == SocketState::Connecting {
					let (guard, connected) = self.do_connect(inner);
					inner = guard;
					if !connected {
						continue;
					}
				}

				inner.waiting |= WAIT_CLOSE;
				let mut wait_close = WAIT_CLOSE;
				loop {
					inner = match self.idle_loop(inner) {
						Some(guard) => guard,
						None => break 'outer,
					};
					if inner.fd == -1 {
						inner.waiting = 0;
						break;
					}
					let (guard, ok) = self.do_wait(inner, 0);
					inner = guard;

					if inner.triggered & WAIT_CLOSE != 0 {
						inner.state = SocketState::Closing;
						wait_close = 0;
					}

					if !ok {
						break;
					}

					send_events(&mut inner, self.shared.source, &self.dispatcher);
					inner.waiting |= wait_close;
				}
			}
		}
		log::trace!("socket worker finished");
	}

	/// Parks until there is something to do. Returns `None` (with
	/// `finished` set) when the worker should exit.
	fn idle_loop<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) -> Option<MutexGuard<'a, Inner>> {
		loop {
			if inner.quit {
				inner.finished = true;
				return None;
			}
			if !inner.detached && (inner.waiting != 0 || inner.host.is_some()) {
				return Some(inner);
			}
			inner.threadwait = true;
			inner = self
				.shared
				.cond
				.wait(inner)
				.unwrap_or_else(PoisonError::into_inner);
		}
	}

	/// Blocks until one of the armed readiness bits fires or a wakeup
	/// arrives. The mutex is released around the `poll(2)` call and
	/// re-acquired before returning. Returns false when cancelled.
	fn do_wait<'a>(
		&'a self,
		mut inner: MutexGuard<'a, Inner>,
		add: u8,
	) -> (MutexGuard<'a, Inner>, bool) {
		inner.waiting |= add;

		loop {
			let fd = inner.fd;
			let mut events: libc::c_short = 0;
			if inner.waiting & (WAIT_READ | WAIT_ACCEPT) != 0 {
				events |= libc::POLLIN;
			}
			if inner.waiting & (WAIT_WRITE | WAIT_CONNECT) != 0 {
				events |= libc::POLLOUT;
			}
			if inner.waiting & WAIT_CLOSE != 0 {
				events |= POLL_RDHUP;
			}

			let mut fds = [
				libc::pollfd {
					fd: self.wake_rx.as_raw_fd(),
					events: libc::POLLIN,
					revents: 0,
				},
				libc::pollfd {
					fd,
					events,
					revents: 0,
				},
			];
			let nfds: libc::nfds_t = if fd == -1 { 1 } else { 2 };

			drop(inner);
			let res = unsafe { libc::poll(fds.as_mut_ptr(), nfds, -1) };
			let poll_errno = if res == -1 { errno() } else { 0 };
			inner = self.shared.lock();

			if res > 0 && fds[0].revents & libc::POLLIN != 0 {
				self.drain_wakeups();
			}

			if inner.quit || inner.detached || inner.fd == -1 {
				return (inner, false);
			}

			if res == -1 {
				if poll_errno == libc::EINTR {
					continue;
				}
				return (inner, false);
			}
			if res == 0 {
				continue;
			}

			let revents = fds[1].revents;
			if inner.waiting & WAIT_CONNECT != 0 {
				if revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
					inner.triggered |= WAIT_CONNECT;
					inner.triggered_errors[0] = take_socket_error(inner.fd);
					inner.waiting &= !WAIT_CONNECT;
				}
			} else if inner.waiting & WAIT_ACCEPT != 0 {
				// Errors surface through the owner's accept call.
				if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
					inner.triggered |= WAIT_ACCEPT;
					inner.waiting &= !WAIT_ACCEPT;
				}
			} else if inner.waiting & WAIT_READ != 0 {
				if revents & libc::POLLIN != 0 {
					inner.triggered |= WAIT_READ;
					inner.waiting &= !WAIT_READ;
				}
			}
			if inner.waiting & WAIT_WRITE != 0 {
				if revents & libc::POLLOUT != 0 {
					inner.triggered |= WAIT_WRITE;
					inner.waiting &= !WAIT_WRITE;
				}
			}
			if inner.waiting & WAIT_CLOSE != 0 {
				if revents & (POLL_RDHUP | libc::POLLHUP | libc::POLLERR) != 0 {
					inner.triggered |= WAIT_CLOSE;
					if revents & libc::POLLERR != 0 {
						inner.triggered_errors[4] = take_socket_error(inner.fd);
					}
					inner.waiting &= !WAIT_CLOSE;
				}
			}

			if inner.triggered != 0 || inner.waiting == 0 {
				return (inner, true);
			}
		}
	}

	/// Empties the wakeup pipe so a level-triggered poll does not spin.
	fn drain_wakeups(&self) {
		let mut buf = [0u8; 64];
		loop {
			let res = unsafe {
				libc::read(
					self.wake_rx.as_raw_fd(),
					buf.as_mut_ptr().cast(),
					buf.len(),
				)
			};
			if res == buf.len() as isize {
				continue;
			}
			if res == -1 && errno() == libc::EINTR {
				continue;
			}
			break;
		}
	}

	/// Resolves the staged host and walks the address list. Returns true
	/// once connected; false unwinds to the idle loop.
	fn do_connect<'a>(
		&'a self,
		mut inner: MutexGuard<'a, Inner>,
	) -> (MutexGuard<'a, Inner>, bool) {
		let (Some(host), Some(port)) = (inner.host.take(), inner.port.take()) else {
			inner.state = SocketState::Closed;
			return (inner, false);
		};
		let family = inner.family;

		drop(inner);
		let resolved = AddrInfoList::resolve(Some(&host), &port, family, false);
		let mut inner = self.shared.lock();

		if inner.quit || inner.detached {
			if !inner.detached {
				inner.state = SocketState::Closed;
			}
			return (inner, false);
		}

		// If the state is no longer Connecting, close() was called. If
		// host is staged again, close() and connect() were; either way
		// this attempt is stale.
		if inner.state != SocketState::Connecting || inner.host.is_some() {
			return (inner, false);
		}

		let list = match resolved {
			Ok(list) => list,
			Err(code) => {
				log::debug!("resolving {:?} failed: {}", host, code);
				self.emit(&inner, EventKind::Connection, code, None);
				inner.state = SocketState::Closed;
				return (inner, false);
			}
		};

		let mut emitted_final = false;
		for addr in list.iter() {
			let last = addr.ai_next.is_null();
			let (guard, result) = self.try_connect_host(inner, addr, last);
			inner = guard;
			match result {
				TryResult::Abort => {
					if !inner.detached && inner.state == SocketState::Connecting {
						inner.state = SocketState::Closed;
					}
					return (inner, false);
				}
				TryResult::Connected => return (inner, true),
				TryResult::Next { emitted_final: f } => emitted_final |= f,
			}
		}

		if !emitted_final {
			self.emit(&inner, EventKind::Connection, libc::ECONNABORTED, None);
		}
		inner.state = SocketState::Closed;
		(inner, false)
	}

	/// One attempt of the sequential connect loop.
	fn try_connect_host<'a>(
		&'a self,
		mut inner: MutexGuard<'a, Inner>,
		addr: &libc::addrinfo,
		last: bool,
	) -> (MutexGuard<'a, Inner>, TryResult) {
		let printable = {
			let sockaddr = unsafe { SockAddr::from_raw(addr.ai_addr, addr.ai_addrlen) };
			format_address(&sockaddr, true, false)
		};
		log::trace!("trying address {}", printable);
		self.emit(&inner, EventKind::HostAddress, 0, Some(printable));

		let fd = unsafe {
			libc::socket(
				addr.ai_family,
				addr.ai_socktype | libc::SOCK_CLOEXEC,
				addr.ai_protocol,
			)
		};
		if fd == -1 {
			let err = errno();
			self.emit_attempt_failure(&inner, last, err);
			return (inner, TryResult::Next { emitted_final: last });
		}

		set_nosigpipe(fd);
		let _ = apply_flags(fd, inner.flags, inner.flags);
		let _ = apply_buffer_sizes(fd, inner.buffer_sizes[0], inner.buffer_sizes[1]);
		let _ = set_nonblocking(fd);

		let res = unsafe { libc::connect(fd, addr.ai_addr, addr.ai_addrlen) };
		let mut err = if res == -1 { errno() } else { 0 };

		if err == libc::EINPROGRESS {
			// Publish the descriptor so close() can cancel the wait.
			inner.fd = fd;

			let ok = loop {
				let (guard, ok) = self.do_wait(inner, WAIT_CONNECT);
				inner = guard;
				if inner.triggered & WAIT_CONNECT != 0 {
					break true;
				}
				if !ok {
					break false;
				}
			};
			if !ok {
				if inner.fd != -1 {
					unsafe { libc::close(inner.fd) };
					inner.fd = -1;
				}
				return (inner, TryResult::Abort);
			}
			inner.triggered &= !WAIT_CONNECT;
			err = inner.triggered_errors[0];
		}

		if err != 0 {
			self.emit_attempt_failure(&inner, last, err);
			inner.fd = -1;
			unsafe { libc::close(fd) };
			(inner, TryResult::Next { emitted_final: last })
		} else {
			inner.fd = fd;
			inner.state = SocketState::Connected;
			self.emit(&inner, EventKind::Connection, 0, None);
			// Now interested in all the other nice events
			inner.waiting |= WAIT_READ | WAIT_WRITE;
			(inner, TryResult::Connected)
		}
	}

	fn emit(&self, inner: &Inner, kind: EventKind, error: i32, data: Option<String>) {
		if let Some(handler) = inner.handler {
			self.dispatcher.send(SocketEvent::new(
				handler,
				self.shared.source,
				kind,
				error,
				data,
			));
		}
	}

	fn emit_attempt_failure(&self, inner: &Inner, last: bool, err: i32) {
		let kind = if last {
			EventKind::Connection
		} else {
			EventKind::ConnectionNext
		};
		self.emit(inner, kind, err, None);
	}
}

/// Turns triggered readiness bits into events. Also called from the
/// owner side when a new handler is installed on a Closing socket.
pub(crate) fn send_events(inner: &mut Inner, source: SourceId, dispatcher: &EventDispatcher) {
	if inner.detached {
		return;
	}
	let Some(handler) = inner.handler else {
		return;
	};

	if inner.triggered & WAIT_READ != 0 {
		if let Some(cb) = inner.read_cb.clone() {
			cb.cb();
		}
		dispatcher.send(SocketEvent::new(
			handler,
			source,
			EventKind::Read,
			inner.triggered_errors[1],
			None,
		));
		inner.triggered &= !WAIT_READ;
	}
	if inner.triggered & WAIT_WRITE != 0 {
		dispatcher.send(SocketEvent::new(
			handler,
			source,
			EventKind::Write,
			inner.triggered_errors[2],
			None,
		));
		inner.triggered &= !WAIT_WRITE;
	}
	if inner.triggered & WAIT_ACCEPT != 0 {
		dispatcher.send(SocketEvent::new(
			handler,
			source,
			EventKind::Connection,
			inner.triggered_errors[3],
			None,
		));
		inner.triggered &= !WAIT_ACCEPT;
	}
	if inner.triggered & WAIT_CLOSE != 0 {
		send_close_event(inner, handler, source, dispatcher);
	}
}

/// The close notification can race the last data. Peek before emitting:
/// while unread bytes remain, substitute a `Read(0)` so the consumer
/// drains them first; the `Close` stays triggered until the peek comes
/// back empty.
fn send_close_event(
	inner: &mut Inner,
	handler: HandlerId,
	source: SourceId,
	dispatcher: &EventDispatcher,
) {
	let mut byte = [0u8; 1];
	let residual = inner.triggered_errors[4] == 0
		&& unsafe {
			libc::recv(
				inner.fd,
				byte.as_mut_ptr().cast(),
				1,
				libc::MSG_PEEK,
			)
		} > 0;

	if residual {
		if inner.waiting & WAIT_READ == 0 {
			return;
		}
		dispatcher.send(SocketEvent::new(handler, source, EventKind::Read, 0, None));
		inner.waiting &= !WAIT_READ;
	} else {
		dispatcher.send(SocketEvent::new(
			handler,
			source,
			EventKind::Close,
			inner.triggered_errors[4],
			None,
		));
		inner.triggered &= !WAIT_CLOSE;
	}
}
