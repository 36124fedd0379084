//! Socket events, the dispatcher queue and the consumer event loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Opaque, stable identity of an event consumer.
///
/// Events carry identities rather than references, so a consumer that
/// goes away (or changes) can have its queued events dropped or
/// retargeted without any dangling pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
	pub fn new() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for HandlerId {
	fn default() -> Self {
		Self::new()
	}
}

/// Opaque, stable identity of an event source (one per `Socket`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
	pub fn new() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for SourceId {
	fn default() -> Self {
		Self::new()
	}
}

/// Kinds of socket lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	/// A resolved address is about to be tried. Carries the formatted
	/// `host:port` text.
	HostAddress,
	/// A connection attempt failed but more addresses remain. Nonfatal.
	ConnectionNext,
	/// The outcome of the connection attempt (error 0 on success), or a
	/// pending inbound connection on a listening socket.
	Connection,
	/// The socket may be readable; read until it would block.
	Read,
	/// The socket may be writable; write until it would block.
	Write,
	/// The remote side closed the connection. Terminal for the socket.
	Close,
}

/// A single socket notification, delivered once on the event-loop thread.
#[derive(Debug, Clone)]
pub struct SocketEvent {
	handler: HandlerId,
	source: SourceId,
	kind: EventKind,
	error: i32,
	data: Option<String>,
}

impl SocketEvent {
	pub(crate) fn new(
		handler: HandlerId,
		source: SourceId,
		kind: EventKind,
		error: i32,
		data: Option<String>,
	) -> Self {
		Self {
			handler,
			source,
			kind,
			error,
			data,
		}
	}

	pub fn handler(&self) -> HandlerId {
		self.handler
	}

	pub fn source(&self) -> SourceId {
		self.source
	}

	pub fn kind(&self) -> EventKind {
		self.kind
	}

	/// Normalized error code, 0 on success.
	pub fn error(&self) -> i32 {
		self.error
	}

	/// Textual payload: the formatted address of a `HostAddress` event.
	pub fn data(&self) -> Option<&str> {
		self.data.as_deref()
	}
}

/// Consumer-implemented event sink.
///
/// Invoked on the event-loop thread; must not block. May call back into
/// the `Socket` (read, write, close, `set_event_handler`, ...).
pub trait SocketEventHandler {
	fn on_socket_event(&mut self, event: &SocketEvent);
}

/// Synchronous hook invoked by the worker immediately before it posts a
/// `Read` event. Used by higher layers that need to observe byte
/// arrivals on the worker thread (e.g. rate-limiter bookkeeping).
pub trait Callback: Send + Sync {
	fn cb(&self);
}

struct PendingQueue {
	events: VecDeque<SocketEvent>,
	// One wake per send; delivery consumes one wake and pops at most one
	// event, so removed events surface as empty wakes.
	wakes: usize,
}

struct DispatcherInner {
	pending: Mutex<PendingQueue>,
	cond: Condvar,
}

/// Multi-producer, single-consumer queue of socket events.
///
/// Workers push from their threads; the event loop drains. One internal
/// wake corresponds to one event so the loop can interleave other work.
#[derive(Clone)]
pub struct EventDispatcher {
	inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
	fn new() -> Self {
		Self {
			inner: Arc::new(DispatcherInner {
				pending: Mutex::new(PendingQueue {
					events: VecDeque::new(),
					wakes: 0,
				}),
				cond: Condvar::new(),
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, PendingQueue> {
		self.inner
			.pending
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Enqueues an event and wakes the event loop once.
	pub(crate) fn send(&self, event: SocketEvent) {
		let mut queue = self.lock();
		queue.events.push_back(event);
		queue.wakes += 1;
		self.inner.cond.notify_one();
	}

	/// Drops every queued event addressed to `handler`.
	pub fn remove_pending_handler(&self, handler: HandlerId) {
		self.lock().events.retain(|e| e.handler != handler);
	}

	/// Drops every queued event originating from `source`.
	pub fn remove_pending_source(&self, source: SourceId) {
		self.lock().events.retain(|e| e.source != source);
	}

	/// Rewrites queued events matching (`old_handler`, `old_source`) so
	/// they target (`new_handler`, `new_source`) instead. In-flight
	/// events survive a consumer changing identity.
	pub fn update_pending(
		&self,
		old_handler: HandlerId,
		old_source: SourceId,
		new_handler: HandlerId,
		new_source: SourceId,
	) {
		let mut queue = self.lock();
		for event in queue.events.iter_mut() {
			if event.handler != old_handler || event.source != old_source {
				continue;
			}
			event.handler = new_handler;
			event.source = new_source;
		}
	}

	/// Blocks until a wake arrives or `timeout` elapses. `None` means
	/// timeout; `Some(None)` a wake whose event was already removed.
	pub(crate) fn wait_wake(&self, timeout: Option<Duration>) -> Option<Option<SocketEvent>> {
		let deadline = timeout.map(|t| Instant::now() + t);
		let mut queue = self.lock();

		while queue.wakes == 0 {
			match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return None;
					}
					queue = self
						.inner
						.cond
						.wait_timeout(queue, deadline - now)
						.unwrap_or_else(PoisonError::into_inner)
						.0;
				}
				None => {
					queue = self
						.inner
						.cond
						.wait(queue)
						.unwrap_or_else(PoisonError::into_inner);
				}
			}
		}

		queue.wakes -= 1;
		Some(queue.events.pop_front())
	}
}

/// Single-consumer event loop: owns the registered handlers and
/// delivers at most one socket event per internal wake.
pub struct EventLoop {
	dispatcher: EventDispatcher,
	handlers: HashMap<HandlerId, Box<dyn SocketEventHandler>>,
}

impl EventLoop {
	pub fn new() -> Self {
		Self {
			dispatcher: EventDispatcher::new(),
			handlers: HashMap::new(),
		}
	}

	/// A cheap clone of the dispatcher, for constructing sockets and for
	/// producers on other threads.
	pub fn dispatcher(&self) -> EventDispatcher {
		self.dispatcher.clone()
	}

	/// Registers a handler under its identity. Events addressed to an
	/// unregistered identity are dropped at delivery time.
	pub fn insert_handler(&mut self, id: HandlerId, handler: Box<dyn SocketEventHandler>) {
		self.handlers.insert(id, handler);
	}

	/// Unregisters a handler and purges its queued events.
	pub fn remove_handler(&mut self, id: HandlerId) -> Option<Box<dyn SocketEventHandler>> {
		self.dispatcher.remove_pending_handler(id);
		self.handlers.remove(&id)
	}

	/// Waits for one internal wake and delivers at most one event.
	///
	/// Returns false if `timeout` elapsed with no wake. The dispatcher
	/// lock is released before the handler callback runs, so handlers
	/// may freely call back into their sockets.
	pub fn poll(&mut self, timeout: Option<Duration>) -> bool {
		match self.dispatcher.wait_wake(timeout) {
			None => false,
			Some(None) => true,
			Some(Some(event)) => {
				if let Some(handler) = self.handlers.get_mut(&event.handler) {
					handler.on_socket_event(&event);
				}
				true
			}
		}
	}
}

impl Default for EventLoop {
	fn default() -> Self {
		Self::new()
	}
}
