//! Process-wide holding area for workers whose socket has departed.
//!
//! A worker blocked in name resolution cannot be cancelled portably;
//! when its socket goes away it is detached here and joined once its
//! thread notices the quit flag.

use std::sync::{Mutex, PoisonError};

use crate::socket::worker::SocketWorker;

static REAPER: Mutex<Vec<SocketWorker>> = Mutex::new(Vec::new());

/// Appends a detached worker. Its quit flag must already be set and a
/// wakeup posted.
pub(crate) fn detach(worker: SocketWorker) {
	REAPER
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.push(worker);
}

/// Joins and drops every detached worker whose thread has finished; with
/// `force`, waits for all of them. Safe to call at program shutdown.
pub(crate) fn cleanup(force: bool) {
	let ready = {
		let mut list = REAPER.lock().unwrap_or_else(PoisonError::into_inner);
		let mut ready = Vec::new();
		let mut index = 0;
		while index < list.len() {
			if force || list[index].shared.lock().finished {
				ready.push(list.swap_remove(index));
			} else {
				index += 1;
			}
		}
		ready
	};

	for mut worker in ready {
		log::trace!("reaping detached socket worker");
		worker.join();
	}
}
