//! Listener handles and the process-wide keep-alive registry.

use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use parking_lot::Mutex;
use sapwood::{node::TargetId, runtime::Transaction};

/// Strong listeners stay registered here until they are unlistened, so the
/// caller may drop the handle without silencing the callback.
static KEEP_ALIVE: Mutex<BTreeMap<TargetId, Listener>> = Mutex::new(BTreeMap::new());

pub(crate) fn retain(listener: Listener) {
	KEEP_ALIVE.lock().insert(listener.target, listener);
}

fn release(target: TargetId) {
	drop(KEEP_ALIVE.lock().remove(&target));
}

struct ListenerState {
	/// The sole strong reference to the handler, plus whatever else must
	/// stay alive while this listener does (in particular its source
	/// stream). Dropping this is what silences already-queued deliveries.
	retained: Box<dyn Any + Send + Sync>,
	unlink: Box<dyn 'static + Send + FnOnce()>,
}

/// A handle binding a callback to a stream.
///
/// All clones refer to the same registration; [`unlisten`](`Listener::unlisten`)
/// through any of them disposes it.
#[derive(Clone)]
pub struct Listener {
	target: TargetId,
	state: Arc<Mutex<Option<ListenerState>>>,
}

impl fmt::Debug for Listener {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Listener")
			.field("target", &self.target)
			.field("live", &self.state.lock().is_some())
			.finish()
	}
}

impl Listener {
	pub(crate) fn new(
		retained: impl 'static + Send + Sync,
		target: TargetId,
		unlink: impl 'static + Send + FnOnce(),
	) -> Self {
		Self {
			target,
			state: Arc::new(Mutex::new(Some(ListenerState {
				retained: Box::new(retained),
				unlink: Box::new(unlink),
			}))),
		}
	}

	/// Stops the callback and releases everything it retained.
	///
	/// Idempotent and callable from any thread. After this returns, the
	/// callback does not run again — a delivery that was already queued is
	/// filtered at dispatch.
	pub fn unlisten(&self) {
		let state = self.state.lock().take();
		let Some(state) = state else {
			return;
		};
		Transaction::with(|_| {
			// Dropping the handler under the transaction lock means no
			// concurrently draining queue can observe it half-released.
			drop(state.retained);
			(state.unlink)();
		});
		release(self.target);
	}
}
