//! The transaction engine: a single process-wide critical section that
//! serialises propagation, plus the free functions that mutate the node
//! graph under it.
//!
//! # Logic
//!
//! At most one transaction is open per process. Opening a transaction on a
//! thread that already holds one joins it; other threads block until the
//! outermost frame completes. All callbacks run synchronously on the thread
//! that opened the transaction.

use core::{
	marker::PhantomData,
	num::NonZeroU64,
	sync::atomic::{AtomicU64, Ordering},
};
use std::{
	cell::RefCell,
	collections::VecDeque,
	panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use scopeguard::guard;
use tracing::{debug, error, trace};

use crate::{
	error::Error,
	node::{NodeGraph, NodeId, TargetId, LEAF_RANK},
};

mod rank_queue;
use rank_queue::RankQueue;

struct Runtime {
	node_counter: AtomicU64,
	target_counter: AtomicU64,
	critical_mutex: ReentrantMutex<RefCell<Runtime_>>,
}

struct Runtime_ {
	graph: NodeGraph,
	current: Option<Transaction_>,
	in_callback: usize,
}

struct Transaction_ {
	queue: RankQueue,
	lasts: VecDeque<Box<dyn 'static + Send + FnOnce()>>,
	posts: VecDeque<Box<dyn 'static + Send + FnOnce()>>,
	needs_regenerating: bool,
	open_loops: Vec<(NodeId, &'static str)>,
}

impl Transaction_ {
	fn new() -> Self {
		Self {
			queue: RankQueue::new(),
			lasts: VecDeque::new(),
			posts: VecDeque::new(),
			needs_regenerating: false,
			open_loops: Vec::new(),
		}
	}
}

static RUNTIME: Runtime = Runtime {
	node_counter: AtomicU64::new(0),
	target_counter: AtomicU64::new(0),
	critical_mutex: ReentrantMutex::new(RefCell::new(Runtime_ {
		graph: NodeGraph::new(),
		current: None,
		in_callback: 0,
	})),
};

fn next_nonzero(counter: &AtomicU64) -> NonZeroU64 {
	//TODO: Relax ordering?
	(counter.fetch_add(1, Ordering::SeqCst) + 1)
		.try_into()
		.expect("infallible within reasonable time")
}

/// Registers a fresh interior node at rank 0.
#[must_use]
pub fn new_node() -> NodeId {
	let id = NodeId::new(next_nonzero(&RUNTIME.node_counter));
	let lock = RUNTIME.critical_mutex.lock();
	(*lock).borrow_mut().graph.register(id, 0);
	id
}

/// Registers a fresh consume-only node at [`LEAF_RANK`].
///
/// Leaf nodes drain after every interior node; user listeners and other
/// pure egress hang off these.
#[must_use]
pub fn new_leaf_node() -> NodeId {
	let id = NodeId::new(next_nonzero(&RUNTIME.node_counter));
	let lock = RUNTIME.critical_mutex.lock();
	(*lock).borrow_mut().graph.register(id, LEAF_RANK);
	id
}

/// Removes `id` from the graph together with its outgoing edges.
pub fn drop_node(id: NodeId) {
	let lock = RUNTIME.critical_mutex.lock();
	(*lock).borrow_mut().graph.purge(id);
}

/// Inserts the edge `source → downstream` and hands out its identity.
///
/// **Returns** whether the insertion regenerated ranks. A caller inside a
/// transaction must then request a queue resort via
/// [`Transaction::set_needs_regenerating`] before the next dispatch.
///
/// # Panics
///
/// Panics with [`Error::RankOverflow`] or [`Error::CycleDetected`] when
/// rank regeneration fails; the runtime is unusable afterwards.
#[must_use]
pub fn link(source: NodeId, downstream: NodeId, deferred: bool) -> (TargetId, bool) {
	let target = TargetId::new(next_nonzero(&RUNTIME.target_counter));
	let lock = RUNTIME.critical_mutex.lock();
	let mut borrow = (*lock).borrow_mut();
	let regenerated = borrow
		.graph
		.link(source, target, downstream, deferred)
		.unwrap_or_else(|error| panic!("{error}"));
	if regenerated {
		debug!(?source, ?downstream, "rank regeneration");
	}
	(target, regenerated)
}

/// Removes the edge `source → target`. Idempotent; ranks are unaffected.
pub fn unlink(source: NodeId, target: TargetId) {
	let lock = RUNTIME.critical_mutex.lock();
	(*lock).borrow_mut().graph.unlink(source, target);
}

/// The current rank of `id`, or [`None`] once it was dropped.
#[must_use]
pub fn rank(id: NodeId) -> Option<u64> {
	let lock = RUNTIME.critical_mutex.lock();
	let rank = (*lock).borrow().graph.rank(id);
	rank
}

/// Whether a user-supplied listener callback is executing on some thread.
///
/// `send` ingress uses this to reject events originated from inside the
/// graph.
#[must_use]
pub fn in_callback() -> bool {
	let lock = RUNTIME.critical_mutex.lock();
	let in_callback = (*lock).borrow().in_callback > 0;
	in_callback
}

/// Runs `f` as a user-supplied callback, maintaining the counter behind
/// [`in_callback`] even across unwinds.
pub fn in_user_callback<R>(f: impl FnOnce() -> R) -> R {
	{
		let lock = RUNTIME.critical_mutex.lock();
		(*lock).borrow_mut().in_callback += 1;
	}
	let _guard = guard((), |()| {
		let lock = RUNTIME.critical_mutex.lock();
		let mut borrow = (*lock).borrow_mut();
		borrow.in_callback = borrow
			.in_callback
			.checked_sub(1)
			.expect("unbalanced callback counter");
	});
	f()
}

/// A handle on the open transaction.
///
/// Only obtainable through [`Transaction::with`] (or the propagation
/// actions it dispatches), which proves the critical section is held by the
/// current thread. Deliberately neither [`Send`] nor [`Sync`].
pub struct Transaction {
	_not_send: PhantomData<*mut ()>,
}

impl Transaction {
	/// Runs `body` inside a transaction, opening one if none is active on
	/// this thread and otherwise joining it.
	///
	/// On the outermost frame, closing drains the propagation queue in rank
	/// order, runs the `last` phase, closes the transaction and then runs
	/// the `post` phase.
	///
	/// # Errors
	///
	/// [`Error::LoopNotClosed`] iff a forward-reference loop created within
	/// the transaction was never bound. The queued work is discarded and
	/// the `last`/`post` phases do not run.
	///
	/// # Panics
	///
	/// Panics from `body` or from listener callbacks resume on the
	/// outermost frame after the `last` and `post` phases ran; remaining
	/// queued work is abandoned.
	pub fn run<R>(body: impl FnOnce() -> R) -> Result<R, Error> {
		Self::frame(|_| body())
	}

	/// The open-or-join primitive behind every ingress: `send`, `listen`,
	/// `sample` and combinator construction all go through here.
	///
	/// # Panics
	///
	/// Unlike [`run`](`Transaction::run`), this surface is infallible:
	/// leaving a forward-reference loop unbound below an *implicit*
	/// transaction is a programming error and panics.
	pub fn with<R>(f: impl FnOnce(&mut Transaction) -> R) -> R {
		Self::frame(f).unwrap_or_else(|error| panic!("{error}"))
	}

	/// Whether a transaction is currently open.
	///
	/// Blocks while another thread's transaction is draining, so a `false`
	/// is an honest snapshot for the calling thread.
	#[must_use]
	pub fn is_active() -> bool {
		let lock = RUNTIME.critical_mutex.lock();
		let is_active = (*lock).borrow().current.is_some();
		is_active
	}

	fn frame<R>(f: impl FnOnce(&mut Transaction) -> R) -> Result<R, Error> {
		let lock = RUNTIME.critical_mutex.lock();
		let opened = {
			let mut borrow = (*lock).borrow_mut();
			if borrow.current.is_none() {
				borrow.current = Some(Transaction_::new());
				trace!("transaction opened");
				true
			} else {
				false
			}
		};

		let mut transaction = Transaction {
			_not_send: PhantomData,
		};
		if !opened {
			return Ok(f(&mut transaction));
		}

		match catch_unwind(AssertUnwindSafe(|| f(&mut transaction))) {
			Ok(r) => Self::settle(&lock).map(|()| r),
			Err(payload) => {
				// The body unwound: abandon queued work, then clean up.
				{
					let mut borrow = (*lock).borrow_mut();
					if let Some(current) = borrow.current.as_mut() {
						current.queue.clear();
					}
				}
				Self::unwind_phases(&lock, payload)
			}
		}
	}

	/// Outermost close: loop check, drain, `last`, close, `post`.
	fn settle(lock: &ReentrantMutexGuard<'_, RefCell<Runtime_>>) -> Result<(), Error> {
		{
			let mut borrow = (**lock).borrow_mut();
			let current = borrow.current.as_mut().expect("unreachable");
			if let Some(&(_, kind)) = current.open_loops.first() {
				// Abort: the graph references a placeholder that was never
				// given a definition, so nothing queued may be delivered
				// and the cleanup phases must not run either.
				drop(borrow.current.take());
				trace!("transaction aborted");
				return Err(Error::LoopNotClosed { kind });
			}
		}

		match catch_unwind(AssertUnwindSafe(|| Self::drain(lock))) {
			Ok(()) => {
				Self::run_lasts(lock);
				let posts = Self::close(lock);
				for post in posts {
					post();
				}
				Ok(())
			}
			Err(payload) => {
				// A listener unwound mid-drain. Remaining queued work is
				// abandoned, but the cleanup phases still run so transient
				// state (firings, pending cell swaps) is released.
				{
					let mut borrow = (**lock).borrow_mut();
					if let Some(current) = borrow.current.as_mut() {
						current.queue.clear();
					}
				}
				Self::unwind_phases(lock, payload)
			}
		}
	}

	/// `last`/close/`post` on an unwinding path. The original payload is
	/// resumed; secondary panics from cleanup are logged and discarded.
	fn unwind_phases<T>(
		lock: &ReentrantMutexGuard<'_, RefCell<Runtime_>>,
		payload: Box<dyn core::any::Any + Send>,
	) -> Result<T, Error> {
		if catch_unwind(AssertUnwindSafe(|| Self::run_lasts(lock))).is_err() {
			error!("discarded a panic from the `last` phase during an unwind");
		}
		let posts = Self::close(lock);
		if catch_unwind(AssertUnwindSafe(|| {
			for post in posts {
				post();
			}
		}))
		.is_err()
		{
			error!("discarded a panic from the `post` phase during an unwind");
		}
		resume_unwind(payload)
	}

	fn drain(lock: &ReentrantMutexGuard<'_, RefCell<Runtime_>>) {
		let mut transaction = Transaction {
			_not_send: PhantomData,
		};
		loop {
			let mut borrow = (**lock).borrow_mut();
			let Runtime_ { graph, current, .. } = &mut *borrow;
			let current = current.as_mut().expect("unreachable");
			if current.needs_regenerating {
				current.needs_regenerating = false;
				trace!("resorting propagation queue after rank regeneration");
				current.queue.resort(graph);
			}
			let Some(action) = current.queue.pop() else {
				break;
			};
			drop(borrow);
			action(&mut transaction);
		}
	}

	fn run_lasts(lock: &ReentrantMutexGuard<'_, RefCell<Runtime_>>) {
		loop {
			let mut borrow = (**lock).borrow_mut();
			let Some(last) = borrow
				.current
				.as_mut()
				.expect("unreachable")
				.lasts
				.pop_front()
			else {
				break;
			};
			drop(borrow);
			last();
		}
	}

	fn close(
		lock: &ReentrantMutexGuard<'_, RefCell<Runtime_>>,
	) -> VecDeque<Box<dyn 'static + Send + FnOnce()>> {
		let mut borrow = (**lock).borrow_mut();
		let current = borrow.current.take().expect("unreachable");
		trace!("transaction closed");
		current.posts
	}

	fn current<R>(&mut self, f: impl FnOnce(&mut NodeGraph, &mut Transaction_) -> R) -> R {
		let lock = RUNTIME.critical_mutex.lock();
		let mut borrow = (*lock).borrow_mut();
		let Runtime_ { graph, current, .. } = &mut *borrow;
		f(
			graph,
			current
				.as_mut()
				.expect("a `Transaction` handle implies an open transaction"),
		)
	}

	/// Enqueues propagation work against `node`, keyed at its current rank.
	pub fn prioritized(
		&mut self,
		node: NodeId,
		action: impl 'static + Send + FnOnce(&mut Transaction),
	) {
		self.current(|graph, current| {
			let rank = graph.rank(node).unwrap_or(LEAF_RANK);
			current.queue.push(node, rank, Box::new(action));
		});
	}

	/// Registers a callback for the `last` phase, after the main drain.
	///
	/// Streams clear their transient firings here and cells swap their
	/// next value in.
	pub fn last(&mut self, action: impl 'static + Send + FnOnce()) {
		self.current(|_, current| current.lasts.push_back(Box::new(action)));
	}

	/// Registers a callback to run after the transaction has closed.
	///
	/// `post` callbacks run outside the transaction and **may** open new
	/// ones, `send` included.
	pub fn post(&mut self, action: impl 'static + Send + FnOnce()) {
		self.current(|_, current| current.posts.push_back(Box::new(action)));
	}

	/// Requests a queue resort before the next dispatch, after a [`link`]
	/// reported regenerated ranks.
	pub fn set_needs_regenerating(&mut self) {
		self.current(|_, current| current.needs_regenerating = true);
	}

	/// Records a forward-reference placeholder created in this transaction.
	///
	/// The transaction fails to close with [`Error::LoopNotClosed`] until
	/// [`close_loop`](`Transaction::close_loop`) is called for it.
	pub fn register_loop(&mut self, node: NodeId, kind: &'static str) {
		self.current(|_, current| current.open_loops.push((node, kind)));
	}

	/// Marks the placeholder `node` as bound.
	///
	/// # Errors
	///
	/// [`Error::DoubleLoop`] iff `node` is not an open loop of this
	/// transaction — that is, it was already bound.
	pub fn close_loop(&mut self, node: NodeId) -> Result<(), Error> {
		self.current(|_, current| {
			let position = current
				.open_loops
				.iter()
				.position(|&(open, _)| open == node)
				.ok_or(Error::DoubleLoop)?;
			current.open_loops.swap_remove(position);
			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::{
		drop_node, in_callback, in_user_callback, link, new_leaf_node, new_node, rank, Transaction,
	};
	use crate::node::LEAF_RANK;

	#[test]
	fn links_regenerate_ranks_through_the_runtime() {
		let a = new_node();
		let b = new_node();
		let c = new_node();
		let (_ab, regenerated) = link(a, b, false);
		assert!(regenerated);
		let (_bc, _) = link(b, c, false);
		assert!(rank(a).unwrap() < rank(b).unwrap());
		assert!(rank(b).unwrap() < rank(c).unwrap());

		// A shortcut edge must keep the longer path strictly ordered.
		let (_ac, regenerated) = link(a, c, false);
		assert!(!regenerated);
		assert!(rank(c).unwrap() > rank(b).unwrap());

		drop_node(a);
		assert_eq!(rank(a), None);
	}

	#[test]
	fn leaf_nodes_rank_last() {
		let interior = new_node();
		let leaf = new_leaf_node();
		assert_eq!(rank(leaf), Some(LEAF_RANK));
		let (_edge, regenerated) = link(interior, leaf, false);
		assert!(!regenerated);
		assert_eq!(rank(leaf), Some(LEAF_RANK));
	}

	#[test]
	fn phases_run_in_order() {
		let low = new_node();
		let high = new_node();
		let _edge = link(low, high, false);

		let order = Arc::new(Mutex::new(Vec::new()));
		let push = |tag: &'static str| {
			let order = Arc::clone(&order);
			move || order.lock().unwrap().push(tag)
		};
		Transaction::with(|transaction| {
			let high_tag = push("high");
			transaction.prioritized(high, move |_| high_tag());
			let low_tag = push("low");
			transaction.prioritized(low, move |_| low_tag());
			transaction.last(push("last"));
			transaction.post(push("post"));
		});
		assert_eq!(*order.lock().unwrap(), ["low", "high", "last", "post"]);
	}

	#[test]
	fn callback_guard_is_balanced_across_unwinds() {
		assert!(!in_callback());
		let _ = std::panic::catch_unwind(|| in_user_callback(|| panic!("boom")));
		assert!(!in_callback());
		in_user_callback(|| assert!(in_callback()));
		assert!(!in_callback());
	}
}
