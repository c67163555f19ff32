//! Streams of discrete events and the combinators over them.

use std::{
	fmt,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use sapwood::{
	error::Error,
	node::{NodeId, TargetId},
	runtime::{self, Transaction},
};

use crate::{
	cell::{Cell, CellValue},
	listener::{self, Listener},
	loops::StreamLoop,
};

/// A typed edge action: invoked once per delivery, inside the transaction.
pub(crate) type TransactionHandler<T> = dyn 'static + Send + Sync + Fn(&mut Transaction, &T);

struct StreamTarget<T> {
	target: TargetId,
	node: NodeId,
	/// Weak by design: the owning [`Listener`] holds the only strong
	/// reference, so unlistening silences queued deliveries too.
	action: Weak<TransactionHandler<T>>,
}

struct StreamInner<T> {
	targets: Vec<StreamTarget<T>>,
	/// Values sent in the current transaction, kept so listeners attached
	/// late still observe them; cleared in the `last` phase.
	firings: Vec<T>,
	/// Listeners this stream owns on its upstreams. Unlistened when the
	/// stream is dropped.
	retained: Vec<Listener>,
}

pub(crate) struct StreamCore<T> {
	pub(crate) node: NodeId,
	weak_self: Weak<StreamCore<T>>,
	inner: Mutex<StreamInner<T>>,
}

impl<T> Drop for StreamCore<T> {
	fn drop(&mut self) {
		for listener in self.inner.get_mut().retained.drain(..) {
			listener.unlisten();
		}
		runtime::drop_node(self.node);
	}
}

impl<T: 'static + Clone + Send> StreamCore<T> {
	fn new() -> Arc<Self> {
		Arc::new_cyclic(|weak_self| Self {
			node: runtime::new_node(),
			weak_self: Weak::clone(weak_self),
			inner: Mutex::new(StreamInner {
				targets: Vec::new(),
				firings: Vec::new(),
				retained: Vec::new(),
			}),
		})
	}

	pub(crate) fn retain(&self, listener: Listener) {
		self.inner.lock().retained.push(listener);
	}

	/// Records `value` as a firing of this transaction and enqueues one
	/// delivery per outgoing edge, keyed at each edge's target node.
	pub(crate) fn fire(&self, transaction: &mut Transaction, value: T) {
		let mut inner = self.inner.lock();
		if inner.firings.is_empty() {
			let weak = Weak::clone(&self.weak_self);
			transaction.last(move || {
				if let Some(core) = weak.upgrade() {
					// Values may own further graph; drop them unlocked.
					let cleared = std::mem::take(&mut core.inner.lock().firings);
					drop(cleared);
				}
			});
		}
		inner.firings.push(value.clone());

		inner.targets.retain(|target| target.action.strong_count() > 0);
		for target in &inner.targets {
			let action = Weak::clone(&target.action);
			let value = value.clone();
			transaction.prioritized(target.node, move |transaction| {
				if let Some(action) = action.upgrade() {
					action(transaction, &value);
				}
			});
		}
	}

	/// Links an edge towards `target_node` and installs `action` on it.
	///
	/// Unless `suppress_earlier_firings` is set, firings already recorded
	/// in the open transaction are replayed to the new edge, which keeps
	/// `send` and `listen` order-independent within a transaction.
	///
	/// `deferred` marks the loop-binding boundary edge. With
	/// `purge_target_node`, unlistening also drops `target_node` — for
	/// callers whose target node belongs to this edge alone.
	pub(crate) fn listen_raw(
		&self,
		transaction: &mut Transaction,
		target_node: NodeId,
		action: Arc<TransactionHandler<T>>,
		suppress_earlier_firings: bool,
		deferred: bool,
		purge_target_node: bool,
	) -> Listener {
		let (target, regenerated) = runtime::link(self.node, target_node, deferred);
		if regenerated {
			transaction.set_needs_regenerating();
		}

		let mut inner = self.inner.lock();
		inner.targets.push(StreamTarget {
			target,
			node: target_node,
			action: Arc::downgrade(&action),
		});
		if !suppress_earlier_firings {
			for value in inner.firings.iter().cloned() {
				let action = Arc::downgrade(&action);
				transaction.prioritized(target_node, move |transaction| {
					if let Some(action) = action.upgrade() {
						action(transaction, &value);
					}
				});
			}
		}
		drop(inner);

		let source = Weak::clone(&self.weak_self);
		let source_node = self.node;
		let this = self.weak_self.upgrade().expect("unreachable");
		Listener::new((action, this), target, move || {
			if let Some(source) = source.upgrade() {
				source
					.inner
					.lock()
					.targets
					.retain(|candidate| candidate.target != target);
			}
			runtime::unlink(source_node, target);
			if purge_target_node {
				runtime::drop_node(target_node);
			}
		})
	}
}

fn send_into<T: 'static + Clone + Send>(
	weak_out: &Weak<StreamCore<T>>,
) -> Arc<TransactionHandler<T>> {
	let weak_out = Weak::clone(weak_out);
	Arc::new(move |transaction, value: &T| {
		if let Some(out) = weak_out.upgrade() {
			out.fire(transaction, value.clone());
		}
	})
}

/// A push-based source of discrete values; zero or more firings per
/// transaction.
///
/// Handles are cheap clones over shared state. A stream stays alive while
/// a handle, a derived stream or an attached [`Listener`] references it.
pub struct Stream<T> {
	pub(crate) core: Arc<StreamCore<T>>,
}

impl<T> Clone for Stream<T> {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
		}
	}
}

impl<T> fmt::Debug for Stream<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Stream").field("node", &self.core.node).finish()
	}
}

impl<T: 'static + Clone + Send> Stream<T> {
	pub(crate) fn new() -> Self {
		Self {
			core: StreamCore::new(),
		}
	}

	/// A stream that never fires.
	#[must_use]
	pub fn never() -> Self {
		Self::new()
	}

	/// Attaches `handler`, retained process-wide until
	/// [`unlisten`](`Listener::unlisten`) — dropping the handle does not
	/// silence it.
	pub fn listen(&self, handler: impl 'static + Send + FnMut(&T)) -> Listener {
		let listener = self.listen_weak(handler);
		listener::retain(listener.clone());
		listener
	}

	/// Attaches `handler` for as long as the caller keeps the handle.
	///
	/// Once the last clone of the returned [`Listener`] is dropped, the
	/// handler is released and pending deliveries are filtered at dispatch.
	pub fn listen_weak(&self, handler: impl 'static + Send + FnMut(&T)) -> Listener {
		Transaction::with(|transaction| {
			let handler = Mutex::new(handler);
			let action: Arc<TransactionHandler<T>> = Arc::new(move |_, value| {
				runtime::in_user_callback(|| (&mut *handler.lock())(value));
			});
			let node = runtime::new_leaf_node();
			self.core
				.listen_raw(transaction, node, action, false, false, true)
		})
	}

	/// Transforms every firing with the pure function `f`.
	pub fn map<B: 'static + Clone + Send>(
		&self,
		f: impl 'static + Send + Sync + Fn(&T) -> B,
	) -> Stream<B> {
		Transaction::with(|transaction| {
			let out = Stream::new();
			let weak_out = Arc::downgrade(&out.core);
			let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
				if let Some(out) = weak_out.upgrade() {
					out.fire(transaction, f(value));
				}
			});
			let listener = self
				.core
				.listen_raw(transaction, out.core.node, action, false, false, false);
			out.core.retain(listener);
			out
		})
	}

	/// Replaces every firing with `value`.
	pub fn map_to<B: 'static + Clone + Send + Sync>(&self, value: B) -> Stream<B> {
		self.map(move |_| value.clone())
	}

	/// Lets through only the firings for which `predicate` holds.
	pub fn filter(&self, predicate: impl 'static + Send + Sync + Fn(&T) -> bool) -> Self {
		Transaction::with(|transaction| {
			let out = Stream::new();
			let weak_out = Arc::downgrade(&out.core);
			let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
				if let Some(out) = weak_out.upgrade() {
					if predicate(value) {
						out.fire(transaction, value.clone());
					}
				}
			});
			let listener = self
				.core
				.listen_raw(transaction, out.core.node, action, false, false, false);
			out.core.retain(listener);
			out
		})
	}

	/// Merges two streams of the same type.
	///
	/// In a transaction where both fire, the output fires once with
	/// `combine(left, right)` — `self` is the left input. Otherwise the
	/// single firing passes through unchanged.
	pub fn merge(&self, other: &Self, combine: impl 'static + Send + Sync + Fn(&T, &T) -> T) -> Self {
		Transaction::with(|transaction| {
			self.merge_unordered(transaction, other)
				.coalesce_(transaction, combine)
		})
	}

	/// Like [`merge`](`Stream::merge`), preferring the left value on
	/// simultaneity.
	pub fn or_else(&self, other: &Self) -> Self {
		self.merge(other, |left, _| left.clone())
	}

	fn merge_unordered(&self, transaction: &mut Transaction, other: &Self) -> Self {
		let out = Stream::new();
		// The interposed node keeps `self`'s deliveries ahead of `other`'s
		// for equal sends, so the downstream coalesce sees (left, right).
		let left = runtime::new_node();
		let right = out.core.node;
		let (_bridge, regenerated) = runtime::link(left, right, false);
		if regenerated {
			transaction.set_needs_regenerating();
		}

		let weak_out = Arc::downgrade(&out.core);
		let first = self
			.core
			.listen_raw(transaction, left, send_into(&weak_out), false, false, true);
		let second =
			other
				.core
				.listen_raw(transaction, right, send_into(&weak_out), false, false, false);
		out.core.retain(first);
		out.core.retain(second);
		out
	}

	/// Folds all firings of one transaction into a single output firing.
	///
	/// The first firing schedules the delivery; every further firing of the
	/// same transaction reduces into the pending value with `combine`.
	pub fn coalesce(&self, combine: impl 'static + Send + Sync + Fn(&T, &T) -> T) -> Self {
		Transaction::with(|transaction| self.coalesce_(transaction, combine))
	}

	fn coalesce_(
		&self,
		transaction: &mut Transaction,
		combine: impl 'static + Send + Sync + Fn(&T, &T) -> T,
	) -> Self {
		let out = Stream::new();
		let out_node = out.core.node;
		let weak_out = Arc::downgrade(&out.core);
		let pending: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
		let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
			let mut slot = pending.lock();
			if let Some(accumulated) = slot.take() {
				*slot = Some(combine(&accumulated, value));
			} else {
				*slot = Some(value.clone());
				let pending = Arc::clone(&pending);
				let weak_out = Weak::clone(&weak_out);
				transaction.prioritized(out_node, move |transaction| {
					if let (Some(out), Some(value)) = (weak_out.upgrade(), pending.lock().take()) {
						out.fire(transaction, value);
					}
				});
			}
		});
		let listener = self
			.core
			.listen_raw(transaction, out_node, action, true, false, false);
		out.core.retain(listener);
		out
	}

	pub(crate) fn last_firing_only_(&self, transaction: &mut Transaction) -> Self {
		self.coalesce_(transaction, |_, second| second.clone())
	}

	/// Fires `combine(value, seen)` for every firing, where `seen` is the
	/// cell's value as of the start of the transaction.
	pub fn snapshot<C: 'static + Clone + Send, B: 'static + Clone + Send>(
		&self,
		cell: &Cell<C>,
		combine: impl 'static + Send + Sync + Fn(&T, &C) -> B,
	) -> Stream<B> {
		Transaction::with(|transaction| {
			let out = Stream::new();
			let weak_out = Arc::downgrade(&out.core);
			let cell = cell.clone();
			let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
				if let Some(out) = weak_out.upgrade() {
					let seen = cell.current();
					out.fire(transaction, combine(value, &seen));
				}
			});
			let listener = self
				.core
				.listen_raw(transaction, out.core.node, action, false, false, false);
			out.core.retain(listener);
			out
		})
	}

	/// Lets firings through only while `control` samples `true`.
	pub fn gate(&self, control: &Cell<bool>) -> Self {
		self.snapshot(control, |value, open| open.then(|| value.clone()))
			.filter_some()
	}

	/// The discrete history of this stream as a time-varying value.
	///
	/// `sample` keeps answering the pre-transaction value throughout a
	/// transaction; an update becomes visible in the next one.
	pub fn hold(&self, initial: T) -> Cell<T> {
		Transaction::with(|transaction| {
			let updates = self.last_firing_only_(transaction);
			Cell::new_(transaction, updates, CellValue::Ready(initial))
		})
	}

	/// [`hold`](`Stream::hold`) with an initial value that is only computed
	/// if something samples the cell before its first update settles.
	pub fn hold_lazy(&self, initial: impl 'static + Send + FnOnce() -> T) -> Cell<T> {
		Transaction::with(|transaction| {
			let updates = self.last_firing_only_(transaction);
			Cell::new_(transaction, updates, CellValue::Lazy(Box::new(initial)))
		})
	}

	/// Passes along only the first firing, then unlistens itself within
	/// that same transaction.
	#[must_use]
	pub fn once(&self) -> Self {
		Transaction::with(|transaction| {
			let out = Stream::new();
			let weak_out = Arc::downgrade(&out.core);
			let armed: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
			let trigger = Arc::clone(&armed);
			let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
				let taken = trigger.lock().take();
				if let Some(taken) = taken {
					if let Some(out) = weak_out.upgrade() {
						out.fire(transaction, value.clone());
					}
					taken.unlisten();
				}
			});
			let listener = self
				.core
				.listen_raw(transaction, out.core.node, action, false, false, false);
			*armed.lock() = Some(listener.clone());
			out.core.retain(listener);
			out
		})
	}

	/// Accumulates state across transactions, starting from `initial`.
	///
	/// The returned cell samples to the state as of the previous
	/// transaction and picks up `f(firing, state)` one transaction later —
	/// the recursion goes through a loop, so the combiner may freely read
	/// the pre-transaction state.
	pub fn accum<S: 'static + Clone + Send>(
		&self,
		initial: S,
		f: impl 'static + Send + Sync + Fn(&T, &S) -> S,
	) -> Cell<S> {
		Transaction::with(|_| {
			let looped = StreamLoop::new();
			let state = looped.stream().hold(initial.clone());
			let advanced = self.snapshot(&state, f);
			looped
				.bind(&advanced)
				.expect("freshly created loop binds exactly once");
			advanced.hold(initial)
		})
	}

	/// Transforms firings through a state machine: `f` maps the firing and
	/// the current state to an output and the successor state.
	pub fn collect<B: 'static + Clone + Send, S: 'static + Clone + Send>(
		&self,
		initial: S,
		f: impl 'static + Send + Sync + Fn(&T, &S) -> (B, S),
	) -> Stream<B> {
		Transaction::with(|_| {
			let looped = StreamLoop::new();
			let state = looped.stream().hold(initial);
			let stepped = self.snapshot(&state, f);
			let successors = stepped.map(|(_, state): &(B, S)| state.clone());
			looped
				.bind(&successors)
				.expect("freshly created loop binds exactly once");
			stepped.map(|(output, _)| output.clone())
		})
	}
}

impl<T: 'static + Clone + Send> Stream<Option<T>> {
	/// Unwraps the occupied firings, dropping the empty ones.
	pub fn filter_some(&self) -> Stream<T> {
		Transaction::with(|transaction| {
			let out = Stream::new();
			let weak_out = Arc::downgrade(&out.core);
			let action: Arc<TransactionHandler<Option<T>>> =
				Arc::new(move |transaction, value: &Option<T>| {
					if let (Some(out), Some(value)) = (weak_out.upgrade(), value.as_ref()) {
						out.fire(transaction, value.clone());
					}
				});
			let listener = self
				.core
				.listen_raw(transaction, out.core.node, action, false, false, false);
			out.core.retain(listener);
			out
		})
	}
}

struct Coalescer<T> {
	combine: Box<dyn 'static + Send + Sync + Fn(&T, &T) -> T>,
	pending: Mutex<Option<T>>,
}

/// External ingress into the graph: the only primitive that originates
/// firings.
///
/// Clones feed the same stream.
pub struct StreamSink<T> {
	stream: Stream<T>,
	coalescer: Option<Arc<Coalescer<T>>>,
}

impl<T> Clone for StreamSink<T> {
	fn clone(&self) -> Self {
		Self {
			stream: self.stream.clone(),
			coalescer: self.coalescer.clone(),
		}
	}
}

impl<T> fmt::Debug for StreamSink<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StreamSink")
			.field("node", &self.stream.core.node)
			.field("coalescing", &self.coalescer.is_some())
			.finish()
	}
}

impl<T: 'static + Clone + Send> Default for StreamSink<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: 'static + Clone + Send> StreamSink<T> {
	/// A sink whose sends each become their own firing.
	#[must_use]
	pub fn new() -> Self {
		Self {
			stream: Stream::new(),
			coalescer: None,
		}
	}

	/// A sink that folds all sends of one transaction into a single firing
	/// with `combine`.
	#[must_use]
	pub fn new_with_coalescer(combine: impl 'static + Send + Sync + Fn(&T, &T) -> T) -> Self {
		Self {
			stream: Stream::new(),
			coalescer: Some(Arc::new(Coalescer {
				combine: Box::new(combine),
				pending: Mutex::new(None),
			})),
		}
	}

	/// The stream this sink feeds.
	#[must_use]
	pub fn stream(&self) -> Stream<T> {
		self.stream.clone()
	}

	/// Sends `value`, opening a transaction if none is active.
	///
	/// # Errors
	///
	/// [`Error::SendFromCallback`] iff called from inside a listener
	/// callback, anywhere in the call stack. Nothing is sent then.
	pub fn send(&self, value: T) -> Result<(), Error> {
		Transaction::with(|transaction| {
			if runtime::in_callback() {
				return Err(Error::SendFromCallback);
			}
			match &self.coalescer {
				None => self.stream.core.fire(transaction, value),
				Some(coalescer) => {
					let mut slot = coalescer.pending.lock();
					if let Some(pending) = slot.take() {
						*slot = Some((coalescer.combine)(&pending, &value));
					} else {
						*slot = Some(value);
						let coalescer = Arc::clone(coalescer);
						let weak_out = Arc::downgrade(&self.stream.core);
						transaction.prioritized(self.stream.core.node, move |transaction| {
							if let (Some(out), Some(value)) =
								(weak_out.upgrade(), coalescer.pending.lock().take())
							{
								out.fire(transaction, value);
							}
						});
					}
				}
			}
			Ok(())
		})
	}
}
