//! Time-varying values: exactly one observable value per transaction.

use std::{
	fmt, mem,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use sapwood::{
	error::Error,
	runtime::{self, Transaction},
};

use crate::{
	listener::Listener,
	stream::{Stream, StreamSink, TransactionHandler},
};

pub(crate) enum CellValue<T> {
	Ready(T),
	Lazy(Box<dyn 'static + Send + FnOnce() -> T>),
	/// Transient marker while a lazy initialiser runs.
	Evaluating,
}

pub(crate) struct CellCore<T> {
	value: Mutex<CellValue<T>>,
	/// Written at most once per transaction: the backing stream is the
	/// coalesced last-firing-only view of its source.
	next: Mutex<Option<T>>,
	cleanup: Mutex<Option<Listener>>,
}

impl<T> Drop for CellCore<T> {
	fn drop(&mut self) {
		if let Some(listener) = self.cleanup.get_mut().take() {
			listener.unlisten();
		}
	}
}

/// A time-varying value.
///
/// [`sample`](`Cell::sample`) answers the value as of the start of the
/// current transaction for the whole transaction; an update settles in the
/// `last` phase and becomes visible to later transactions.
pub struct Cell<T> {
	core: Arc<CellCore<T>>,
	updates: Stream<T>,
}

impl<T> Clone for Cell<T> {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
			updates: self.updates.clone(),
		}
	}
}

impl<T> fmt::Debug for Cell<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Cell").field("updates", &self.updates).finish()
	}
}

impl<T: 'static + Clone + Send> Cell<T> {
	/// A cell that always samples to `value`.
	#[must_use]
	pub fn constant(value: T) -> Self {
		Stream::never().hold(value)
	}

	/// Wires a cell to `updates`: each per-transaction firing stores the
	/// next value and schedules the `last`-phase swap.
	pub(crate) fn new_(
		transaction: &mut Transaction,
		updates: Stream<T>,
		initial: CellValue<T>,
	) -> Self {
		let core = Arc::new(CellCore {
			value: Mutex::new(initial),
			next: Mutex::new(None),
			cleanup: Mutex::new(None),
		});
		let weak = Arc::downgrade(&core);
		let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
			if let Some(core) = weak.upgrade() {
				let mut next = core.next.lock();
				if next.is_none() {
					let weak = Weak::clone(&weak);
					transaction.last(move || {
						if let Some(core) = weak.upgrade() {
							if let Some(settled) = core.next.lock().take() {
								// The outgoing value may own further
								// graph; drop it unlocked.
								let previous = mem::replace(
									&mut *core.value.lock(),
									CellValue::Ready(settled),
								);
								drop(previous);
							}
						}
					});
				}
				*next = Some(value.clone());
			}
		});
		let node = runtime::new_leaf_node();
		let listener = updates
			.core
			.listen_raw(transaction, node, action, false, false, true);
		*core.cleanup.lock() = Some(listener);
		Self { core, updates }
	}

	/// The value as of the start of the current transaction, opening one if
	/// none is active.
	pub fn sample(&self) -> T {
		Transaction::with(|_| self.current())
	}

	/// The pre-swap value; forces a lazy initialiser on first use.
	pub(crate) fn current(&self) -> T {
		{
			let slot = self.core.value.lock();
			if let CellValue::Ready(value) = &*slot {
				return value.clone();
			}
		}
		let thunk = {
			let mut slot = self.core.value.lock();
			match mem::replace(&mut *slot, CellValue::Evaluating) {
				CellValue::Ready(value) => {
					let ready = value.clone();
					*slot = CellValue::Ready(value);
					return ready;
				}
				CellValue::Lazy(thunk) => thunk,
				CellValue::Evaluating => panic!("lazy cell initialiser sampled its own cell"),
			}
		};
		let value = thunk();
		*self.core.value.lock() = CellValue::Ready(value.clone());
		value
	}

	/// The stream of this cell's updates, at most one firing per
	/// transaction.
	#[must_use]
	pub fn updates(&self) -> Stream<T> {
		self.updates.clone()
	}

	/// A cell whose value is always `f` of this cell's value.
	pub fn map<B: 'static + Clone + Send>(
		&self,
		f: impl 'static + Send + Sync + Fn(&T) -> B,
	) -> Cell<B> {
		Transaction::with(|_| {
			let f = Arc::new(f);
			let mapped = self.updates().map({
				let f = Arc::clone(&f);
				move |value| f(value)
			});
			let source = self.clone();
			mapped.hold_lazy(move || f(&source.current()))
		})
	}
}

/// A [`Cell`] fed directly from external code.
///
/// Clones feed the same cell.
pub struct CellSink<T> {
	sink: StreamSink<T>,
	cell: Cell<T>,
}

impl<T> Clone for CellSink<T> {
	fn clone(&self) -> Self {
		Self {
			sink: self.sink.clone(),
			cell: self.cell.clone(),
		}
	}
}

impl<T> fmt::Debug for CellSink<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CellSink").field("sink", &self.sink).finish()
	}
}

impl<T: 'static + Clone + Send> CellSink<T> {
	/// A cell sink currently sampling to `initial`.
	#[must_use]
	pub fn new(initial: T) -> Self {
		let sink = StreamSink::new();
		let cell = sink.stream().hold(initial);
		Self { sink, cell }
	}

	/// Schedules `value` as the cell's next value; it becomes observable
	/// once the transaction closes. The last send of a transaction wins.
	///
	/// # Errors
	///
	/// [`Error::SendFromCallback`] iff called from inside a listener
	/// callback.
	pub fn send(&self, value: T) -> Result<(), Error> {
		self.sink.send(value)
	}

	/// The cell this sink feeds.
	#[must_use]
	pub fn cell(&self) -> Cell<T> {
		self.cell.clone()
	}

	/// Samples the fed cell. See [`Cell::sample`].
	pub fn sample(&self) -> T {
		self.cell.sample()
	}
}
