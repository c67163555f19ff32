//! Forward references: declare a stream or cell now, define it later in the
//! same transaction. This is how recursive networks are built without ever
//! putting an ordinary cycle into the graph.

use std::sync::Arc;

use parking_lot::Mutex;
use sapwood::{error::Error, runtime::Transaction};

use crate::{
	cell::Cell,
	stream::{Stream, TransactionHandler},
};

/// A placeholder stream, to be [`bind`](`StreamLoop::bind`)ed to its
/// definition before the creating transaction closes.
pub struct StreamLoop<T> {
	stream: Stream<T>,
}

impl<T> core::fmt::Debug for StreamLoop<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("StreamLoop").field("stream", &self.stream).finish()
	}
}

impl<T: 'static + Clone + Send> Default for StreamLoop<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: 'static + Clone + Send> StreamLoop<T> {
	/// Creates the placeholder and registers it with the open transaction.
	///
	/// The transaction refuses to close (with [`Error::LoopNotClosed`])
	/// until the placeholder is bound.
	///
	/// # Panics
	///
	/// Panics if no transaction is active: forward references only make
	/// sense inside an explicit [`Transaction::run`].
	#[must_use]
	pub fn new() -> Self {
		Self::with_kind("StreamLoop")
	}

	pub(crate) fn with_kind(kind: &'static str) -> Self {
		assert!(
			Transaction::is_active(),
			"StreamLoop and CellLoop must be created inside an explicit transaction"
		);
		Transaction::with(|transaction| {
			let stream = Stream::new();
			transaction.register_loop(stream.core.node, kind);
			Self { stream }
		})
	}

	/// The placeholder itself, usable in definitions before it is bound.
	#[must_use]
	pub fn stream(&self) -> Stream<T> {
		self.stream.clone()
	}

	/// Binds the placeholder to its definition.
	///
	/// The installed edge is the deferred kind: it raises the
	/// placeholder's rank above the definition but is exempt from rank
	/// regeneration, which is what keeps the recursion out of the
	/// topological order.
	///
	/// # Errors
	///
	/// [`Error::DoubleLoop`] iff this placeholder was already bound.
	pub fn bind(&self, definition: &Stream<T>) -> Result<(), Error> {
		Transaction::with(|transaction| {
			transaction.close_loop(self.stream.core.node)?;
			let weak = Arc::downgrade(&self.stream.core);
			let action: Arc<TransactionHandler<T>> = Arc::new(move |transaction, value| {
				if let Some(placeholder) = weak.upgrade() {
					placeholder.fire(transaction, value.clone());
				}
			});
			let listener = definition.core.listen_raw(
				transaction,
				self.stream.core.node,
				action,
				false,
				true,
				false,
			);
			self.stream.core.retain(listener);
			Ok(())
		})
	}
}

/// A placeholder cell, to be [`bind`](`CellLoop::bind`)ed to its definition
/// before the creating transaction closes.
///
/// The one-transaction update delay is what makes the self-reference sound:
/// a definition may `snapshot` the loop's own cell and will read the
/// previous transaction's state.
pub struct CellLoop<T> {
	stream: StreamLoop<T>,
	cell: Cell<T>,
	bound: Arc<Mutex<Option<Cell<T>>>>,
}

impl<T> core::fmt::Debug for CellLoop<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("CellLoop").field("stream", &self.stream).finish()
	}
}

impl<T: 'static + Clone + Send> Default for CellLoop<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: 'static + Clone + Send> CellLoop<T> {
	/// Creates the placeholder cell.
	///
	/// Its initial value is borrowed lazily from the definition, so it must
	/// not be sampled before [`bind`](`CellLoop::bind`).
	///
	/// # Panics
	///
	/// Panics if no transaction is active.
	#[must_use]
	pub fn new() -> Self {
		let stream = StreamLoop::with_kind("CellLoop");
		let bound: Arc<Mutex<Option<Cell<T>>>> = Arc::new(Mutex::new(None));
		let initial = Arc::clone(&bound);
		let cell = stream.stream().hold_lazy(move || {
			let bound = initial.lock();
			bound
				.as_ref()
				.expect("CellLoop sampled before it was bound")
				.current()
		});
		Self {
			stream,
			cell,
			bound,
		}
	}

	/// The placeholder itself, usable in definitions before it is bound.
	#[must_use]
	pub fn cell(&self) -> Cell<T> {
		self.cell.clone()
	}

	/// Binds the placeholder to its definition.
	///
	/// # Errors
	///
	/// [`Error::DoubleLoop`] iff this placeholder was already bound.
	pub fn bind(&self, definition: &Cell<T>) -> Result<(), Error> {
		Transaction::with(|_| {
			self.stream.bind(&definition.updates())?;
			*self.bound.lock() = Some(definition.clone());
			Ok(())
		})
	}
}
