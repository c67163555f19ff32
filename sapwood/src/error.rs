//! The error taxonomy of the propagation runtime.

use thiserror::Error;

/// Errors surfaced by transactional propagation.
///
/// # Logic
///
/// [`SendFromCallback`](`Error::SendFromCallback`), [`LoopNotClosed`](`Error::LoopNotClosed`)
/// and [`DoubleLoop`](`Error::DoubleLoop`) are recoverable: the runtime's state is
/// unchanged (respectively: rolled back) when they are returned.
///
/// [`RankOverflow`](`Error::RankOverflow`) and [`CycleDetected`](`Error::CycleDetected`)
/// are fatal. They indicate that rank regeneration could not restore the
/// propagation order, so the runtime **must not** be used further. They are
/// raised as panics, rendered from this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
	/// A `send` was invoked while a listener callback was executing.
	///
	/// Listeners must never originate external events; doing so would nest
	/// an ingress inside the very propagation pass that is serving it.
	#[error("`send` called from inside a listener callback")]
	SendFromCallback,

	/// A transaction closed while a forward-reference loop created within it
	/// was still unbound.
	///
	/// The transaction aborts without running its `last` and `post` phases.
	#[error("transaction closed with an unbound {kind}")]
	LoopNotClosed {
		/// Which placeholder kind was left unbound.
		kind: &'static str,
	},

	/// A forward-reference loop was bound twice.
	#[error("forward-reference loop bound twice")]
	DoubleLoop,

	/// A node rank exceeded [`u64::MAX`] during rank regeneration. Fatal.
	#[error("node rank overflowed during rank regeneration")]
	RankOverflow,

	/// Rank regeneration failed to terminate within its step bound. Fatal.
	///
	/// This means a dependency cycle was built out of ordinary edges, which
	/// cannot happen when recursion goes through the loop primitives.
	#[error("rank regeneration did not terminate (dependency cycle outside a loop)")]
	CycleDetected,
}
