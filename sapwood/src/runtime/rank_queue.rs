//! The rank-ordered work queue of a transaction.
//!
//! A min-heap keyed on `(rank at push, sequence)`. The sequence number is
//! the stable FIFO tiebreak for siblings of equal rank; it survives
//! [`resort`](`RankQueue::resort`), so re-keying after rank regeneration
//! preserves arrival order within each rank.

use std::{
	cmp::{Ordering, Reverse},
	collections::BinaryHeap,
	mem,
};

use super::Transaction;
use crate::node::{NodeGraph, NodeId};

pub(super) type Action = dyn 'static + Send + FnOnce(&mut Transaction);

pub(super) struct RankQueue {
	heap: BinaryHeap<Reverse<Entry>>,
	next_seq: u64,
}

struct Entry {
	rank: u64,
	seq: u64,
	node: NodeId,
	action: Box<Action>,
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		(self.rank, self.seq) == (other.rank, other.seq)
	}
}

impl Eq for Entry {}

impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Entry {
	fn cmp(&self, other: &Self) -> Ordering {
		(self.rank, self.seq).cmp(&(other.rank, other.seq))
	}
}

impl RankQueue {
	pub(super) fn new() -> Self {
		Self {
			heap: BinaryHeap::new(),
			next_seq: 0,
		}
	}

	pub(super) fn push(&mut self, node: NodeId, rank: u64, action: Box<Action>) {
		let seq = self.next_seq;
		self.next_seq += 1;
		self.heap.push(Reverse(Entry {
			rank,
			seq,
			node,
			action,
		}));
	}

	pub(super) fn pop(&mut self) -> Option<Box<Action>> {
		self.heap.pop().map(|Reverse(entry)| entry.action)
	}

	/// Re-keys every pending item to its node's current rank.
	///
	/// Items whose node has been dropped keep the rank they were pushed
	/// with; their actions are expected to no-op at dispatch.
	pub(super) fn resort(&mut self, graph: &NodeGraph) {
		let entries = mem::take(&mut self.heap);
		self.heap = entries
			.into_iter()
			.map(|Reverse(mut entry)| {
				entry.rank = graph.rank(entry.node).unwrap_or(entry.rank);
				Reverse(entry)
			})
			.collect();
	}

	pub(super) fn clear(&mut self) {
		self.heap.clear();
	}
}

#[cfg(test)]
mod tests {
	use core::{marker::PhantomData, num::NonZeroU64};
	use std::sync::{Arc, Mutex};

	use super::{RankQueue, Transaction};
	use crate::node::{NodeGraph, NodeId};

	fn node(raw: u64) -> NodeId {
		NodeId::new(NonZeroU64::new(raw).expect("test node ids start at 1"))
	}

	fn push_tagged(
		queue: &mut RankQueue,
		node_id: u64,
		rank: u64,
		tag: &'static str,
		order: &Arc<Mutex<Vec<&'static str>>>,
	) {
		let order = Arc::clone(order);
		queue.push(
			node(node_id),
			rank,
			Box::new(move |_| order.lock().unwrap().push(tag)),
		);
	}

	#[test]
	fn pops_by_rank_then_fifo() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let mut queue = RankQueue::new();
		push_tagged(&mut queue, 1, 5, "b1", &order);
		push_tagged(&mut queue, 2, 0, "a1", &order);
		push_tagged(&mut queue, 3, 5, "b2", &order);
		push_tagged(&mut queue, 4, 0, "a2", &order);

		let mut transaction = Transaction {
			_not_send: PhantomData,
		};
		while let Some(action) = queue.pop() {
			action(&mut transaction);
		}
		assert_eq!(*order.lock().unwrap(), ["a1", "a2", "b1", "b2"]);
	}

	#[test]
	fn resort_follows_current_ranks_and_keeps_fifo() {
		let mut graph = NodeGraph::new();
		graph.register(node(1), 9);
		graph.register(node(2), 1);

		let order = Arc::new(Mutex::new(Vec::new()));
		let mut queue = RankQueue::new();
		// Pushed at stale ranks: node 1 claimed to be lowest.
		push_tagged(&mut queue, 1, 0, "one/a", &order);
		push_tagged(&mut queue, 2, 5, "two", &order);
		push_tagged(&mut queue, 1, 0, "one/b", &order);

		queue.resort(&graph);

		let mut transaction = Transaction {
			_not_send: PhantomData,
		};
		while let Some(action) = queue.pop() {
			action(&mut transaction);
		}
		assert_eq!(*order.lock().unwrap(), ["two", "one/a", "one/b"]);
	}
}
