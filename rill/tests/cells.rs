use std::sync::{
	atomic::{AtomicBool, Ordering::Relaxed},
	Arc,
};

use rill::{Cell, CellSink, StreamSink, Transaction};

mod _validator;
use _validator::Validator;

#[test]
fn hold_samples_the_latest_settled_value() {
	let sink = StreamSink::new();
	let held = sink.stream().hold(0);

	assert_eq!(held.sample(), 0);
	sink.send(5).unwrap();
	assert_eq!(held.sample(), 5);
	sink.send(6).unwrap();
	assert_eq!(held.sample(), 6);
}

#[test]
fn sample_inside_a_transaction_is_the_pre_transaction_value() {
	let sink = StreamSink::new();
	let held = sink.stream().hold(0);

	Transaction::run(|| {
		sink.send(10).unwrap();
		assert_eq!(held.sample(), 0);
	})
	.unwrap();
	assert_eq!(held.sample(), 10);
}

#[test]
fn snapshot_observes_the_value_with_one_transaction_delay() {
	let v = Arc::new(Validator::new());

	let sink = StreamSink::new();
	let held = sink.stream().hold(0);
	let out = sink.stream().snapshot(&held, |_, seen| *seen);
	let _l = out.listen_weak({
		let v = Arc::clone(&v);
		move |x| v.push(*x)
	});

	sink.send(10).unwrap();
	sink.send(20).unwrap();
	v.expect([0, 10]);
}

#[test]
fn snapshot_combines_firing_and_seen_value() {
	let v = Arc::new(Validator::new());

	let sink = StreamSink::new();
	let held = sink.stream().hold(1);
	let out = sink.stream().snapshot(&held, |x, seen| x * seen);
	let _l = out.listen_weak({
		let v = Arc::clone(&v);
		move |x| v.push(*x)
	});

	sink.send(3).unwrap();
	sink.send(4).unwrap();
	v.expect([3, 12]);
}

#[test]
fn updates_fire_once_per_transaction() {
	let v = Arc::new(Validator::new());

	let sink = StreamSink::new();
	let held = sink.stream().hold(0);
	let _l = held.updates().listen_weak({
		let v = Arc::clone(&v);
		move |x| v.push(*x)
	});

	// Several sends in one transaction settle as a single (last) update.
	Transaction::run(|| {
		sink.send(1).unwrap();
		sink.send(2).unwrap();
		sink.send(3).unwrap();
	})
	.unwrap();
	sink.send(9).unwrap();
	v.expect([3, 9]);
	assert_eq!(held.sample(), 9);
}

#[test]
fn cell_sink_feeds_its_cell() {
	let sink = CellSink::new(0);
	assert_eq!(sink.sample(), 0);
	sink.send(42).unwrap();
	assert_eq!(sink.sample(), 42);

	Transaction::run(|| {
		sink.send(1).unwrap();
		sink.send(2).unwrap();
	})
	.unwrap();
	assert_eq!(sink.sample(), 2);
}

#[test]
fn constant_cells_never_change() {
	let constant = Cell::constant("fixed");
	assert_eq!(constant.sample(), "fixed");

	let v = Arc::new(Validator::new());
	let _l = constant.updates().listen_weak({
		let v = Arc::clone(&v);
		move |x| v.push(*x)
	});
	assert_eq!(constant.sample(), "fixed");
	v.expect([]);
}

#[test]
fn map_tracks_the_source_cell() {
	let sink = CellSink::new(2);
	let squared = sink.cell().map(|x| x * x);

	assert_eq!(squared.sample(), 4);
	sink.send(5).unwrap();
	assert_eq!(squared.sample(), 25);
}

#[test]
fn hold_lazy_defers_the_initial_value() {
	let forced = Arc::new(AtomicBool::new(false));

	let sink = StreamSink::new();
	let held = sink.stream().hold_lazy({
		let forced = Arc::clone(&forced);
		move || {
			forced.store(true, Relaxed);
			0
		}
	});

	assert!(!forced.load(Relaxed));
	assert_eq!(held.sample(), 0);
	assert!(forced.load(Relaxed));
}

#[test]
fn hold_lazy_skips_the_initialiser_once_updated() {
	let forced = Arc::new(AtomicBool::new(false));

	let sink = StreamSink::new();
	let held = sink.stream().hold_lazy({
		let forced = Arc::clone(&forced);
		move || {
			forced.store(true, Relaxed);
			0
		}
	});

	sink.send(7).unwrap();
	assert_eq!(held.sample(), 7);
	assert!(!forced.load(Relaxed));
}

#[test]
fn rehold_of_updates_behaves_like_the_original() {
	let sink = StreamSink::new();
	let original = sink.stream().hold(0);
	let reheld = original.updates().hold(0);

	assert_eq!(original.sample(), reheld.sample());
	for x in [3, 1, 4, 1, 5] {
		sink.send(x).unwrap();
		assert_eq!(original.sample(), reheld.sample());
	}
}
