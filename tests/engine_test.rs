//! Integration tests for the bounded-parallelism engine.

use fanout::engine::{ForEach, for_each, for_each_indexed, for_each_sequential};
use fanout::error::Error;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counts units currently inside their body and remembers the peak.
#[derive(Default)]
struct Gauge {
    current: Mutex<usize>,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let mut current = self.current.lock().unwrap();
        *current += 1;
        self.peak.fetch_max(*current, Ordering::SeqCst);
    }

    fn exit(&self) {
        *self.current.lock().unwrap() -= 1;
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Sequential mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_records_in_element_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    for_each(
        vec![1, 2, 3],
        move |x| {
            let s = Arc::clone(&s);
            async move {
                s.lock().unwrap().push(x);
                Ok::<(), String>(())
            }
        },
        1,
    )
    .await
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn sequential_finishes_each_unit_before_starting_the_next() {
    let events = Arc::new(Mutex::new(Vec::new()));

    let e = Arc::clone(&events);
    for_each(
        vec![30u64, 10, 20],
        move |ms| {
            let e = Arc::clone(&e);
            async move {
                e.lock().unwrap().push(format!("start {ms}"));
                tokio::time::sleep(Duration::from_millis(ms)).await;
                e.lock().unwrap().push(format!("end {ms}"));
                Ok::<(), String>(())
            }
        },
        1,
    )
    .await
    .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "start 30", "end 30", "start 10", "end 10", "start 20", "end 20"
        ]
    );
}

#[tokio::test]
async fn sequential_stops_at_first_failure() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    let err = for_each(
        vec![1, 2, 3],
        move |x| {
            let s = Arc::clone(&s);
            async move {
                s.lock().unwrap().push(x);
                if x == 2 {
                    return Err(format!("failed on {x}"));
                }
                Ok(())
            }
        },
        1,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::UnitOfWork { .. }));
    assert!(err.to_string().contains("failed on 2"));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

// ---------------------------------------------------------------------------
// Exactly-once and empty input
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_element_runs_exactly_once_for_any_bound() {
    for bound in [1, 2, 3, 8, 100] {
        let counts = Arc::new(Mutex::new(HashMap::new()));

        let c = Arc::clone(&counts);
        for_each(
            0..50,
            move |x| {
                let c = Arc::clone(&c);
                async move {
                    tokio::task::yield_now().await;
                    *c.lock().unwrap().entry(x).or_insert(0) += 1;
                    Ok::<(), String>(())
                }
            },
            bound,
        )
        .await
        .unwrap();

        let counts = counts.lock().unwrap();
        assert_eq!(counts.len(), 50, "bound {bound}");
        assert!(counts.values().all(|&n| n == 1), "bound {bound}");
    }
}

#[tokio::test]
async fn empty_sequence_never_calls_the_unit_of_work() {
    for bound in [1, 4] {
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        for_each_indexed(
            Vec::<u8>::new(),
            move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), String>(()) }
            },
            bound,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

// ---------------------------------------------------------------------------
// Parallel mode
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_never_exceeds_the_bound() {
    let gauge = Arc::new(Gauge::default());

    let g = Arc::clone(&gauge);
    for_each(
        0..40,
        move |_| {
            let g = Arc::clone(&g);
            async move {
                g.enter();
                tokio::time::sleep(Duration::from_millis(10)).await;
                g.exit();
                Ok::<(), String>(())
            }
        },
        5,
    )
    .await
    .unwrap();

    assert!(gauge.peak() <= 5, "peak {} exceeded bound", gauge.peak());
    assert!(gauge.peak() >= 2, "expected some overlap, peak {}", gauge.peak());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indexed_parallel_delivers_every_index_once() {
    let gauge = Arc::new(Gauge::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (g, s) = (Arc::clone(&gauge), Arc::clone(&seen));
    for_each_indexed(
        (0..10usize).map(|i| i * 10),
        move |value, index| {
            let (g, s) = (Arc::clone(&g), Arc::clone(&s));
            async move {
                g.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
                s.lock().unwrap().push((value, index));
                g.exit();
                Ok::<(), String>(())
            }
        },
        5,
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    let indices: BTreeSet<usize> = seen.iter().map(|&(_, i)| i).collect();
    assert_eq!(indices, (0..10).collect());
    assert!(seen.iter().all(|&(value, index)| value == index * 10));
    assert!(gauge.peak() <= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_follows_enumeration_not_completion() {
    let finished = Arc::new(Mutex::new(Vec::new()));

    // Earlier elements sleep longer, so they finish last.
    let f = Arc::clone(&finished);
    for_each_indexed(
        vec!["a", "b", "c", "d"],
        move |name, index| {
            let f = Arc::clone(&f);
            async move {
                tokio::time::sleep(Duration::from_millis(15 * (4 - index as u64))).await;
                f.lock().unwrap().push((name, index));
                Ok::<(), String>(())
            }
        },
        4,
    )
    .await
    .unwrap();

    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 4);
    for &(name, index) in finished.iter() {
        assert_eq!(["a", "b", "c", "d"][index], name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_failure_lets_siblings_finish() {
    let completed = Arc::new(Mutex::new(Vec::new()));

    let c = Arc::clone(&completed);
    let err = for_each(
        vec![1, 2, 3],
        move |x| {
            let c = Arc::clone(&c);
            async move {
                if x == 2 {
                    return Err(format!("failed on {x}"));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                c.lock().unwrap().push(x);
                Ok(())
            }
        },
        2,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::UnitOfWork { .. }));
    let mut completed = completed.lock().unwrap().clone();
    completed.sort();
    assert_eq!(completed, vec![1, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_units_release_their_permits() {
    let calls = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&calls);
    let err = for_each(
        0..20,
        move |x: i32| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                if x % 2 == 1 {
                    Err(std::io::Error::other(format!("odd {x}")))
                } else {
                    Ok(())
                }
            }
        },
        2,
    )
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 20);
    // First failure is reported, the other nine are kept as suppressed.
    assert_eq!(err.suppressed().len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_resumes_after_siblings_settle() {
    let completed = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&completed);
    let run = tokio::spawn(for_each(
        0..6,
        move |x| {
            let c = Arc::clone(&c);
            async move {
                if x == 0 {
                    panic!("unit of work panicked");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        3,
    ));

    let joined = run.await;
    assert!(joined.unwrap_err().is_panic());
    assert_eq!(completed.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_while_building_a_unit_lets_siblings_finish() {
    let completed = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&completed);
    let run = tokio::spawn(for_each(
        0..4,
        move |x| {
            if x == 2 {
                panic!("action panicked before returning a future");
            }
            let c = Arc::clone(&c);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        4,
    ));

    assert!(run.await.unwrap_err().is_panic());
    // 0, 1 and 3 all ran to completion before the panic resumed.
    assert_eq!(completed.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

type NoopFuture = std::future::Ready<Result<(), String>>;

#[tokio::test]
async fn zero_bound_is_out_of_range_and_touches_nothing() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let called = Arc::new(AtomicUsize::new(0));

    let p = Arc::clone(&pulled);
    let c = Arc::clone(&called);
    let err = for_each(
        (0..5).inspect(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        }),
        move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<(), String>(()))
        },
        0,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        Error::OutOfRange {
            param: "max_concurrency",
            value: 0
        }
    ));
    assert_eq!(pulled.load(Ordering::SeqCst), 0);
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn negative_bound_is_out_of_range() {
    let err = fanout::engine::concurrency_bound(-3).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { value: -3, .. }));
}

#[tokio::test]
async fn missing_items_is_invalid_argument() {
    let err = ForEach::<Vec<i32>, fn(i32) -> NoopFuture>::new()
        .action(|_| std::future::ready(Ok(())))
        .max_concurrency(2)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument { param: "items" }));
}

#[tokio::test]
async fn missing_action_is_invalid_argument() {
    let err = ForEach::<Vec<i32>, fn(i32) -> NoopFuture>::new()
        .items(vec![1, 2, 3])
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument { param: "action" }));
}

#[tokio::test]
async fn builder_defaults_to_sequential() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    ForEach::new()
        .items(vec![3u64, 1, 2])
        .action(move |x| {
            let s = Arc::clone(&s);
            async move {
                tokio::time::sleep(Duration::from_millis(x * 5)).await;
                s.lock().unwrap().push(x);
                Ok::<(), String>(())
            }
        })
        .run()
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);
}

#[tokio::test]
async fn builder_infers_action_argument_types() {
    let lengths = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&lengths);
    ForEach::new()
        .items(vec!["alpha", "be"])
        .action(move |name| {
            let len = name.len();
            let l = Arc::clone(&l);
            async move {
                l.lock().unwrap().push(len);
                Ok::<(), String>(())
            }
        })
        .run()
        .await
        .unwrap();

    assert_eq!(*lengths.lock().unwrap(), vec![5, 2]);
}

#[tokio::test]
async fn builder_indexed_action_receives_positions() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    ForEach::new()
        .items(vec!["x", "y", "z"])
        .indexed_action(move |name, index| {
            let entry = format!("{index}:{}", name.to_uppercase());
            let s = Arc::clone(&s);
            async move {
                s.lock().unwrap().push(entry);
                Ok::<(), String>(())
            }
        })
        .max_concurrency(3)
        .run_indexed()
        .await
        .unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["0:X", "1:Y", "2:Z"]);
}

// ---------------------------------------------------------------------------
// Sequential entry point with borrowed state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_units_may_borrow_local_state() {
    let prefix = String::from("item");
    let log = RefCell::new(Vec::new());

    let (prefix_ref, log_ref) = (&prefix, &log);
    for_each_sequential(vec![1, 2, 3], move |x| async move {
        tokio::task::yield_now().await;
        log_ref.borrow_mut().push(format!("{prefix_ref}-{x}"));
        Ok::<(), String>(())
    })
    .await
    .unwrap();

    assert_eq!(log.into_inner(), vec!["item-1", "item-2", "item-3"]);
}

#[tokio::test]
async fn sequential_entry_point_stops_at_first_failure() {
    let log = RefCell::new(Vec::new());

    let log_ref = &log;
    let err = for_each_sequential(1..=5, move |x| async move {
        log_ref.borrow_mut().push(x);
        if x == 3 { Err("three") } else { Ok(()) }
    })
    .await
    .unwrap_err();

    assert!(err.to_string().contains("three"));
    assert_eq!(log.into_inner(), vec![1, 2, 3]);
}
