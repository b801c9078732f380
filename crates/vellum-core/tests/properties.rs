//! Property-based workloads over the whole store: whatever sequence of
//! appends runs, stream read-back, revision contiguity, global
//! monotonicity, idempotent replays, and reopen stability must all hold.

use std::collections::HashMap;

use proptest::prelude::*;
use vellum_core::{ExpectedRevision, Store, StoreConfig};

/// One append in a generated workload.
#[derive(Debug, Clone)]
struct WorkloadAppend {
    stream: u8,
    events: Vec<Vec<u8>>,
    /// Replay the append immediately with the same command id.
    replay: bool,
}

fn workload() -> impl Strategy<Value = Vec<WorkloadAppend>> {
    proptest::collection::vec(
        (
            0u8..4,
            proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..4),
            proptest::bool::weighted(0.2),
        )
            .prop_map(|(stream, events, replay)| WorkloadAppend {
                stream,
                events,
                replay,
            }),
        1..24,
    )
}

fn small_config() -> StoreConfig {
    StoreConfig {
        // Tiny segments so workloads cross roll boundaries regularly.
        segment_max_bytes: 2048,
        ..StoreConfig::default()
    }
}

async fn run_workload(
    store: &Store,
    ops: &[WorkloadAppend],
) -> HashMap<String, Vec<Vec<u8>>> {
    let mut model: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        let stream = format!("s-{}", op.stream);
        let command = format!("c-{i}");
        let receipt = store
            .append(
                &stream,
                &command,
                ExpectedRevision::Any,
                op.events.clone(),
                "tenant",
            )
            .await
            .unwrap();

        if op.replay {
            let again = store
                .append(
                    &stream,
                    &command,
                    ExpectedRevision::Any,
                    op.events.clone(),
                    "tenant",
                )
                .await
                .unwrap();
            assert_eq!(receipt, again, "replay must return the original receipt");
        }

        model.entry(stream).or_default().extend(op.events.clone());
    }
    model
}

fn check_invariants(store: &Store, model: &HashMap<String, Vec<Vec<u8>>>) {
    // P1: read-back per stream, exactly and in order.
    for (stream, expected) in model {
        let events = store.read_stream(stream, 0, 10_000, "tenant").unwrap();
        assert_eq!(events.len(), expected.len(), "stream {stream} length");
        for (i, (event, payload)) in events.iter().zip(expected).enumerate() {
            assert_eq!(&event.payload, payload, "stream {stream} event {i}");
            // P2: revisions are exactly 1..=n.
            assert_eq!(event.stream_rev, i as u64 + 1);
        }
        assert_eq!(
            store.get_stream_revision(stream, "tenant").unwrap(),
            expected.len() as u64
        );
    }

    // P3: global order is strictly increasing and gap-free.
    let total: usize = model.values().map(Vec::len).sum();
    let global = store.read_global(0, 100_000).unwrap();
    assert_eq!(global.len(), total);
    for (i, event) in global.iter().enumerate() {
        assert_eq!(event.global_pos, i as u64 + 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        ..ProptestConfig::default()
    })]

    #[test]
    fn random_workloads_hold_store_invariants(ops in workload()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::open_with_config(dir.path(), small_config()).unwrap();
            let model = run_workload(&store, &ops).await;
            check_invariants(&store, &model);
            store.close().await;

            // P6-lite: reopen and everything still holds at the same
            // positions.
            let store = Store::open_with_config(dir.path(), small_config()).unwrap();
            check_invariants(&store, &model);
            store.close().await;
        });
    }
}
