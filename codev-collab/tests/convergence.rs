//! Engine-level properties: convergence under shuffled submission
//! orders, monotonic versioning, presence consistency, teardown, and the
//! idle sweep with a synthetic clock.

use std::sync::Arc;
use std::time::Duration;

use codev_collab::{
    DocumentState, Edit, EngineConfig, Participant, Payload, RetentionPolicy, SessionRegistry,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Deterministic pseudo-random stream (64-bit LCG), so shuffled orders
/// are reproducible without pulling in a randomness dependency.
fn next(seed: &mut u64) -> u64 {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *seed
}

fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut state = seed;
    for i in (1..items.len()).rev() {
        let j = (next(&mut state) % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

fn seed_doc(content: &str) -> DocumentState {
    let mut doc = DocumentState::new(RetentionPolicy::default());
    doc.submit(
        0,
        Payload::Replace {
            content: content.into(),
        },
        "seed",
        0,
    )
    .unwrap();
    doc
}

#[test]
fn convergence_under_shuffled_submission_order() {
    // Non-overlapping replacements, all declared against version 1.
    // Spans are 6 chars apart with at most 2 chars deleted, so no two
    // edits ever touch the same region.
    let base: String = ('a'..='z').cycle().take(48).collect();
    let mut seed = 0xC0DE;
    let edits: Vec<(String, Edit)> = (0..8)
        .map(|i| {
            let deleted = (next(&mut seed) % 3) as usize;
            let text: String = (0..=(next(&mut seed) % 3))
                .map(|_| char::from(b'A' + (next(&mut seed) % 26) as u8))
                .collect();
            (format!("user-{i}"), Edit::replace(6 * i, deleted, text))
        })
        .collect();

    let mut reference: Option<String> = None;
    for shuffle_seed in [1u64, 7, 42, 1337, 99999] {
        let mut order: Vec<&(String, Edit)> = edits.iter().collect();
        shuffle(&mut order, shuffle_seed);

        let mut doc = seed_doc(&base);
        for (user, edit) in &order {
            doc.submit(1, Payload::Patch { edit: edit.clone() }, user, 0)
                .unwrap();
        }

        assert_eq!(doc.version(), 1 + edits.len() as u64);
        match &reference {
            None => reference = Some(doc.content().to_string()),
            Some(expected) => assert_eq!(
                doc.content(),
                expected,
                "divergence with shuffle seed {shuffle_seed}"
            ),
        }
    }
}

#[test]
fn monotonic_versioning() {
    let mut doc = DocumentState::new(RetentionPolicy::default());
    for i in 0..50u64 {
        let applied = doc
            .submit(i, Payload::Patch { edit: Edit::insert(0, "x") }, "u1", 0)
            .unwrap();
        assert_eq!(applied.version, i + 1);
    }
    assert_eq!(doc.version(), 50);

    // A rejected submission never changes the version.
    assert!(doc
        .submit(99, Payload::Patch { edit: Edit::insert(0, "x") }, "u1", 0)
        .is_err());
    assert_eq!(doc.version(), 50);
}

#[tokio::test]
async fn serialized_concurrent_submissions_all_land() {
    // Eight writers hammer one document; the per-document mutex
    // serializes transform-and-apply, so every submission lands and the
    // final version equals the submission count.
    let doc = Arc::new(Mutex::new(DocumentState::new(RetentionPolicy::default())));
    let mut handles = Vec::new();
    for w in 0..8 {
        let doc = doc.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                let mut guard = doc.lock().await;
                let version = guard.version();
                guard
                    .submit(
                        version,
                        Payload::Patch { edit: Edit::insert(0, "x") },
                        &format!("user-{w}"),
                        0,
                    )
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let doc = doc.lock().await;
    assert_eq!(doc.version(), 200);
    assert_eq!(doc.content().chars().count(), 200);
}

#[tokio::test]
async fn presence_matches_join_minus_leave() {
    let registry = SessionRegistry::with_defaults();
    let conns: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();

    for (i, conn) in conns.iter().enumerate() {
        registry
            .join("p1", Participant::new(*conn, format!("u{i}"), format!("user{i}"), 0))
            .await;
    }
    // user1 and user4 leave; user2 reconnects (same connection id).
    registry.leave("p1", conns[1]).await;
    registry.leave("p1", conns[4]).await;
    registry
        .join("p1", Participant::new(conns[2], "u2", "user2", 1))
        .await;

    let present = registry.connections_in("p1").await;
    let expected: Vec<Uuid> = vec![conns[0], conns[2], conns[3], conns[5]];
    assert_eq!(present, expected);

    // No duplicate connection ids after the reconnect.
    let mut deduped = present.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), present.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leave_and_join_never_orphan_the_joiner() {
    // One participant leaves (emptying the session) while another joins
    // the same project. Whatever the interleaving, a joiner who never
    // left must end up in a live session; teardown may only win when the
    // session is still empty at removal time.
    let registry = Arc::new(SessionRegistry::with_defaults());

    for round in 0..2_000u32 {
        let alice = Uuid::new_v4();
        registry
            .join("p1", Participant::new(alice, "u1", "alice", 0))
            .await;

        let bob = Uuid::new_v4();
        let leaver = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.leave("p1", alice).await })
        };
        let joiner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .join("p1", Participant::new(bob, "u2", "bob", 0))
                    .await
            })
        };
        leaver.await.unwrap();
        joiner.await.unwrap();

        assert!(
            registry.has_session("p1").await,
            "round {round}: joiner orphaned, session torn down under them"
        );
        assert!(
            registry.connections_in("p1").await.contains(&bob),
            "round {round}: joiner missing from presence"
        );

        registry.leave("p1", bob).await;
        registry.leave("p1", alice).await;
    }
}

#[tokio::test]
async fn teardown_discards_state_for_real() {
    let registry = SessionRegistry::with_defaults();
    let conn = Uuid::new_v4();
    registry
        .join("p1", Participant::new(conn, "u1", "alice", 0))
        .await;

    let doc = registry.document("p1", "frontend").await;
    doc.lock()
        .await
        .submit(
            0,
            Payload::Replace {
                content: "must not survive".into(),
            },
            "u1",
            0,
        )
        .unwrap();
    drop(doc);

    registry.leave("p1", conn).await;
    assert!(!registry.has_session("p1").await);

    let fresh = registry.document("p1", "frontend").await;
    let fresh = fresh.lock().await;
    assert_eq!(fresh.version(), 0);
    assert_eq!(fresh.content(), "");
}

#[tokio::test]
async fn idle_sweep_evicts_with_synthetic_clock() {
    let config = EngineConfig {
        idle_timeout: Duration::from_secs(30 * 60),
        ..EngineConfig::default()
    };
    let registry = SessionRegistry::new(config);

    let start = 1_000_000u64;
    registry
        .join("p1", Participant::new(Uuid::new_v4(), "u1", "alice", start))
        .await;

    // 29 minutes later: kept. 31 minutes later: evicted, no leave event
    // ever arrived.
    assert_eq!(registry.sweep(start + 29 * 60 * 1000).await, 0);
    assert!(registry.has_session("p1").await);
    assert_eq!(registry.sweep(start + 31 * 60 * 1000).await, 1);
    assert!(!registry.has_session("p1").await);
}

#[tokio::test]
async fn activity_defers_idle_eviction() {
    let config = EngineConfig {
        idle_timeout: Duration::from_secs(30 * 60),
        ..EngineConfig::default()
    };
    let registry = SessionRegistry::new(config);

    let start = 0u64;
    let conn = Uuid::new_v4();
    registry
        .join("p1", Participant::new(conn, "u1", "alice", start))
        .await;

    // A cursor move at minute 20 resets the idle window.
    registry
        .update_cursor(
            "p1",
            conn,
            "frontend",
            codev_collab::CursorPosition { line: 1, column: 1 },
            20 * 60 * 1000,
        )
        .await;

    assert_eq!(registry.sweep(40 * 60 * 1000).await, 0);
    assert!(registry.has_session("p1").await);
    assert_eq!(registry.sweep(51 * 60 * 1000).await, 1);
}

#[test]
fn stale_chains_transform_transitively() {
    // A client three versions behind still lands correctly: its edit is
    // transformed across every intervening operation in order.
    let mut doc = seed_doc("0123456789");
    doc.submit(1, Payload::Patch { edit: Edit::insert(0, "AA") }, "u1", 0)
        .unwrap(); // v2: "AA0123456789"
    doc.submit(2, Payload::Patch { edit: Edit::insert(6, "BB") }, "u1", 0)
        .unwrap(); // v3: "AA0123BB456789"

    // u2 edits "0123456789" at position 8 (the '8'), declared against v1.
    let applied = doc
        .submit(1, Payload::Patch { edit: Edit::insert(8, "!") }, "u2", 0)
        .unwrap();
    assert_eq!(applied.version, 4);
    // Shifted by +2 (AA) and +2 (BB, which landed before position 8).
    assert_eq!(doc.content(), "AA0123BB4567!89");
}
