use aggview_core::{
    Atom, AtomError, AtomOperation, BatchFailurePolicy, MergeError, MergeStore, StorePolicy,
    SOURCE_TAG_FIELD,
};
use std::sync::Arc;
use std::thread;

fn site(id: &str, load: &str) -> Atom {
    Atom::new()
        .with_identifier("siteId", id)
        .with_value("load", load)
}

fn key(id: &str) -> Atom {
    Atom::new().with_identifier("siteId", id)
}

#[test]
fn identical_upserts_are_idempotent() {
    let once = MergeStore::new();
    once.apply_batch("north", &[AtomOperation::add(site("A", "3"))])
        .unwrap();

    let twice = MergeStore::new();
    for _ in 0..2 {
        twice
            .apply_batch("north", &[AtomOperation::change(site("A", "3"))])
            .unwrap();
    }

    assert_eq!(
        once.snapshot_atoms(true).to_vec(),
        twice.snapshot_atoms(true).to_vec()
    );
    assert_eq!(once.serialize().unwrap(), twice.serialize().unwrap());
}

#[test]
fn remove_of_absent_key_is_noop_and_add_restores() {
    let store = MergeStore::new();
    store
        .apply_batch("north", &[AtomOperation::add(site("A", "3"))])
        .unwrap();
    store
        .apply_batch("north", &[AtomOperation::remove(key("Z"))])
        .expect("absent key");
    store
        .apply_batch("north", &[AtomOperation::remove(key("A"))])
        .unwrap();
    assert!(store.snapshot_atoms(false).is_empty());

    store
        .apply_batch("north", &[AtomOperation::add(site("A", "4"))])
        .unwrap();
    assert_eq!(store.snapshot_atoms(false).to_vec(), vec![site("A", "4")]);
}

#[test]
fn schema_is_fixed_by_first_atom() {
    let store = MergeStore::new();
    store
        .apply_batch(
            "north",
            &[AtomOperation::add(
                site("A", "3").with_identifier("rack", "r1"),
            )],
        )
        .unwrap();
    assert_eq!(
        store.schema().expect("schema learned").names(),
        ["siteId", "rack"]
    );

    let err = store
        .apply_batch("south", &[AtomOperation::add(site("A", "5"))])
        .expect_err("rack is missing");
    assert!(matches!(
        err,
        MergeError::KeyDerivation {
            error: AtomError::MissingIdentifier(ref field),
            ..
        } if field == "rack"
    ));

    // Extra identifiers beyond the schema are not part of the key.
    store
        .apply_batch(
            "south",
            &[AtomOperation::add(
                site("A", "5")
                    .with_identifier("rack", "r1")
                    .with_identifier("zone", "z9"),
            )],
        )
        .expect("superset of schema");
    assert_eq!(
        store.schema().expect("schema kept").names(),
        ["siteId", "rack"]
    );
}

#[test]
fn same_key_from_different_sources_is_kept_apart() {
    let store = MergeStore::new();
    store
        .apply_batch("north", &[AtomOperation::add(site("A", "3"))])
        .unwrap();
    store
        .apply_batch("south", &[AtomOperation::add(site("A", "5"))])
        .unwrap();

    let tagged = store.snapshot_atoms(true).to_vec();
    assert_eq!(tagged.len(), 2);
    let sources = tagged
        .iter()
        .map(|atom| atom.identifier(SOURCE_TAG_FIELD).expect("tag"))
        .collect::<Vec<_>>();
    assert_eq!(sources, ["north", "south"]);
}

#[test]
fn skip_invalid_reports_rejected_positions() {
    let store = MergeStore::with_policy(StorePolicy {
        batch_failure: BatchFailurePolicy::SkipInvalid,
        ..StorePolicy::default()
    });
    let outcome = store
        .apply_batch(
            "north",
            &[
                AtomOperation::add(site("A", "1")),
                AtomOperation::add(Atom::new().with_value("load", "2")),
                AtomOperation::remove(Atom::new()),
            ],
        )
        .expect("batch applies");
    let rejected = outcome
        .rejected
        .iter()
        .map(|rejection| rejection.index)
        .collect::<Vec<_>>();
    assert_eq!(rejected, [1, 2]);
    assert_eq!(outcome.applied, 1);
}

#[test]
fn snapshot_is_isolated_from_concurrent_writers() {
    let store = Arc::new(MergeStore::new());
    let initial = (0..50)
        .map(|n| AtomOperation::add(site(&format!("S{n:02}"), "0")))
        .collect::<Vec<_>>();
    store.apply_batch("north", &initial).unwrap();

    let snapshot = store.snapshot_atoms(false);
    let expected = snapshot.to_vec();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for round in 0..200 {
                let id = format!("S{:02}", round % 50);
                let ops = if round % 3 == 0 {
                    vec![AtomOperation::remove(key(&id))]
                } else {
                    vec![AtomOperation::change(site(&id, &round.to_string()))]
                };
                store.apply_batch("north", &ops).expect("writer batch");
                store
                    .apply_batch("south", &[AtomOperation::add(site(&id, "1"))])
                    .expect("writer batch");
            }
        })
    };

    for _ in 0..20 {
        let seen = snapshot.iter().collect::<Vec<_>>();
        assert_eq!(seen, expected);
    }
    writer.join().expect("writer thread");

    assert_eq!(snapshot.to_vec(), expected);
    assert!(store.revision() > snapshot.revision());
}

#[test]
fn exception_map_tracks_latest_message_per_source() {
    let store = MergeStore::new();
    store.record_exception("north", "timeout").unwrap();
    store.record_exception("north", "refused").unwrap();
    store.record_exception("south", "disk full").unwrap();

    let exceptions = store.exception_map();
    assert_eq!(exceptions.get("north").map(String::as_str), Some("refused"));
    assert_eq!(exceptions.len(), 2);
    assert!(store.exception_summary().contains("disk full"));
    assert!(store.snapshot_atoms(false).is_empty());
}
