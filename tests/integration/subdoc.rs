//! Sub-document lookups and mutations end to end.

use serde_json::json;

use cbkv::ErrorKind;
use cbkv::kv::{LookupInOptions, MutateInOptions, UpsertOptions};
use cbkv::proto::{LookupInSpec, MutateInSpec, Status};

use crate::fixtures::Rig;

fn seeded_rig() -> (Rig, cbkv::kv::Collection) {
    let rig = Rig::single();
    let collection = rig.collection();
    collection
        .upsert(
            "player",
            &json!({
                "name": "arthur",
                "stats": {"wins": 3},
                "tags": ["alpha", "beta"],
            }),
            &UpsertOptions::default(),
        )
        .unwrap();
    (rig, collection)
}

#[test]
fn lookup_reports_results_per_path() {
    let (_rig, collection) = seeded_rig();

    let result = collection
        .lookup_in(
            "player",
            &[
                LookupInSpec::get("name"),
                LookupInSpec::exists("ghost"),
                LookupInSpec::count("tags"),
            ],
            &LookupInOptions::default(),
        )
        .unwrap();

    let name: String = result.content_as(0).unwrap();
    assert_eq!(name, "arthur");
    // a missing path is a per-field status, not a thrown error
    assert!(!result.exists(1));
    assert_eq!(result.field_status(1), Some(Status::SubDocPathNotFound));
    let count: usize = result.content_as(2).unwrap();
    assert_eq!(count, 2);
}

#[test]
fn lookup_on_missing_document_fails_with_key_not_found() {
    let rig = Rig::single();
    let err = rig
        .collection()
        .lookup_in(
            "nothing",
            &[LookupInSpec::get("name")],
            &LookupInOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[test]
fn spec_budget_is_enforced_client_side() {
    let (_rig, collection) = seeded_rig();
    let specs: Vec<LookupInSpec> = (0..17).map(|i| LookupInSpec::get(format!("f{i}"))).collect();
    let err = collection
        .lookup_in("player", &specs, &LookupInOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn mutate_applies_specs_in_order() {
    let (_rig, collection) = seeded_rig();

    let result = collection
        .mutate_in(
            "player",
            &[
                MutateInSpec::upsert("stats.losses", b"1".to_vec().into()).create_path(),
                MutateInSpec::counter("stats.wins", 2),
                MutateInSpec::remove("tags"),
            ],
            &MutateInOptions::default(),
        )
        .unwrap();
    assert_ne!(result.cas, 0);
    let wins: Option<i64> = result.content_as(1).unwrap();
    assert_eq!(wins, Some(5));

    let fetched = collection
        .get("player", &cbkv::kv::GetOptions::default())
        .unwrap();
    let value: serde_json::Value = fetched.content_as().unwrap();
    assert_eq!(
        value,
        json!({"name": "arthur", "stats": {"wins": 5, "losses": 1}})
    );
}

#[test]
fn failing_mutation_envelope_surfaces_the_path_error() {
    let (_rig, collection) = seeded_rig();

    let err = collection
        .mutate_in(
            "player",
            &[
                MutateInSpec::upsert("name", b"\"morgan\"".to_vec().into()),
                MutateInSpec::replace("ghost.path", b"1".to_vec().into()),
            ],
            &MutateInOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    // the envelope failed, so nothing was applied
    let fetched = collection
        .get("player", &cbkv::kv::GetOptions::default())
        .unwrap();
    let value: serde_json::Value = fetched.content_as().unwrap();
    assert_eq!(value["name"], "arthur");
}

#[test]
fn mutate_with_stale_cas_is_refused() {
    let (_rig, collection) = seeded_rig();
    let current = collection
        .get("player", &cbkv::kv::GetOptions::default())
        .unwrap();

    let err = collection
        .mutate_in(
            "player",
            &[MutateInSpec::upsert("name", b"\"x\"".to_vec().into())],
            &MutateInOptions {
                cas: current.cas + 99,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyExists);
}

#[test]
fn insert_spec_refuses_existing_paths() {
    let (_rig, collection) = seeded_rig();
    let err = collection
        .mutate_in(
            "player",
            &[MutateInSpec::insert("name", b"\"other\"".to_vec().into())],
            &MutateInOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubdocGeneric);
}
