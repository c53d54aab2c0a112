//! Recursive materialization: flipping placeholder records below a prefix
//! downloads exactly that subtree, leaving peers virtual.

mod common;

use common::TestFolder;
use tide_engine::{RemoteStore, VIRTUAL_SUFFIX};
use tide_journal::ItemKind;

const FILES: &[&str] = &[
    "A/a1",
    "A/a2",
    "A/Sub/a3",
    "A/Sub/a4",
    "A/Sub/SubSub/a5",
    "A/Sub2/a6",
    "B/b1",
    "B/Sub/b2",
];

fn assert_materialized(folder: &TestFolder, path: &str, materialized: bool) {
    let suffixed = format!("{}{}", path, VIRTUAL_SUFFIX);
    if materialized {
        assert!(folder.local_exists(path), "{} should be a real file", path);
        assert!(!folder.local_exists(&suffixed), "{} should be gone", suffixed);
        assert_eq!(folder.record_kind(path), Some(ItemKind::File));
    } else {
        assert!(!folder.local_exists(path), "{} should stay virtual", path);
        assert!(folder.local_exists(&suffixed), "{} should exist", suffixed);
        assert_eq!(
            folder.record_kind(&suffixed),
            Some(ItemKind::VirtualPlaceholder)
        );
    }
}

#[test]
fn download_recursively_scopes_to_the_prefix() {
    let mut folder = TestFolder::with_virtual_files();

    for dir in ["A", "A/Sub", "A/Sub/SubSub", "A/Sub2", "B", "B/Sub"] {
        folder.remote.mkdir(dir).unwrap();
    }
    for file in FILES {
        folder.remote.insert(file, 64).unwrap();
    }
    folder.sync_ok();
    for file in FILES {
        assert_materialized(&folder, file, false);
    }

    // Materialize everything under A/Sub
    folder
        .engine
        .journal_mut()
        .mark_virtual_for_download_recursively("A/Sub", VIRTUAL_SUFFIX)
        .unwrap();
    folder.sync_ok();
    assert_materialized(&folder, "A/a1", false);
    assert_materialized(&folder, "A/a2", false);
    assert_materialized(&folder, "A/Sub/a3", true);
    assert_materialized(&folder, "A/Sub/a4", true);
    assert_materialized(&folder, "A/Sub/SubSub/a5", true);
    assert_materialized(&folder, "A/Sub2/a6", false);
    assert_materialized(&folder, "B/b1", false);
    assert_materialized(&folder, "B/Sub/b2", false);

    // A new remote file in a materialized subtree still arrives virtual
    folder.remote.insert("A/Sub/SubSub/a7", 64).unwrap();
    folder.sync_ok();
    assert_materialized(&folder, "A/Sub/SubSub/a7", false);

    // Now materialize all of A
    folder
        .engine
        .journal_mut()
        .mark_virtual_for_download_recursively("A", VIRTUAL_SUFFIX)
        .unwrap();
    folder.sync_ok();
    for file in [
        "A/a1",
        "A/a2",
        "A/Sub/a3",
        "A/Sub/a4",
        "A/Sub/SubSub/a5",
        "A/Sub/SubSub/a7",
        "A/Sub2/a6",
    ] {
        assert_materialized(&folder, file, true);
    }
    assert_materialized(&folder, "B/b1", false);
    assert_materialized(&folder, "B/Sub/b2", false);

    // And the remaining files in B
    folder
        .engine
        .journal_mut()
        .mark_virtual_for_download_recursively("B", VIRTUAL_SUFFIX)
        .unwrap();
    folder.sync_ok();
    assert_materialized(&folder, "B/b1", true);
    assert_materialized(&folder, "B/Sub/b2", true);

    folder.assert_placeholder_exclusivity();
    folder.assert_journal_disk_agreement();

    // A final run has nothing left to do
    let report = folder.sync_ok();
    assert!(report.items.is_empty());
}
