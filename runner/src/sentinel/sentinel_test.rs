use super::{
    create_exclusive, lock_owner, read_stamp, remove, stamp, touch, RunState, Sentinels, CFG,
    CRASH, END, LEAF, LOCK, START,
};
use std::{fs, path::Path};
use tempfile::tempdir;

fn run_with(dir: &Path, files: &[&str]) -> Sentinels {
    for file in files {
        fs::write(dir.join(file), "").unwrap();
    }

    Sentinels::read(dir).unwrap()
}

#[test]
pub fn fresh_run_is_claimable() {
    let dir = tempdir().unwrap();
    let sentinels = run_with(dir.path(), &[CFG, LEAF]);

    assert!(sentinels.is_claimable());
    assert_eq!(sentinels.state(|| unreachable!()), RunState::Unclaimed);
}

#[test]
pub fn run_without_leaf_is_not_claimable() {
    let dir = tempdir().unwrap();

    assert!(!run_with(dir.path(), &[CFG]).is_claimable());
}

#[test]
pub fn any_lifecycle_marker_blocks_claiming() {
    for marker in [LOCK, START, END, CRASH] {
        let dir = tempdir().unwrap();

        assert!(!run_with(dir.path(), &[CFG, LEAF, marker]).is_claimable());
    }
}

#[test]
pub fn states_follow_the_markers() {
    let dir = tempdir().unwrap();
    let claimed = run_with(dir.path(), &[CFG, LEAF, LOCK]);
    assert_eq!(claimed.state(|| true), RunState::Claimed);
    assert_eq!(claimed.state(|| false), RunState::Lost);

    let running = run_with(dir.path(), &[START]);
    assert_eq!(running.state(|| true), RunState::Running);
    assert_eq!(running.state(|| false), RunState::Lost);

    let failed = run_with(dir.path(), &[CRASH]);
    assert_eq!(failed.state(|| true), RunState::Failed);
    assert_eq!(failed.state(|| false), RunState::Failed);
}

#[test]
pub fn started_run_without_lock_is_lost() {
    let dir = tempdir().unwrap();

    assert_eq!(
        run_with(dir.path(), &[CFG, LEAF, START]).state(|| true),
        RunState::Lost
    );
    assert_eq!(
        run_with(dir.path(), &[END]).state(|| false),
        RunState::Succeeded
    );
}

#[test]
pub fn exclusive_create_has_one_winner() {
    let dir = tempdir().unwrap();
    let lock = dir.path().join(LOCK);

    assert!(create_exclusive(&lock, "first").unwrap());
    assert!(!create_exclusive(&lock, "second").unwrap());
    assert_eq!(lock_owner(dir.path()).unwrap().as_deref(), Some("first"));
}

#[test]
pub fn stamps_are_unix_seconds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(START);
    let written = stamp(&path).unwrap();

    assert_eq!(read_stamp(&path).unwrap(), written);

    fs::write(&path, "yesterday").unwrap();
    assert!(read_stamp(&path).is_err());
}

#[test]
pub fn touch_and_remove_are_idempotent() {
    let dir = tempdir().unwrap();
    let leaf = dir.path().join(LEAF);

    touch(&leaf).unwrap();
    touch(&leaf).unwrap();
    assert!(leaf.is_file());

    assert!(remove(&leaf).unwrap());
    assert!(!remove(&leaf).unwrap());
    assert_eq!(lock_owner(dir.path()).unwrap(), None);
}
