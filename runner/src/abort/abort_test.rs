use super::{execute, find_session, plan, running_children, AbortError};
use crate::{
    experiment::create,
    sync::session::{marker_path, SessionId, SessionMarker},
};
use std::{
    fs,
    os::unix::process::ExitStatusExt,
    process::{self, Child, Command},
    thread,
    time::Duration,
};
use tempfile::tempdir;

fn tagged(session: &SessionId, extra: &str) -> Child {
    Command::new("sh")
        .args(["-c", "sleep 5; true", "worker", extra, "--session-id", session.as_str()])
        .spawn()
        .unwrap()
}

#[test]
pub fn sessions_are_found_by_scheduler_pid() {
    let dir = tempdir().unwrap();
    let experiment = dir.path().join("exp");
    create(&experiment).unwrap();
    fs::create_dir(dir.path().join("not_an_experiment")).unwrap();

    let session = SessionId::generate();
    let _marker = SessionMarker::create(&experiment, &session).unwrap();
    let own = process::id() as i32;

    assert_eq!(find_session(dir.path(), own).unwrap(), Some((experiment.clone(), session)));
    assert_eq!(find_session(dir.path(), own + 1).unwrap(), None);
    assert!(matches!(
        plan(dir.path(), own + 1),
        Err(AbortError::NotFound { .. })
    ));
}

#[test]
pub fn crash_wrappers_are_not_children() {
    let session = SessionId::generate();
    let mut worker = tagged(&session, "cfg.yaml");
    let mut wrapper = tagged(&session, "/tmp/run/.__crash");
    // let the shells come up
    thread::sleep(Duration::from_millis(100));

    let children = running_children(&session);
    assert!(children.contains(&(worker.id() as i32)));
    assert!(!children.contains(&(wrapper.id() as i32)));
    assert!(running_children(&SessionId::generate()).is_empty());

    worker.kill().unwrap();
    wrapper.kill().unwrap();
    worker.wait().unwrap();
    wrapper.wait().unwrap();
}

#[test]
pub fn abort_terminates_scheduler_and_workers() {
    let dir = tempdir().unwrap();
    let experiment = dir.path().join("exp");
    create(&experiment).unwrap();

    let session = SessionId::generate();
    let mut scheduler = Command::new("sleep").arg("5").spawn().unwrap();
    fs::write(
        marker_path(&experiment, session.as_str()),
        format!("{}\n", scheduler.id()),
    )
    .unwrap();
    let mut worker = tagged(&session, "cfg.yaml");
    thread::sleep(Duration::from_millis(100));

    let plan = plan(dir.path(), scheduler.id() as i32).unwrap();
    assert_eq!(plan.experiment, experiment);
    assert_eq!(plan.children, vec![worker.id() as i32]);

    assert_eq!(execute(&plan).unwrap(), 2);
    assert_eq!(scheduler.wait().unwrap().signal(), Some(15));
    assert_eq!(worker.wait().unwrap().signal(), Some(15));
}
