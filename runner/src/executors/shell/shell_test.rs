use super::{shell_quote, spawn, worker_command, wrapper, NOHUP_OUT, SH_OUT};
use crate::{
    executors::Worker,
    sentinel::{read_stamp, CFG, CRASH, END, OUT, START},
    sync::session::SessionId,
};
use std::{
    fs,
    path::Path,
    process::Command,
    thread,
    time::{Duration, Instant},
};
use tempfile::tempdir;

fn worker(run: &Path, script: &str, env: Vec<(String, String)>) -> Worker {
    fs::create_dir_all(run).unwrap();
    fs::write(run.join(CFG), "title: t\n").unwrap();
    let script_path = run.join("script.sh");
    fs::write(&script_path, script).unwrap();

    Worker {
        run: run.to_path_buf(),
        title: "t".to_string(),
        gpu: None,
        command: worker_command(Some("sh"), &script_path, &run.join(CFG), &SessionId::generate()),
        env,
    }
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !path.exists() {
        assert!(Instant::now() < deadline, "{path:?} never appeared");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
pub fn quoting_leaves_plain_words_alone() {
    assert_eq!(shell_quote("/tmp/run_0/cfg.yaml"), "/tmp/run_0/cfg.yaml");
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("a b"), "'a b'");
    assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
}

#[test]
pub fn worker_command_passes_config_and_session() {
    let session: SessionId = "abc-123".parse().unwrap();
    let command = worker_command(
        Some(" python -u "),
        Path::new("train.py"),
        Path::new("/exp/0000_a b/0/cfg.yaml"),
        &session,
    );

    assert_eq!(
        command,
        "python -u train.py '/exp/0000_a b/0/cfg.yaml' --session-id abc-123"
    );
    assert_eq!(
        worker_command(None, Path::new("./run"), Path::new("cfg.yaml"), &session),
        "./run cfg.yaml --session-id abc-123"
    );
}

#[test]
pub fn wrapper_records_success() {
    let dir = tempdir().unwrap();
    let run = dir.path().join("my run");
    let worker = worker(&run, "echo \"$1 $2 $3\"\n", Vec::new());

    let status = Command::new("sh")
        .arg("-c")
        .arg(wrapper(&run, &worker.command))
        .status()
        .unwrap();

    assert!(status.success());
    assert!(read_stamp(&run.join(START)).unwrap() <= read_stamp(&run.join(END)).unwrap());
    assert!(!run.join(CRASH).exists());
    let out = fs::read_to_string(run.join(OUT)).unwrap();
    assert!(out.starts_with(&format!("{} --session-id", run.join(CFG).display())));
}

#[test]
pub fn wrapper_records_failure() {
    let dir = tempdir().unwrap();
    let run = dir.path().join("0");
    let worker = worker(&run, "exit 3\n", Vec::new());

    Command::new("sh")
        .arg("-c")
        .arg(wrapper(&run, &worker.command))
        .status()
        .unwrap();

    assert!(run.join(START).exists());
    assert!(run.join(CRASH).exists());
    assert!(!run.join(END).exists());
}

#[test]
pub fn spawned_workers_see_their_environment() {
    let dir = tempdir().unwrap();

    for (name, detach, wrapper_out) in [("attached", false, SH_OUT), ("detached", true, NOHUP_OUT)] {
        let run = dir.path().join(name);
        let worker = worker(
            &run,
            "echo \"$CUDA_VISIBLE_DEVICES/$ENDBY\"\n",
            vec![
                ("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string()),
                ("ENDBY".to_string(), "60".to_string()),
            ],
        );

        let mut handle = spawn(worker, detach).unwrap();
        wait_for(&run.join(END));
        while handle.still_alive() {
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(fs::read_to_string(run.join(OUT)).unwrap(), "1/60\n");
        assert!(run.join(wrapper_out).exists());
        assert!(!run.join(CRASH).exists());
    }
}
