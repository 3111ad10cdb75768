use super::{Backoff, RunSource, Scheduler, SchedulerError, StopReason};
use crate::{
    collector::{run_dirs, Collector},
    config::{ConfigErrors, SchedulerOptions},
    executors::{LaunchMode, Supervisor},
    experiment::{add_subexperiment, create, Blueprint},
    sentinel::{CRASH, END, LOCK, OUT, STOP},
    sync::session::SessionId,
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::tempdir;

fn experiment_with(root: &Path, subexperiments: usize) -> PathBuf {
    let experiment = root.join("experiment");
    create(&experiment).unwrap();

    for index in 0..subexperiments {
        let config = serde_yaml::from_str(&format!("seed: {index}\n")).unwrap();
        add_subexperiment(
            &experiment,
            &Blueprint {
                config: &config,
                title: &format!("seed={index}"),
                runs_no: 1,
                attachments: Vec::new(),
            },
        )
        .unwrap();
    }

    experiment
}

fn options(root: &Path, script: &str) -> SchedulerOptions {
    let path = root.join("script.sh");
    fs::write(&path, script).unwrap();

    SchedulerOptions {
        script: path,
        interpreter: Some("sh".to_string()),
        poll_interval_ms: 10,
        backoff_cap_ms: 50,
        ..SchedulerOptions::default()
    }
}

fn scheduler(experiment: &Path, options: &SchedulerOptions) -> Scheduler<Collector> {
    let session = SessionId::generate();
    let collector = Collector::new(
        experiment.to_path_buf(),
        options.parsed_filters().unwrap(),
        options.shuffle,
    );
    let supervisor = Supervisor::new(options, session.clone());
    let supervisor = match supervisor.mode() {
        LaunchMode::InPlace => supervisor,
        _ => supervisor.with_mode(LaunchMode::Attached),
    };

    Scheduler::new(experiment, options, session, collector)
        .unwrap()
        .with_supervisor(supervisor)
}

/// Highest number of workers that were inside the script at the same time
fn max_overlap(events: &str) -> usize {
    let mut running = 0usize;
    let mut peak = 0;

    for event in events.lines() {
        match event {
            "begin" => running += 1,
            "end" => running -= 1,
            other => panic!("unexpected event {other}"),
        }
        peak = peak.max(running);
    }

    peak
}

#[test]
pub fn backoff_doubles_up_to_the_cap() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(16));
    let delays: Vec<u64> = (0..7).map(|_| backoff.step().as_secs()).collect();

    assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);

    backoff.reset();
    assert_eq!(backoff.step(), Duration::from_secs(1));
}

#[test]
pub fn all_runs_succeed_within_the_budget() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 4);
    let events = dir.path().join("events");
    let options = SchedulerOptions {
        procs_no: 2,
        ..options(
            dir.path(),
            "log=\"$(dirname \"$0\")/events\"\necho begin >> \"$log\"\nsleep 0.3\necho end >> \"$log\"\n",
        )
    };

    let report = scheduler(&experiment, &options).run().unwrap();

    assert_eq!(report.stop, StopReason::Exhausted);
    assert_eq!(report.launched, 4);
    assert_eq!(report.launch_failures, 0);
    assert_eq!(
        (report.status.succeeded, report.status.failed, report.status.lost),
        (4, 0, 0)
    );
    assert!(max_overlap(&fs::read_to_string(events).unwrap()) <= 2);

    for run in run_dirs(&experiment) {
        assert!(run.join(END).exists());
        assert!(!run.join(LOCK).exists());
    }
    // the session marker is gone
    assert!(fs::read_dir(&experiment)
        .unwrap()
        .filter_map(Result::ok)
        .all(|entry| entry.file_name() == ".__experiment" || entry.path().is_dir()));
}

#[test]
pub fn failed_runs_are_terminal() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 3);
    let options = SchedulerOptions {
        procs_no: 3,
        ..options(dir.path(), "exit 1\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();
    assert_eq!(report.launched, 3);
    assert_eq!((report.status.failed, report.status.succeeded), (3, 0));
    assert!(run_dirs(&experiment).all(|run| run.join(CRASH).exists()));

    let rerun = scheduler(&experiment, &options).run().unwrap();
    assert_eq!(rerun.launched, 0);
    assert_eq!(rerun.stop, StopReason::Exhausted);
    assert_eq!(rerun.status.failed, 3);
}

#[test]
pub fn max_runs_limits_the_session() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 3);
    let options = SchedulerOptions {
        max_runs: 1,
        ..options(dir.path(), "exit 0\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();

    assert_eq!(report.stop, StopReason::MaxRuns);
    assert_eq!(report.launched, 1);
    assert_eq!((report.status.succeeded, report.status.unclaimed), (1, 2));
}

#[test]
pub fn stop_file_prevents_launches() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 2);
    fs::write(experiment.join(STOP), "").unwrap();
    let options = options(dir.path(), "exit 0\n");

    let report = scheduler(&experiment, &options).run().unwrap();

    assert_eq!(report.stop, StopReason::StopFile);
    assert_eq!(report.launched, 0);
    assert_eq!(report.status.unclaimed, 2);
}

#[test]
pub fn in_place_runs_one_at_a_time() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 2);
    let options = SchedulerOptions {
        no_detach: true,
        ..options(dir.path(), "exit 0\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();

    assert_eq!(report.launched, 2);
    assert_eq!(report.status.succeeded, 2);
    assert!(run_dirs(&experiment).all(|run| !run.join(LOCK).exists()));
}

#[test]
pub fn workers_get_their_gpu() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 4);
    let options = SchedulerOptions {
        procs_no: 4,
        gpus: vec!["0".to_string(), "1".to_string()],
        per_gpu: vec![1],
        ..options(dir.path(), "echo \"$CUDA_VISIBLE_DEVICES\"\nsleep 0.1\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();
    assert_eq!(report.status.succeeded, 4);

    for run in run_dirs(&experiment) {
        let gpu = fs::read_to_string(run.join(OUT)).unwrap();
        assert!(gpu == "0\n" || gpu == "1\n", "unexpected gpu {gpu:?}");
    }
}

#[test]
pub fn mismatched_gpu_caps_fail_before_claiming() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 1);
    let options = SchedulerOptions {
        gpus: vec!["0".to_string(), "1".to_string(), "2".to_string()],
        per_gpu: vec![1, 1],
        ..options(dir.path(), "exit 0\n")
    };
    let collector = Collector::new(experiment.clone(), Vec::new(), false);

    assert!(matches!(
        Scheduler::new(&experiment, &options, SessionId::generate(), collector),
        Err(SchedulerError::Config(ConfigErrors::MismatchedPerGpu { .. }))
    ));
    assert!(run_dirs(&experiment).all(|run| !run.join(LOCK).exists()));
}

struct Failing;

impl RunSource for Failing {
    fn candidates(&mut self) -> Result<Box<dyn Iterator<Item = PathBuf> + '_>, SchedulerError> {
        Err(ConfigErrors::Preflight.into())
    }
}

#[test]
pub fn source_errors_end_the_session() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 1);
    let options = options(dir.path(), "exit 0\n");

    let result = Scheduler::new(&experiment, &options, SessionId::generate(), Failing)
        .unwrap()
        .run();

    assert!(matches!(result, Err(SchedulerError::Config(ConfigErrors::Preflight))));
}

#[test]
pub fn detached_workers_are_supervised() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 3);
    let options = SchedulerOptions {
        procs_no: 2,
        ..options(dir.path(), "sleep 0.2\n")
    };
    let session = SessionId::generate();
    let collector = Collector::new(experiment.clone(), Vec::new(), false);
    let scheduler = Scheduler::new(&experiment, &options, session, collector).unwrap();
    assert_eq!(scheduler.supervisor.mode(), LaunchMode::Detached);

    let report = scheduler.run().unwrap();

    assert_eq!(report.stop, StopReason::Exhausted);
    assert_eq!(report.launched, 3);
    assert_eq!((report.status.succeeded, report.status.lost), (3, 0));
    for run in run_dirs(&experiment) {
        assert!(run.join(END).exists());
        assert!(!run.join(LOCK).exists());
    }
}

/// Session over three runs of a script outlasting the one second deadlines
fn stop_after_first_run(start_by: u64, end_by: u64, stop_file: bool) -> (StopReason, usize) {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 3);
    let touch = if stop_file {
        "touch \"$(dirname \"$0\")/experiment/.STOP\"\n"
    } else {
        ""
    };
    let options = SchedulerOptions {
        start_by,
        end_by,
        max_runs: 1,
        ..options(dir.path(), &format!("{touch}sleep 1.2\n"))
    };

    let report = scheduler(&experiment, &options).run().unwrap();

    (report.stop, report.launched)
}

#[test]
pub fn stop_file_is_checked_first() {
    assert_eq!(stop_after_first_run(1, 1, true), (StopReason::StopFile, 1));
}

#[test]
pub fn start_by_beats_end_by_and_max_runs() {
    assert_eq!(stop_after_first_run(1, 1, false), (StopReason::StartBy, 1));
}

#[test]
pub fn end_by_beats_max_runs() {
    assert_eq!(stop_after_first_run(0, 1, false), (StopReason::EndBy, 1));
}

#[test]
pub fn start_by_stops_launching() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 3);
    let options = SchedulerOptions {
        start_by: 1,
        ..options(dir.path(), "sleep 1.2\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();

    assert_eq!(report.stop, StopReason::StartBy);
    assert_eq!(report.launched, 1);
    assert_eq!((report.status.succeeded, report.status.unclaimed), (1, 2));
}

#[test]
pub fn workers_know_the_time_left() {
    let dir = tempdir().unwrap();
    let experiment = experiment_with(dir.path(), 1);
    let options = SchedulerOptions {
        end_by: 100,
        ..options(dir.path(), "echo \"$ENDBY\"\n")
    };

    let report = scheduler(&experiment, &options).run().unwrap();
    assert_eq!(report.status.succeeded, 1);

    for run in run_dirs(&experiment) {
        let left: u64 = fs::read_to_string(run.join(OUT)).unwrap().trim().parse().unwrap();
        assert!((99..=100).contains(&left), "unexpected ENDBY {left}");
    }
}
