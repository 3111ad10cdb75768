use crate::{
    config::{ConfigErrors, SchedulerOptions},
    evolve::EvolveError,
    executors::{ProcessHandle, Supervisor},
    experiment::{self, ExperimentError, ExperimentStatus},
    resources::{ResourcePool, Slot},
    sentinel::{read_stamp, RunState, SentinelError, Sentinels, CRASH, END, START, STOP},
    sync::{
        locking::{self, RunLock},
        session::{SessionId, SessionMarker},
    },
};
use serde::Serialize;
use std::{
    fmt, mem,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
mod scheduler_test;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
    #[error(transparent)]
    Evolve(#[from] EvolveError),
}

/// Producer of runs for the scheduler to claim
pub trait RunSource {
    /// Runs that may be claimable right now, in the order they should be
    /// tried. An empty sequence means nothing is available at the moment.
    fn candidates(&mut self) -> Result<Box<dyn Iterator<Item = PathBuf> + '_>, SchedulerError>;
}

/// Why a session stopped launching runs
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    StopFile,
    StartBy,
    EndBy,
    MaxRuns,
}

/// Doubling sleep between polls, capped
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap: cap.max(initial),
            current: initial,
        }
    }

    /// Current delay, doubling the next one
    pub fn step(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct SessionReport {
    pub experiment: PathBuf,
    pub session: String,
    pub elapsed: Duration,
    pub launched: usize,
    pub launch_failures: usize,
    pub stop: StopReason,
    pub status: ExperimentStatus,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Experiment {} ended after {:.2}s ({:?}). Launched {} runs, {} failed to launch. {}",
            self.experiment.display(),
            self.elapsed.as_secs_f64(),
            self.stop,
            self.launched,
            self.launch_failures,
            self.status
        )
    }
}

/// Log the verdict a finished worker left in its run
fn report_outcome(handle: &ProcessHandle) {
    let run = &handle.run;
    let state = match Sentinels::read(run) {
        Ok(sentinels) => sentinels.state(|| false),
        Err(e) => {
            warn!(run = ?run, "Failed to read the sentinels: {e}");
            return;
        }
    };

    let verdict = match state {
        RunState::Succeeded => END,
        RunState::Failed => CRASH,
        _ => {
            warn!(run = ?run, "{} exited without an end or crash marker", handle.title);
            return;
        }
    };

    match (read_stamp(&run.join(START)), read_stamp(&run.join(verdict))) {
        (Ok(start), Ok(end)) => info!(
            pid = ?handle.pid,
            gpu = ?handle.gpu,
            "{} is {state:?} after {}s",
            handle.title,
            end - start
        ),
        _ => info!(pid = ?handle.pid, gpu = ?handle.gpu, "{} is {state:?}", handle.title),
    }
}

#[derive(Debug)]
struct Tracked {
    handle: ProcessHandle,
    lock: RunLock,
    slot: Slot,
}

/// Single threaded claim/launch loop of one session
pub struct Scheduler<S> {
    experiment: PathBuf,
    session: SessionId,
    resources: ResourcePool,
    supervisor: Supervisor,
    source: S,
    active: Vec<Tracked>,
    start_by: Option<Duration>,
    end_by: Option<Duration>,
    max_runs: Option<usize>,
    poll: Backoff,
    idle: Backoff,
    launched: usize,
    launch_failures: usize,
}

impl<S: RunSource> Scheduler<S> {
    /// Fails on resource mis-configuration before anything is claimed
    pub fn new(
        experiment: &Path,
        options: &SchedulerOptions,
        session: SessionId,
        source: S,
    ) -> Result<Self, SchedulerError> {
        if !experiment::is_experiment(experiment) {
            return Err(ConfigErrors::NotAnExperiment(experiment.to_path_buf()).into());
        }

        Ok(Self {
            experiment: experiment.to_path_buf(),
            resources: ResourcePool::new(options.procs_no, &options.gpus, &options.per_gpu)?,
            supervisor: Supervisor::new(options, session.clone()),
            session,
            source,
            active: Vec::new(),
            start_by: options.start_by(),
            end_by: options.end_by(),
            max_runs: options.max_runs(),
            poll: Backoff::new(options.poll_interval(), options.backoff_cap()),
            idle: Backoff::new(options.poll_interval(), options.backoff_cap()),
            launched: 0,
            launch_failures: 0,
        })
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Forget finished workers: their lock is removed and their slot freed.
    /// Returns whether anything finished.
    fn refresh(&mut self) -> bool {
        let mut changed = false;

        for mut tracked in mem::take(&mut self.active) {
            if tracked.handle.still_alive() {
                self.active.push(tracked);
                continue;
            }

            report_outcome(&tracked.handle);
            if let Err(e) = tracked.lock.release() {
                error!(lock = ?tracked.lock.path(), "Failed to remove lock: {e}");
            }
            self.resources.free(&tracked.slot);
            changed = true;
        }

        changed
    }

    /// Block until a slot frees up
    fn wait_for_slot(&mut self) -> Slot {
        loop {
            if let Some(slot) = self.resources.is_free() {
                self.poll.reset();
                return slot;
            }

            if !self.refresh() {
                thread::sleep(self.poll.step());
            }
        }
    }

    /// Stop conditions in the order they are checked
    fn stop_reason(&self, elapsed: Duration) -> Option<StopReason> {
        if self.experiment.join(STOP).exists() {
            Some(StopReason::StopFile)
        } else if self.start_by.map_or(false, |start_by| elapsed > start_by) {
            Some(StopReason::StartBy)
        } else if self.end_by.map_or(false, |end_by| elapsed > end_by) {
            Some(StopReason::EndBy)
        } else if self
            .max_runs
            .map_or(false, |max_runs| self.launched + self.launch_failures >= max_runs)
        {
            Some(StopReason::MaxRuns)
        } else {
            None
        }
    }

    /// Claim the first candidate this session wins and launch it. Returns
    /// whether a run was claimed, even if its launch failed.
    fn claim_and_launch(&mut self, slot: &Slot, elapsed: Duration) -> Result<bool, SchedulerError> {
        let search = Instant::now();
        let mut attempts = 0;
        let mut claimed = None;

        for run in self.source.candidates()? {
            attempts += 1;
            if let Some(lock) = locking::claim(&run, &self.session)? {
                claimed = Some((run, lock));
                break;
            }
        }

        let Some((run, lock)) = claimed else {
            return Ok(false);
        };

        debug!(
            "Path search took {:.3}s ({attempts} attempts)",
            search.elapsed().as_secs_f64()
        );

        let end_by = self.end_by.map(|end_by| end_by.saturating_sub(elapsed));
        match self.supervisor.launch(&run, slot.gpu.as_deref(), end_by) {
            Ok(handle) => {
                self.resources.allocate(slot);
                self.active.push(Tracked {
                    handle,
                    lock,
                    slot: slot.clone(),
                });
                self.launched += 1;
            }
            Err(e) => {
                // the run keeps its lock and shows up as lost
                error!(run = ?lock.run(), "Failed to launch: {e}");
                self.launch_failures += 1;
            }
        }

        Ok(true)
    }

    fn schedule(&mut self, start: Instant) -> Result<StopReason, SchedulerError> {
        let mut launched_something = false;

        loop {
            info!("Resources: {}", self.resources);
            if !launched_something {
                self.refresh();
            }

            let slot = self.wait_for_slot();

            if let Some(reason) = self.stop_reason(start.elapsed()) {
                info!("Not launching new runs anymore: {reason:?}");
                return Ok(reason);
            }

            launched_something = self.claim_and_launch(&slot, start.elapsed())?;

            if launched_something {
                self.idle.reset();
            } else {
                info!("All runs are done or running.");
                if self.active.is_empty() {
                    return Ok(StopReason::Exhausted);
                }
                thread::sleep(self.idle.step());
            }
        }
    }

    fn drain(&mut self) {
        if !self.active.is_empty() {
            info!("Waiting for {} runs to finish", self.resources.running());
        }
        while !self.active.is_empty() {
            if !self.refresh() {
                thread::sleep(self.poll.step());
            }
        }
    }

    /// Run the session until its source is exhausted or a stop condition
    /// fires, then wait for the launched workers.
    #[instrument(skip(self), fields(experiment = ?self.experiment, session = %self.session), level = "info")]
    pub fn run(mut self) -> Result<SessionReport, SchedulerError> {
        let marker = SessionMarker::create(&self.experiment, &self.session)?;
        debug!(marker = ?marker.path(), mode = ?self.supervisor.mode(), "Session started");
        let start = Instant::now();

        let stop = self.schedule(start);
        if let Err(e) = stop.as_ref() {
            error!("Stopping the session: {e}");
        }
        self.drain();

        let status = experiment::status(&self.experiment)?;
        drop(marker);

        Ok(SessionReport {
            experiment: self.experiment.clone(),
            session: self.session.to_string(),
            elapsed: start.elapsed(),
            launched: self.launched,
            launch_failures: self.launch_failures,
            stop: stop?,
            status,
        })
    }
}
