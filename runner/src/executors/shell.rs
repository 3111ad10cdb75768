use super::{ExecutorError, ProcessHandle, Worker};
use crate::{
    sentinel::{CRASH, END, ERR, OUT, START},
    sync::session::SessionId,
};
use std::{
    fs::File,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
};
use tracing::{debug, info};

#[cfg(test)]
mod shell_test;

pub const NOHUP_OUT: &str = "nohup.out";
pub const NOHUP_ERR: &str = "nohup.err";
pub const SH_OUT: &str = "sh.out";
pub const SH_ERR: &str = "sh.err";

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// `<interpreter> <script> <cfg> --session-id <id>`, the interpreter being
/// inserted as raw shell words
pub fn worker_command(interpreter: Option<&str>, script: &Path, cfg: &Path, session: &SessionId) -> String {
    let invocation = format!(
        "{} {} --session-id {}",
        quote_path(script),
        quote_path(cfg),
        shell_quote(session.as_str())
    );

    match interpreter.map(str::trim).filter(|words| !words.is_empty()) {
        Some(words) => format!("{words} {invocation}"),
        None => invocation,
    }
}

/// Shell pipeline that records the worker lifecycle in the run directory:
/// start stamp, the worker with its output captured, then either an end or a
/// crash stamp depending on its exit status.
pub fn wrapper(run: &Path, command: &str) -> String {
    format!(
        "date +%s > {start} && {command} 2>{err} 1>{out} && date +%s > {end} || date +%s > {crash}",
        start = quote_path(&run.join(START)),
        err = quote_path(&run.join(ERR)),
        out = quote_path(&run.join(OUT)),
        end = quote_path(&run.join(END)),
        crash = quote_path(&run.join(CRASH)),
    )
}

fn capture(path: &Path) -> Result<File, ExecutorError> {
    File::create(path).map_err(|source| ExecutorError::Output {
        path: path.to_path_buf(),
        source,
    })
}

/// Start the wrapper shell; a detached worker is put under `nohup` in its own
/// process group so it outlives the scheduler
pub fn spawn(worker: Worker, detach: bool) -> Result<ProcessHandle, ExecutorError> {
    let (out, err) = if detach {
        (NOHUP_OUT, NOHUP_ERR)
    } else {
        (SH_OUT, SH_ERR)
    };
    let script = wrapper(&worker.run, &worker.command);
    let mut command = if detach {
        let mut command = Command::new("nohup");
        command.arg("sh").process_group(0);
        command
    } else {
        Command::new("sh")
    };

    command
        .arg("-c")
        .arg(&script)
        .envs(worker.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(capture(&worker.run.join(out))?)
        .stderr(capture(&worker.run.join(err))?);

    debug!("Command to be run: {script}");

    let child = command.spawn().map_err(|source| ExecutorError::Spawn {
        run: worker.run.clone(),
        source,
    })?;

    info!(title = %worker.title, "New PID is {}", child.id());

    Ok(ProcessHandle::spawned(
        child,
        &worker.run,
        worker.gpu,
        worker.title,
        worker.command,
    ))
}
