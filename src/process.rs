use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum ProcessError {
    Spawn(io::Error),
    Wait(io::Error),
    TimedOut(Duration),
}

/// Runs `command` to completion, killing it if `timeout` elapses first.
/// Both pipes are drained on their own threads so a chatty child can never
/// block on a full pipe.
///
/// On unix the child leads its own process group and a timeout kills the
/// whole group, so helpers it spawned (ffmpeg under yt-dlp) go with it.
pub fn run(mut command: Command, timeout: Option<Duration>) -> Result<ProcessOutput, ProcessError> {
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command, 0);

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ProcessError::Spawn)?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match timeout {
        None => child.wait().map_err(ProcessError::Wait),
        Some(limit) => wait_with_deadline(&mut child, limit),
    };

    // after a kill, anything that escaped the group may still hold the pipes
    let drain_deadline = match status {
        Err(ProcessError::TimedOut(_)) => Some(Instant::now() + DRAIN_GRACE),
        _ => None,
    };
    let stdout = collect(stdout, drain_deadline);
    let stderr = collect(stderr, drain_deadline);

    Ok(ProcessOutput { status: status?, stdout, stderr })
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus, ProcessError> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                kill(child);
                let _ = child.wait();
                return Err(ProcessError::TimedOut(limit));
            },
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(ProcessError::Wait(err)),
        }
    }
}

#[cfg(unix)]
fn kill(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        warn!(pid = child.id(), error = %err, "unable to kill timed out process group");
        if let Err(err) = child.kill() {
            warn!(pid = child.id(), error = %err, "unable to kill timed out process");
        }
    }
}

#[cfg(not(unix))]
fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(pid = child.id(), error = %err, "unable to kill timed out process");
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<Receiver<String>> {
    stream.map(|mut s| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

fn collect(rx: Option<Receiver<String>>, deadline: Option<Instant>) -> String {
    let Some(rx) = rx else { return String::new() };
    match deadline {
        None => rx.recv().unwrap_or_default(),
        Some(deadline) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default(),
    }
}
