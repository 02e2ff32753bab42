use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const GRACEFUL_EXIT_WINDOW: Duration = Duration::from_millis(1_500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Which pipe a child line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Everything the supervisor reports back to the hub's ingestion path.
#[derive(Debug)]
pub enum ChildEvent {
    Line { stream: ChildStream, text: String },
    SpawnFailed { message: String },
    Exited { code: i32 },
}

/// Runs the dev command through a shell and feeds its output, line by
/// line, into the hub. The child gets its own process group so shutdown
/// can take the whole tree down with it.
pub struct DevServerSupervisor {
    pid: Option<i32>,
    running: Arc<AtomicBool>,
}

impl DevServerSupervisor {
    /// Spawn the dev command. Spawn failures are reported through `tx`
    /// rather than returned; the hub stays up either way.
    pub fn spawn(cmd: &str, tx: mpsc::UnboundedSender<ChildEvent>) -> Self {
        let running = Arc::new(AtomicBool::new(false));

        let mut command = std::process::Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match tokio::process::Command::from(command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(event = "child_spawn_failed", error = %err);
                let _ = tx.send(ChildEvent::SpawnFailed {
                    message: format!("failed to spawn {cmd:?}: {err}"),
                });
                return Self {
                    pid: None,
                    running,
                };
            }
        };

        let pid = child.id().map(|id| id as i32);
        running.store(true, Ordering::SeqCst);
        info!(event = "child_spawned", pid = pid.unwrap_or(-1), cmd = cmd);

        let stdout_task = child.stdout.take().map(|pipe| {
            spawn_line_reader(pipe, ChildStream::Stdout, tx.clone())
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            spawn_line_reader(pipe, ChildStream::Stderr, tx.clone())
        });

        let running_flag = running.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            // Drain both pipes before reporting the exit so trailing
            // output is never reordered after the exit event.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            running_flag.store(false, Ordering::SeqCst);
            match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(1);
                    info!(event = "child_exited", code);
                    if code != 0 {
                        let _ = tx.send(ChildEvent::Exited { code });
                    }
                }
                Err(err) => {
                    warn!(event = "child_wait_failed", error = %err);
                    let _ = tx.send(ChildEvent::Exited { code: 1 });
                }
            }
        });

        Self { pid, running }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle for cheap liveness checks outside the supervisor.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Ask the process group to terminate; force-kill whatever is still
    /// alive after the graceful window.
    pub async fn shutdown(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        if !self.is_running() {
            return;
        }

        signal_group(pid, TermSignal::Term);
        let deadline = tokio::time::Instant::now() + GRACEFUL_EXIT_WINDOW;
        while self.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        if self.is_running() {
            warn!(event = "child_force_kill", pid);
            signal_group(pid, TermSignal::Kill);
        }
    }
}

enum TermSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: i32, signal: TermSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        TermSignal::Term => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(event = "child_signal_failed", pid, signal = %signal, error = %err);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: i32, _signal: TermSignal) {}

fn spawn_line_reader<R>(
    pipe: R,
    stream: ChildStream,
    tx: mpsc::UnboundedSender<ChildEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        // `next_line` flushes a trailing partial line at EOF.
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(ChildEvent::Line { stream, text }).is_err() {
                break;
            }
        }
    })
}
