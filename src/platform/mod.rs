use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Turns a failed run into an error that keeps the command's stderr.
    pub fn check(self, label: &str) -> Result<CommandOutput> {
        if self.timed_out {
            return Err(anyhow!("{label}: timed out\n{}", self.stderr.trim_end()));
        }
        if self.exit_code != 0 {
            return Err(anyhow!(
                "{label}: exit status {}\n{}",
                self.exit_code,
                self.stderr.trim_end()
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRunOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Time budget shared by every command of one unit of work.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    deadline: Instant,
}

impl Budget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Remaining time, or an error once the budget is spent.
    pub fn command_timeout(&self, cmd: &str) -> Result<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(anyhow!("time budget exhausted before running {cmd}"));
        }
        Ok(remaining)
    }
}

pub fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    run_command_with_options(cmd, args, timeout, &CommandRunOptions::default())
}

/// How long drain threads may keep reading after a timed-out child is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs `cmd` to completion. Both pipes are drained on their own threads so
/// a chatty child cannot block on a full pipe while we wait for it.
///
/// On unix the child leads its own process group, and a timeout kills the
/// whole group so helpers it spawned (`git-remote-https`, compilers) cannot
/// keep the pipes open past the deadline.
pub fn run_command_with_options(
    cmd: &str,
    args: &[&str],
    timeout: Duration,
    options: &CommandRunOptions,
) -> Result<CommandOutput> {
    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    for (k, v) in &options.env {
        command.env(k, v);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start process: {cmd}"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let (exit_code, timed_out) = match child
        .wait_timeout(timeout)
        .with_context(|| format!("failed to wait for process: {cmd}"))?
    {
        Some(status) => (status.code().unwrap_or(-1), false),
        None => {
            kill_tree(&mut child);
            let _ = child.wait();
            (-1, true)
        }
    };

    // A grandchild outside the group may still hold a pipe; stop waiting for
    // it after a grace period and keep what was read so far.
    let drain_deadline = timed_out.then(|| Instant::now() + DRAIN_GRACE);
    let stdout = collect(stdout, drain_deadline);
    let mut stderr = collect(stderr, drain_deadline);
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("portcheck: killed {cmd} after {timeout:?}\n"));
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child's pid is its process group id (`process_group(0)`).
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Drain> {
    pipe.map(|mut pipe| {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        Drain { buf, handle }
    })
}

/// Waits for a drain thread, at most until `deadline` when one is given. An
/// abandoned thread ends on its own once the last writer closes the pipe.
fn collect(drain: Option<Drain>, deadline: Option<Instant>) -> String {
    let Some(drain) = drain else {
        return String::new();
    };
    match deadline {
        None => {
            let _ = drain.handle.join();
        }
        Some(deadline) => {
            while !drain.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if drain.handle.is_finished() {
                let _ = drain.handle.join();
            }
        }
    }
    let bytes = match drain.buf.lock() {
        Ok(b) => b.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}
