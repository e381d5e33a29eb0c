//! Child processes in their own process groups, with bounded output capture
//! and an externally enforced timeout.
//!
//! Every agent invocation goes through [`run`]. The child is detached into
//! its own process group so the terminate/kill cascade reaches the whole
//! descendant tree, not just the direct child. Output is drained into a
//! fixed-capacity line tail; only that tail is retained for diagnostics.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Grace period between SIGTERM and SIGKILL on timeout or interrupt.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Parameters for one process invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Wall-clock budget enforced from outside the child.
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin before waiting (prompt delivery).
    pub stdin: Option<Vec<u8>>,
    /// Maximum stdout+stderr lines retained.
    pub tail_lines: usize,
}

/// Normalized result of one process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// None when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    /// Newest retained lines, oldest first.
    pub tail: Vec<String>,
    /// Lines discarded once the tail filled.
    pub dropped_lines: usize,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn tail_text(&self) -> String {
        let mut buf = self.tail.join("\n");
        if self.dropped_lines > 0 {
            buf.push_str(&format!("\n[{} earlier lines dropped]", self.dropped_lines));
        }
        buf
    }
}

/// Fixed-capacity line buffer shared by the stdout/stderr reader threads.
#[derive(Debug)]
struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }
}

/// Run a command to completion under the external timeout.
///
/// On timeout: SIGTERM to the negated process-group id, a fixed grace
/// period, then SIGKILL if the group is still alive. The live process is
/// registered in the process-wide active table for the duration of the call
/// so an interrupt handler can cascade termination via [`terminate_all`].
#[instrument(skip_all, fields(program = %request.program, timeout_secs = request.timeout.as_secs()))]
pub fn run(request: &ProcessRequest) -> Result<ProcessResult> {
    let start = Instant::now();

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group: signals target the whole descendant tree.
        .process_group(0);
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    debug!("spawning child process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", request.program))?;
    let pid = child.id();
    register_active(pid);

    let result = (|| {
        if let Some(input) = &request.stdin {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            child_stdin.write_all(input).context("write stdin")?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let tail = Arc::new(Mutex::new(TailBuffer::new(request.tail_lines)));
        let stdout_handle = spawn_tail_reader(stdout, Arc::clone(&tail));
        let stderr_handle = spawn_tail_reader(stderr, Arc::clone(&tail));

        let mut timed_out = false;
        let status = match child.wait_timeout(request.timeout).context("wait for child")? {
            Some(status) => status,
            None => {
                warn!(pid, "process timed out, escalating signals");
                timed_out = true;
                kill_group(pid, libc::SIGTERM);
                match child.wait_timeout(TERM_GRACE).context("wait after SIGTERM")? {
                    Some(status) => status,
                    None => {
                        warn!(pid, "process survived SIGTERM, sending SIGKILL");
                        kill_group(pid, libc::SIGKILL);
                        child.wait().context("wait after SIGKILL")?
                    }
                }
            }
        };

        join_reader(stdout_handle)?;
        join_reader(stderr_handle)?;

        let tail = Arc::try_unwrap(tail)
            .map_err(|_| anyhow!("tail buffer still shared"))?
            .into_inner()
            .map_err(|_| anyhow!("tail buffer poisoned"))?;

        let result = ProcessResult {
            exit_code: status.code(),
            timed_out,
            duration: start.elapsed(),
            tail: tail.lines.into_iter().collect(),
            dropped_lines: tail.dropped,
        };
        debug!(exit_code = ?result.exit_code, timed_out, "process finished");
        Ok(result)
    })();

    deregister_active(pid);
    result
}

fn spawn_tail_reader<R: Read + Send + 'static>(
    reader: R,
    tail: Arc<Mutex<TailBuffer>>,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        let mut buf_reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            let n = buf_reader.read_until(b'\n', &mut line).context("read line")?;
            if n == 0 {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if let Ok(mut tail) = tail.lock() {
                tail.push(text);
            }
        }
    })
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

// Process-wide table of live child pids, keyed by pid (== process-group id
// since every child is spawned with `process_group(0)`).
static ACTIVE: OnceLock<Mutex<HashMap<u32, Instant>>> = OnceLock::new();

fn active_table() -> &'static Mutex<HashMap<u32, Instant>> {
    ACTIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_active(pid: u32) {
    if let Ok(mut table) = active_table().lock() {
        table.insert(pid, Instant::now());
    }
}

fn deregister_active(pid: u32) {
    if let Ok(mut table) = active_table().lock() {
        table.remove(&pid);
    }
}

/// Number of registered live child processes.
pub fn active_count() -> usize {
    active_table().lock().map(|t| t.len()).unwrap_or(0)
}

/// Cascade termination to every registered process group.
///
/// SIGTERM to each group, one shared grace period, then SIGKILL for groups
/// still alive. Used by the interrupt handler; the per-call waiters still
/// reap their own children.
pub fn terminate_all(grace: Duration) {
    let pids: Vec<u32> = active_table()
        .lock()
        .map(|t| t.keys().copied().collect())
        .unwrap_or_default();
    if pids.is_empty() {
        return;
    }
    warn!(count = pids.len(), "terminating active process groups");
    for pid in &pids {
        kill_group(*pid, libc::SIGTERM);
    }
    thread::sleep(grace);
    for pid in &pids {
        if process_alive(*pid as i32) {
            kill_group(*pid, libc::SIGKILL);
        }
    }
}

/// Signal an entire process group via the negated group id.
#[allow(unsafe_code)]
fn kill_group(pgid: u32, signal: i32) {
    let target = -(pgid as i32);
    // ESRCH just means the group already exited.
    let _ = unsafe { libc::kill(target, signal) };
}

/// True when `pid` still names a live process (signal 0 probe).
///
/// EPERM means the process exists but belongs to someone else; that still
/// counts as alive.
#[allow(unsafe_code)]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration, tail_lines: usize) -> ProcessRequest {
        ProcessRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: PathBuf::from("."),
            timeout,
            env: Vec::new(),
            stdin: None,
            tail_lines,
        }
    }

    #[test]
    fn captures_exit_code_and_tail() {
        let result = run(&sh("echo one; echo two >&2; exit 3", Duration::from_secs(5), 10))
            .expect("run");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
        assert!(result.tail.contains(&"one".to_string()));
        assert!(result.tail.contains(&"two".to_string()));
        assert_eq!(result.dropped_lines, 0);
    }

    /// The tail keeps the newest lines and counts the drops.
    #[test]
    fn tail_is_bounded() {
        let result = run(&sh(
            "for i in 1 2 3 4 5 6; do echo line$i; done",
            Duration::from_secs(5),
            2,
        ))
        .expect("run");
        assert_eq!(result.tail, vec!["line5".to_string(), "line6".to_string()]);
        assert_eq!(result.dropped_lines, 4);
        assert!(result.tail_text().contains("4 earlier lines dropped"));
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let start = Instant::now();
        let result = run(&sh("sleep 30", Duration::from_millis(200), 10)).expect("run");
        assert!(result.timed_out);
        assert!(!result.success());
        // Must not have waited for the full sleep.
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn stdin_is_delivered() {
        let mut request = sh("cat", Duration::from_secs(5), 10);
        request.stdin = Some(b"from stdin\n".to_vec());
        let result = run(&request).expect("run");
        assert!(result.success());
        assert_eq!(result.tail, vec!["from stdin".to_string()]);
    }

    #[test]
    fn active_table_registers_and_clears() {
        let before = active_count();
        let result = run(&sh("true", Duration::from_secs(5), 4)).expect("run");
        assert!(result.success());
        assert_eq!(active_count(), before);
    }

    #[test]
    fn liveness_probe_detects_dead_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(-7));
        // Our own pid is alive.
        assert!(process_alive(std::process::id() as i32));
    }
}
