//! Process supervisor: launches and reaps service subprocesses, and scans
//! procfs for orphans that the kernel has reparented to us as PID 1.
//!
//! Grounded on the "monitoring map + inflight counter" shape of a classic
//! PID-1 reaper: a single mutex guards the PID → live/dead map, and a
//! separate inflight counter (guarded by its own mutex/condvar pair) lets
//! `wait()` block until every adopted and launched process has exited.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::os::fd::FromRawFd;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

const PROC: &str = "/proc";

struct ChildRegistry {
    monitoring: Mutex<HashMap<i32, bool>>,
    inflight: Mutex<usize>,
    inflight_cv: Condvar,
}

impl ChildRegistry {
    fn new() -> Self {
        ChildRegistry {
            monitoring: Mutex::new(HashMap::new()),
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
        }
    }

    fn is_monitoring(&self, pid: i32) -> bool {
        *self.monitoring.lock().unwrap().get(&pid).unwrap_or(&false)
    }

    fn set(&self, pid: i32, alive: bool) {
        self.monitoring.lock().unwrap().insert(pid, alive);
    }

    fn inc(&self) {
        *self.inflight.lock().unwrap() += 1;
    }

    fn dec(&self) {
        let mut n = self.inflight.lock().unwrap();
        *n -= 1;
        if *n == 0 {
            self.inflight_cv.notify_all();
        }
    }

    fn wait_all(&self) {
        let mut n = self.inflight.lock().unwrap();
        while *n > 0 {
            n = self.inflight_cv.wait(n).unwrap();
        }
    }
}

/// Duplicate our own stderr fd for use as a child's stdout/stderr, so
/// container log collectors see service output without us having to pipe
/// and copy it ourselves.
fn dup_stderr() -> Stdio {
    // SAFETY: dup() on a valid, always-open fd (our own stderr); the
    // resulting fd is immediately owned by the File we wrap it in.
    let fd = unsafe { libc::dup(2) };
    unsafe { Stdio::from(std::fs::File::from_raw_fd(fd)) }
}

pub struct Supervisor {
    my_pid: i32,
    registry: Arc<ChildRegistry>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor {
            my_pid: std::process::id() as i32,
            registry: Arc::new(ChildRegistry::new()),
        }
    }

    /// Synchronously run `<script> <arg>`, waiting for it to exit. Success
    /// iff it exits with status 0.
    pub fn run(&self, script: &Path, arg: &str) -> bool {
        let mut cmd = Command::new(script);
        cmd.arg(arg);
        cmd.stdout(dup_stderr());
        cmd.stderr(dup_stderr());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to start {}: {e}", script.display());
                return false;
            }
        };

        let pid = child.id() as i32;
        self.registry.set(pid, true);
        // wait() blocks without holding any lock: the registry entry stays
        // `true` the whole time, which is what scan() needs to see.
        let status = child.wait();
        self.registry.set(pid, false);

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("failed to wait for {}: {e}", script.display());
                false
            }
        }
    }

    /// Asynchronously launch `<script>` with no argument, for a `Non-Stop`
    /// service. Returns its pid immediately; a background thread owns the
    /// `Child` for the rest of its life, reaping it and clearing the
    /// registry entry whenever it exits.
    pub fn spawn(&self, script: &Path) -> Option<i32> {
        let mut cmd = Command::new(script);
        cmd.stdout(dup_stderr());
        cmd.stderr(dup_stderr());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to spawn {}: {e}", script.display());
                return None;
            }
        };

        let pid = child.id() as i32;
        self.registry.set(pid, true);
        self.registry.inc();

        let registry = Arc::clone(&self.registry);
        let path = script.to_path_buf();
        thread::spawn(move || {
            match child.wait() {
                Ok(status) => debug!("non-stop service {} exited: {status}", path.display()),
                Err(e) => warn!("failed to wait for {}: {e}", path.display()),
            }
            registry.set(pid, false);
            registry.dec();
        });

        Some(pid)
    }

    /// Walk procfs once, adopting any process whose PPid is us and which
    /// we are not already monitoring as live.
    pub fn scan(&self) {
        let entries = match std::fs::read_dir(PROC) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("procfs scan skipped: {e}");
                return;
            }
        };

        // Held for the whole walk so "already monitored?" and "insert" are
        // atomic with respect to a concurrent scan (there's only ever one
        // scan at a time in practice, but this also protects against a
        // run()/spawn() registering the same pid mid-walk).
        let mut monitoring = self.registry.monitoring.lock().unwrap();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(pid) = name.parse::<i32>() else { continue };
            if pid <= 1 {
                continue;
            }
            if *monitoring.get(&pid).unwrap_or(&false) {
                continue;
            }
            if !is_child_of(pid, self.my_pid) {
                continue;
            }

            monitoring.insert(pid, true);
            self.registry.inc();

            let registry = Arc::clone(&self.registry);
            thread::spawn(move || {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(_) => debug!("adopted child {pid} exited"),
                    Err(e) => debug!("wait on adopted child {pid} failed: {e}"),
                }
                registry.set(pid, false);
                registry.dec();
            });

            debug!("monitoring adopted child {pid} ({})", read_cmdline(pid));
        }
    }

    /// Send SIGINT to every PID we're currently monitoring as live.
    /// Per-PID errors (already exited, permission denied) are suppressed.
    pub fn kill_all(&self) {
        let monitoring = self.registry.monitoring.lock().unwrap();
        for (&pid, &alive) in monitoring.iter() {
            if !alive {
                continue;
            }
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGINT);
        }
    }

    /// Send SIGINT to one pid directly; used by the stop executor for a
    /// `Non-Stop` service's recorded process.
    pub fn signal_pid(&self, pid: i32) -> bool {
        signal::kill(Pid::from_raw(pid), Signal::SIGINT).is_ok()
    }

    pub fn is_monitoring(&self, pid: i32) -> bool {
        self.registry.is_monitoring(pid)
    }

    /// Block until every adopted and launched process has exited.
    pub fn wait(&self) {
        self.registry.wait_all();
    }
}

fn is_child_of(pid: i32, my_pid: i32) -> bool {
    let Ok(f) = std::fs::File::open(format!("{PROC}/{pid}/status")) else {
        return false;
    };
    for line in BufReader::new(f).lines().map_while(Result::ok) {
        let lower = line.to_ascii_lowercase();
        let Some(rest) = lower.strip_prefix("ppid:") else {
            continue;
        };
        return rest.trim() == my_pid.to_string();
    }
    false
}

fn read_cmdline(pid: i32) -> String {
    std::fs::read(format!("{PROC}/{pid}/cmdline"))
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .replace('\0', " ")
                .trim()
                .to_string()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn run_reports_exit_status() {
        let sup = Supervisor::new();
        assert!(sup.run(Path::new("/bin/true"), ""));
        assert!(!sup.run(Path::new("/bin/false"), ""));
    }

    #[test]
    fn spawn_and_wait_drains_inflight() {
        let sup = Supervisor::new();
        let pid = sup.spawn(Path::new("/bin/true"));
        assert!(pid.is_some());
        sup.wait();
        assert!(!sup.is_monitoring(pid.unwrap()));
    }

    /// Scenario D: a service double-forks a grandchild and exits; scan()
    /// must notice the orphan once the kernel reparents it to us and
    /// wait() must not return until the grandchild itself has exited.
    ///
    /// Marking ourselves a child subreaper (`PR_SET_CHILD_SUBREAPER`) makes
    /// the kernel reparent the orphan to this test process instead of the
    /// real PID 1, so the scenario is reproducible without actually running
    /// as init.
    #[test]
    fn scan_adopts_orphaned_grandchild() {
        nix::sys::prctl::set_child_subreaper(true).unwrap();

        let sup = Supervisor::new();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sh -c 'sleep 0.3' & exit 0")
            .spawn()
            .unwrap();
        // Reaping the immediate child leaves the grandchild parentless;
        // the kernel has already reparented it to us by this point.
        child.wait().unwrap();
        thread::sleep(Duration::from_millis(50));

        sup.scan();

        let start = Instant::now();
        sup.wait();
        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "wait() returned before the adopted grandchild could have exited"
        );
    }
}
