//! PID-1 manager: the first process inside each Linux container.
//!
//! Multiplexes spawns over a control socket held by the daemon. The
//! SIGCHLD handler only flips an atomic flag (via `signal-hook`); actual
//! zombie reaping runs cooperatively on the main loop, so no allocator
//! or logging work ever happens in signal context.

#![cfg(unix)]

use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{SpawnOptions, validate_spawn};
use crate::{Error, Result};

/// Grace period between SIGTERM and SIGKILL during cleanup.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Control request sent from the daemon to a container's PID-1.
#[derive(Debug, Serialize, Deserialize)]
pub enum Pid1Request {
    /// Spawn a process.
    Spawn(SpawnOptions),
    /// Kill a process by pid.
    Kill {
        /// Raw pid inside the container's pid namespace.
        pid: u32,
    },
    /// Reap exited children.
    Reap,
    /// Graceful shutdown: cleanup then exit.
    Shutdown,
}

/// Control reply from PID-1 to the daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum Pid1Reply {
    /// Spawn succeeded.
    Spawned {
        /// Raw child pid.
        pid: u32,
        /// Exit code when the spawn was a waiting one.
        exit_code: Option<i32>,
    },
    /// Kill succeeded and the record was removed.
    Killed,
    /// Reap result.
    Reaped {
        /// Number of zombies collected.
        count: u32,
    },
    /// Shutdown acknowledged.
    Bye,
    /// Operation failed.
    Err(String),
}

/// The in-container process table and reaper.
#[derive(Debug)]
pub struct Pid1 {
    /// Live children, keyed by raw pid.
    table: HashMap<u32, Child>,
    /// Set by the SIGCHLD handler; drained by [`Pid1::reap_zombies`].
    sigchld: Arc<AtomicBool>,
}

impl Pid1 {
    /// Initializes the manager and installs the SIGCHLD flag handler.
    pub fn init() -> Result<Self> {
        let sigchld = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&sigchld))
            .map_err(|e| Error::os("register SIGCHLD", e))?;
        Ok(Self {
            table: HashMap::new(),
            sigchld,
        })
    }

    /// Spawns a child and registers it in the table.
    pub fn spawn(&mut self, opts: &SpawnOptions) -> Result<u32> {
        validate_spawn(opts)?;

        let mut cmd = Command::new(&opts.argv[0]);
        cmd.args(&opts.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.env_clear();
        for pair in &opts.env {
            if let Some((k, v)) = pair.split_once('=') {
                cmd.env(k, v);
            }
        }

        let child = cmd.spawn().map_err(|e| Error::os("spawn", e))?;
        let pid = child.id();
        debug!(pid, argv0 = %opts.argv[0], "spawned");
        self.table.insert(pid, child);
        Ok(pid)
    }

    /// Blocks until the given child exits; removes it and returns the
    /// exit code (`-1` when killed by signal).
    pub fn wait(&mut self, pid: u32) -> Result<i32> {
        let mut child = self
            .table
            .remove(&pid)
            .ok_or_else(|| Error::Backend(format!("no process {pid}")))?;
        let status = child.wait().map_err(|e| Error::os("wait", e))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Kills a child and removes its record.
    pub fn kill(&mut self, pid: u32) -> Result<()> {
        let mut child = self
            .table
            .remove(&pid)
            .ok_or_else(|| Error::Backend(format!("no process {pid}")))?;
        #[allow(clippy::cast_possible_wrap)]
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        let _ = child.wait();
        Ok(())
    }

    /// Cooperative reaper: collects every exited child, clears the
    /// SIGCHLD flag, and returns the number reaped.
    pub fn reap_zombies(&mut self) -> u32 {
        self.sigchld.store(false, Ordering::SeqCst);
        let mut reaped = 0;
        self.table.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, code = status.code().unwrap_or(-1), "reaped");
                reaped += 1;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid, error = %e, "try_wait failed; dropping record");
                reaped += 1;
                false
            }
        });
        reaped
    }

    /// Whether the SIGCHLD flag is pending.
    pub fn sigchld_pending(&self) -> bool {
        self.sigchld.load(Ordering::SeqCst)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Terminates everything left in the table: SIGTERM, a two-second
    /// grace period, SIGKILL, then a final reap.
    pub fn cleanup(&mut self) {
        for pid in self.table.keys() {
            #[allow(clippy::cast_possible_wrap)]
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }

        let deadline = Instant::now() + CLEANUP_GRACE;
        while !self.table.is_empty() && Instant::now() < deadline {
            self.reap_zombies();
            std::thread::sleep(Duration::from_millis(50));
        }

        for pid in self.table.keys() {
            #[allow(clippy::cast_possible_wrap)]
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
        // Final reap: every remaining child got SIGKILL, so wait for each.
        for (_, mut child) in self.table.drain() {
            let _ = child.wait();
        }
    }
}

/// Serves the control socket until `Shutdown` or the daemon hangs up.
///
/// This is PID-1's main loop inside the container: one request at a
/// time, reaping between requests.
pub fn run(mut control: UnixStream) -> Result<()> {
    let mut pid1 = Pid1::init()?;
    loop {
        let req: Pid1Request = match containerv_proto::read_packet(&mut control) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::os("control read", e)),
        };

        if pid1.sigchld_pending() {
            pid1.reap_zombies();
        }

        let reply = match req {
            Pid1Request::Spawn(opts) => match pid1.spawn(&opts) {
                Ok(pid) if opts.wait => match pid1.wait(pid) {
                    Ok(code) => Pid1Reply::Spawned {
                        pid,
                        exit_code: Some(code),
                    },
                    Err(e) => Pid1Reply::Err(e.to_string()),
                },
                Ok(pid) => Pid1Reply::Spawned {
                    pid,
                    exit_code: None,
                },
                Err(e) => Pid1Reply::Err(e.to_string()),
            },
            Pid1Request::Kill { pid } => match pid1.kill(pid) {
                Ok(()) => Pid1Reply::Killed,
                Err(e) => Pid1Reply::Err(e.to_string()),
            },
            Pid1Request::Reap => Pid1Reply::Reaped {
                count: pid1.reap_zombies(),
            },
            Pid1Request::Shutdown => {
                pid1.cleanup();
                let _ = containerv_proto::write_packet(&mut control, &Pid1Reply::Bye);
                break;
            }
        };
        containerv_proto::write_packet(&mut control, &reply)
            .map_err(|e| Error::os("control write", e))?;
    }
    Ok(())
}
