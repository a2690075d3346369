// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Child process supervision.
//!
//! The SIGCHLD handler does exactly one async-signal-safe thing: write a
//! byte to a self-pipe registered with the poller. The main loop drains the
//! pipe, reaps every exited pid, and advances the queue the pid belonged
//! to. Commands in a queue run sequentially.

use std::{
    collections::VecDeque,
    ffi::{OsStr, OsString},
    io::{BufRead as _, BufReader, Read},
    os::fd::{AsRawFd, BorrowedFd},
    process::Stdio,
    sync::atomic::{AtomicI32, Ordering},
};

use anyhow::{anyhow, Context as _};
use nix::sys::{
    signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    wait::{waitpid, WaitPidFlag, WaitStatus},
};
use pathsearch::find_executable_in_path;
use slotmap::SlotMap;
use tracing::{debug, info, trace};

slotmap::new_key_type! { pub struct QueueKey; }

static REAPER_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: i32) {
    let fd = REAPER_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        // Only async-signal-safe work here.
        let _ = nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &[0]);
    }
}

/// A command to run, with its environment additions.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

struct ProcessQueue {
    running: Option<u32>,
    queued: VecDeque<Launch>,
}

pub struct ProcessSupervisor {
    reaper_recv: mio::unix::pipe::Receiver,
    // Keeps the write end alive for the handler.
    _reaper_send: mio::unix::pipe::Sender,

    output_recv: BufReader<mio::unix::pipe::Receiver>,
    output_send: mio::unix::pipe::Sender,

    queues: SlotMap<QueueKey, ProcessQueue>,
}

impl ProcessSupervisor {
    pub fn new() -> anyhow::Result<Self> {
        let (reaper_send, reaper_recv) = mio::unix::pipe::new()?;
        let (output_send, output_recv) = mio::unix::pipe::new()?;

        REAPER_PIPE.store(reaper_send.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGCHLD, &action) }.context("failed to install handler")?;

        Ok(Self {
            reaper_recv,
            _reaper_send: reaper_send,

            output_recv: BufReader::new(output_recv),
            output_send,

            queues: SlotMap::default(),
        })
    }

    pub fn reaper_source(&mut self) -> &mut mio::unix::pipe::Receiver {
        &mut self.reaper_recv
    }

    pub fn output_source(&mut self) -> &mut mio::unix::pipe::Receiver {
        self.output_recv.get_mut()
    }

    pub fn create_queue(&mut self) -> QueueKey {
        self.queues.insert(ProcessQueue {
            running: None,
            queued: VecDeque::new(),
        })
    }

    /// Appends a command; it starts immediately if the queue is idle.
    pub fn enqueue(&mut self, queue: QueueKey, launch: Launch) -> anyhow::Result<()> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("no such queue"))?;

        q.queued.push_back(launch);
        if q.running.is_none() {
            self.spawn_next(queue)?;
        }

        Ok(())
    }

    /// True if any queue still has work.
    pub fn busy(&self) -> bool {
        self.queues
            .values()
            .any(|q| q.running.is_some() || !q.queued.is_empty())
    }

    /// Called when the self-pipe becomes readable: reap everything that
    /// exited and advance the affected queues.
    pub fn drain(&mut self) -> anyhow::Result<()> {
        let mut buf = [0_u8; 64];
        loop {
            match self.reaper_recv.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    info!(pid = pid.as_raw(), code, "child exited");
                    self.note_exit(pid.as_raw() as u32)?;
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    info!(pid = pid.as_raw(), ?signal, "child killed");
                    self.note_exit(pid.as_raw() as u32)?;
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn note_exit(&mut self, pid: u32) -> anyhow::Result<()> {
        let key = self
            .queues
            .iter()
            .find(|(_, q)| q.running == Some(pid))
            .map(|(k, _)| k);

        if let Some(key) = key {
            self.queues[key].running = None;
            self.spawn_next(key)?;
        }

        Ok(())
    }

    fn spawn_next(&mut self, key: QueueKey) -> anyhow::Result<()> {
        let Some(queue) = self.queues.get_mut(key) else {
            return Ok(());
        };
        let Some(launch) = queue.queued.pop_front() else {
            return Ok(());
        };

        let exe = find_executable_in_path(&launch.program)
            .ok_or_else(|| anyhow!("command {:?} not in PATH", &launch.program))?;

        let stdout = dup_stdio(&self.output_send)?;
        let stderr = dup_stdio(&self.output_send)?;

        let mut command = std::process::Command::new(&exe);
        command
            .args(&launch.args)
            .envs(launch.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        unsafe {
            use std::os::unix::process::CommandExt as _;
            command.pre_exec(|| {
                // Children get their own process group, so signalling the
                // group doesn't hit us.
                rustix::process::setsid()?;
                Ok(())
            });
        }

        match command.spawn() {
            Ok(child) => {
                trace!(pid = child.id(), exe = ?exe, "child process started");
                self.queues[key].running = Some(child.id());
                Ok(())
            }
            Err(e) => Err(anyhow!(
                "failed to spawn child process '{}': {:#}",
                exe.to_string_lossy(),
                e
            )),
        }
    }

    pub fn signal_all(&mut self, signal: rustix::process::Signal) {
        for queue in self.queues.values_mut() {
            queue.queued.clear();
            if let Some(pid) = queue.running {
                if let Some(pid) = rustix::process::Pid::from_raw(pid as i32) {
                    let _ = rustix::process::kill_process_group(pid, signal);
                }
            }
        }
    }

    /// Forwards child stdout/stderr to the log.
    pub fn dump_output(&mut self) {
        let mut buf = String::new();

        loop {
            buf.clear();
            match self.output_recv.read_line(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = buf.trim();
                    if !line.is_empty() {
                        trace!(target: "waybridge::child", "{}", line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("child output error: {:?}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Don't leave orphans behind on shutdown.
        self.signal_all(rustix::process::Signal::Term);
    }
}

fn dup_stdio(pipe: &mio::unix::pipe::Sender) -> anyhow::Result<Stdio> {
    let fd = unsafe { BorrowedFd::borrow_raw(pipe.as_raw_fd()) }.try_clone_to_owned()?;
    Ok(fd.into())
}

/// Builds the environment for the client app: the wayland socket, plus
/// whatever the caller wants layered on top.
pub fn client_launch(
    command: &[OsString],
    socket_name: &OsStr,
) -> anyhow::Result<Launch> {
    let mut args = command.to_vec();
    if args.is_empty() {
        anyhow::bail!("empty command");
    }
    let program = args.remove(0);

    Ok(Launch {
        program,
        args,
        envs: vec![("WAYLAND_DISPLAY".into(), socket_name.into())],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_launch_splits_command() {
        let command: Vec<OsString> = vec!["app".into(), "--flag".into()];
        let launch = client_launch(&command, OsStr::new("wl-7")).unwrap();

        assert_eq!(launch.program, OsString::from("app"));
        assert_eq!(launch.args, vec![OsString::from("--flag")]);
        assert_eq!(
            launch.envs,
            vec![(
                OsString::from("WAYLAND_DISPLAY"),
                OsString::from("wl-7")
            )]
        );
    }

    #[test]
    fn client_launch_rejects_empty() {
        assert!(client_launch(&[], OsStr::new("wl-7")).is_err());
    }
}
