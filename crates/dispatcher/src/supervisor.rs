//! The process manager: forks one dispatcher, N syncer workers, and one
//! replication-manager (change-streamer), and coordinates graceful drain.
//!
//! Drain order on SIGINT/SIGTERM: user-facing workers first (they stop
//! accepting and let in-flight connections finish), then supporting
//! workers. SIGQUIT, or any worker exiting on its own, escalates to a
//! forceful stop of the whole fleet.

use std::{
    collections::HashMap,
    env,
    os::fd::{
        AsRawFd,
        FromRawFd,
        RawFd,
    },
    os::unix::net::UnixStream,
    path::PathBuf,
    process::Stdio,
};

use common::knobs::DRAIN_GRACE_PERIOD;
use futures::future::select_all;
use nix::{
    fcntl::{
        fcntl,
        FcntlArg,
        FdFlag,
    },
    sys::signal::{
        kill,
        Signal,
    },
    unistd::Pid,
};
use tokio::signal::unix::{
    signal,
    SignalKind,
};

const WORKER_KIND_ENV: &str = "ZERO_WORKER_KIND";
const WORKER_INDEX_ENV: &str = "ZERO_WORKER_INDEX";
const HANDOFF_FDS_ENV: &str = "ZERO_HANDOFF_FDS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Dispatcher,
    Syncer,
    ChangeStreamer,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Dispatcher => "dispatcher",
            WorkerKind::Syncer => "syncer",
            WorkerKind::ChangeStreamer => "change-streamer",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatcher" => Some(WorkerKind::Dispatcher),
            "syncer" => Some(WorkerKind::Syncer),
            "change-streamer" => Some(WorkerKind::ChangeStreamer),
            _ => None,
        }
    }

    /// Drains in the first stage.
    fn user_facing(&self) -> bool {
        matches!(self, WorkerKind::Dispatcher | WorkerKind::Syncer)
    }

    /// How this process was launched: `None` means we are the supervisor.
    pub fn from_env() -> Option<(Self, usize)> {
        let kind = Self::parse(&env::var(WORKER_KIND_ENV).ok()?)?;
        let index = env::var(WORKER_INDEX_ENV)
            .ok()
            .and_then(|i| i.parse().ok())
            .unwrap_or(0);
        Some((kind, index))
    }
}

/// The handoff channels this worker inherited, keyed by peer index. For the
/// dispatcher that is one channel per syncer; for a syncer, a single
/// channel (index 0) back to the dispatcher.
pub fn inherited_handoff_channels() -> anyhow::Result<HashMap<usize, UnixStream>> {
    let Ok(spec) = env::var(HANDOFF_FDS_ENV) else {
        return Ok(HashMap::new());
    };
    let mut channels = HashMap::new();
    for entry in spec.split(',').filter(|e| !e.is_empty()) {
        let (index, fd) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Malformed {HANDOFF_FDS_ENV} entry {entry:?}"))?;
        let index: usize = index.parse()?;
        let fd: RawFd = fd.parse()?;
        // Safety: the supervisor opened this fd for us and nothing else in
        // this process owns it.
        channels.insert(index, unsafe { UnixStream::from_raw_fd(fd) });
    }
    Ok(channels)
}

struct Worker {
    kind: WorkerKind,
    index: usize,
    child: tokio::process::Child,
}

impl Worker {
    fn name(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.index)
    }
}

pub struct Supervisor {
    workers: Vec<Worker>,
}

impl Supervisor {
    /// Fork the fleet from `binary` (normally `std::env::current_exe()`).
    pub fn spawn(binary: PathBuf, num_syncers: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(num_syncers > 0, "Need at least one syncer worker");
        let mut workers = Vec::new();
        let mut dispatcher_channels = Vec::new();

        for index in 0..num_syncers {
            let (dispatcher_end, syncer_end) = UnixStream::pair()?;
            let child = spawn_worker(
                &binary,
                WorkerKind::Syncer,
                index,
                vec![(0, syncer_end)],
            )?;
            dispatcher_channels.push((index, dispatcher_end));
            workers.push(Worker {
                kind: WorkerKind::Syncer,
                index,
                child,
            });
        }
        let child = spawn_worker(&binary, WorkerKind::Dispatcher, 0, dispatcher_channels)?;
        workers.push(Worker {
            kind: WorkerKind::Dispatcher,
            index: 0,
            child,
        });
        let child = spawn_worker(&binary, WorkerKind::ChangeStreamer, 0, vec![])?;
        workers.push(Worker {
            kind: WorkerKind::ChangeStreamer,
            index: 0,
            child,
        });
        Ok(Self { workers })
    }

    /// Supervise until a shutdown signal or an unexpected worker exit.
    pub async fn run(mut self) -> anyhow::Result<()> {
        enum Event {
            Drain(&'static str),
            ForceQuit,
            WorkerExit(usize),
        }
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let event = {
            let waits = self
                .workers
                .iter_mut()
                .enumerate()
                .map(|(i, worker)| Box::pin(async move { (i, worker.child.wait().await) }));
            tokio::select! {
                _ = sigint.recv() => Event::Drain("SIGINT"),
                _ = sigterm.recv() => Event::Drain("SIGTERM"),
                _ = sigquit.recv() => Event::ForceQuit,
                ((index, _status), ..) = select_all(waits) => Event::WorkerExit(index),
            }
        };
        match event {
            Event::Drain(signal_name) => {
                tracing::info!("{signal_name}: draining workers");
                self.drain().await
            },
            Event::ForceQuit => {
                tracing::warn!("SIGQUIT: force-stopping workers");
                self.force_stop();
                anyhow::bail!("Forced shutdown on SIGQUIT");
            },
            Event::WorkerExit(index) => {
                let name = self.workers[index].name();
                tracing::error!("Worker {name} exited unexpectedly; force-stopping the fleet");
                self.force_stop();
                anyhow::bail!("Worker {name} exited unexpectedly");
            },
        }
    }

    async fn drain(self) -> anyhow::Result<()> {
        let (user_facing, supporting): (Vec<Worker>, Vec<Worker>) = self
            .workers
            .into_iter()
            .partition(|worker| worker.kind.user_facing());
        for stage in [user_facing, supporting] {
            let mut waits = Vec::new();
            for mut worker in stage {
                let name = worker.name();
                if let Some(pid) = worker.child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        tracing::warn!("Failed to signal {name}: {e}");
                    }
                }
                waits.push(async move {
                    match tokio::time::timeout(*DRAIN_GRACE_PERIOD, worker.child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::info!("Worker {name} drained ({status})");
                        },
                        Ok(Err(e)) => {
                            // A failed drain must not hold up the rest.
                            tracing::error!("Worker {name} failed to drain: {e}");
                        },
                        Err(_) => {
                            tracing::error!("Worker {name} did not drain in time; killing");
                            let _ = worker.child.start_kill();
                        },
                    }
                });
            }
            futures::future::join_all(waits).await;
        }
        Ok(())
    }

    fn force_stop(&mut self) {
        for worker in &mut self.workers {
            if let Err(e) = worker.child.start_kill() {
                tracing::warn!("Failed to kill {}: {e}", worker.name());
            }
        }
    }
}

fn spawn_worker(
    binary: &std::path::Path,
    kind: WorkerKind,
    index: usize,
    channels: Vec<(usize, UnixStream)>,
) -> anyhow::Result<tokio::process::Child> {
    let mut fd_spec = Vec::new();
    for (peer, channel) in &channels {
        // Children inherit the fd only if CLOEXEC is cleared before exec.
        fcntl(channel.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
        fd_spec.push(format!("{peer}:{}", channel.as_raw_fd()));
    }
    let child = tokio::process::Command::new(binary)
        .env(WORKER_KIND_ENV, kind.as_str())
        .env(WORKER_INDEX_ENV, index.to_string())
        .env(HANDOFF_FDS_ENV, fd_spec.join(","))
        .stdin(Stdio::null())
        .spawn()?;
    // The parent's copies close now; the child owns its inherited ends.
    drop(channels);
    Ok(child)
}
