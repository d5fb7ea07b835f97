//! Deadline supervision for in-flight commands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::{state, CommandState};

#[derive(Debug)]
struct Registration {
    command: Arc<CommandState>,
    deadline: Instant,
}

/// Single-task supervisor that sweeps registered commands against their
/// deadlines.
///
/// On expiry it performs the terminal compare-and-swap to `FAIL_TIMEOUT` and
/// aborts the command's pending socket operation. It never invokes listeners
/// itself: completion is always published by whichever side first wins the
/// state transition, and a command whose driver got there first is simply
/// dropped from the sweep.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    tx: mpsc::UnboundedSender<Registration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutSupervisor {
    /// Spawns the supervisor task with the given sweep interval.
    pub fn start(tick: Duration) -> TimeoutSupervisor {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, tick));
        TimeoutSupervisor {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Places a command under supervision until `deadline`.
    ///
    /// Commands with no deadline are never registered; they run unbounded.
    pub(crate) fn register(&self, command: Arc<CommandState>, deadline: Instant) {
        // A send can only fail after shutdown, when no commands are running.
        let _ = self.tx.send(Registration { command, deadline });
    }

    /// Stops the sweep task.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Registration>, tick: Duration) {
    let mut pending: Vec<Registration> = Vec::new();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            registration = rx.recv() => {
                match registration {
                    Some(r) => pending.push(r),
                    None => break,
                }
            }
            _ = interval.tick() => {
                let now = Instant::now();
                pending.retain(|reg| {
                    // Terminated elsewhere; nothing to supervise.
                    if reg.command.status() != state::IN_PROGRESS {
                        return false;
                    }
                    if now >= reg.deadline {
                        if reg.command.try_transition(state::FAIL_TIMEOUT) {
                            tracing::debug!("command deadline elapsed, aborting");
                            reg.command.abort();
                        }
                        // Expired entries are not requeued either way.
                        return false;
                    }
                    true
                });
            }
        }
    }
}
