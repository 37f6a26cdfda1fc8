//! Background write-back of game records.
//!
//! The main loop never touches the filesystem for game data. The dirty
//! sweep serializes each record into an owned snapshot and pushes it over a
//! bounded channel; this worker drains the channel to per-game files. The
//! channel capacity is the write pool: when it is full the sweep stops for
//! that tick and resumes on the next, which bounds filesystem load
//! independent of game-traffic bursts.

use ember::logging::{error, info, warn, Logger};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread;

#[derive(Debug)]
pub enum SaveJob {
    Write { path: PathBuf, bytes: Vec<u8> },
    Delete { path: PathBuf },
}

/// Anything that accepts save jobs with backpressure. The cache sweep is
/// written against this so tests can drain synchronously.
pub trait SaveSink {
    /// Submits a job, or returns it when the sink is at capacity.
    fn try_submit(&self, job: SaveJob) -> Result<(), SaveJob>;
}

pub struct Saver {
    tx: Option<SyncSender<SaveJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Saver {
    /// Spawns the drain thread with a write pool of `pool` pending jobs.
    pub fn spawn(pool: usize, log: Logger) -> io::Result<Saver> {
        let (tx, rx) = sync_channel(pool);

        let worker = thread::Builder::new()
            .name("game-saver".to_string())
            .spawn(move || drain(rx, log))?;

        Ok(Saver {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Closes the channel and waits for the worker to finish the backlog.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());

        if let Some(worker) = self.worker.take() {
            drop(worker.join());
        }
    }
}

impl SaveSink for Saver {
    fn try_submit(&self, job: SaveJob) -> Result<(), SaveJob> {
        match &self.tx {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(job)) => Err(job),
                Err(TrySendError::Disconnected(job)) => Err(job),
            },
            None => Err(job),
        }
    }
}

impl Drop for Saver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(rx: Receiver<SaveJob>, log: Logger) {
    for job in rx {
        match job {
            SaveJob::Write { path, bytes } => {
                if let Err(err) = fs::write(&path, &bytes) {
                    error!(log, "Game write failed"; "path" => %path.display(), "error" => %err);
                }
            }
            SaveJob::Delete { path } => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(log, "Game delete failed"; "path" => %path.display(), "error" => %err);
                }
            },
        }
    }

    info!(log, "Game saver drained and stopped");
}

/// Capacity-bounded in-memory sink for tests.
#[cfg(test)]
pub(crate) struct MemorySink {
    pub jobs: std::cell::RefCell<Vec<SaveJob>>,
    pub capacity: usize,
}

#[cfg(test)]
impl MemorySink {
    pub fn new(capacity: usize) -> MemorySink {
        MemorySink {
            jobs: std::cell::RefCell::new(Vec::new()),
            capacity,
        }
    }
}

#[cfg(test)]
impl SaveSink for MemorySink {
    fn try_submit(&self, job: SaveJob) -> Result<(), SaveJob> {
        let mut jobs = self.jobs.borrow_mut();

        if jobs.len() >= self.capacity {
            return Err(job);
        }

        jobs.push(job);
        Ok(())
    }
}
