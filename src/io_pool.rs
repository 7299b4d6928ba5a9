//! I/O lane pool for connection handling.
//!
//! The accept loop can hand each connection to a pool of lanes instead of
//! spawning everything from its own scheduler. Each lane is an OS thread
//! draining its own channel of accepted sockets; a connection stays with
//! the lane that received it for its whole life. The round-robin counter is
//! a relaxed atomic, so placement needs no locks.
//!
//! Holding the sender half of a lane's channel is the lane's work guard:
//! `join` drops the senders and waits for the lane threads to drain and
//! exit, `stop` additionally discards sockets still queued.

use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use may::net::TcpStream;
use may::sync::mpsc;
use tracing::{debug, error};

use crate::router::Router;
use crate::server::{spawn_connection, ServerOptions};

/// An accepted socket together with the shared state its connection needs.
pub(crate) struct LaneTask {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) router: Arc<Router>,
    pub(crate) opts: Arc<ServerOptions>,
    pub(crate) stop: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct IoThreadPool {
    senders: Mutex<Option<Vec<mpsc::Sender<LaneTask>>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next_lane: AtomicUsize,
    discarding: Arc<AtomicBool>,
    size: usize,
}

impl IoThreadPool {
    /// Spawn a pool of `lanes` I/O lanes. Zero lanes is invalid.
    pub fn new(lanes: usize) -> io::Result<Self> {
        if lanes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "number of io lanes cannot be 0",
            ));
        }

        let discarding = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(lanes);
        let mut threads = Vec::with_capacity(lanes);

        for lane_id in 0..lanes {
            let (tx, rx) = mpsc::channel::<LaneTask>();
            let lane_discarding = discarding.clone();
            let thread = thread::Builder::new()
                .name(format!("kestrel-io-{lane_id}"))
                .spawn(move || run_lane(lane_id, rx, lane_discarding))?;
            senders.push(tx);
            threads.push(thread);
        }

        Ok(Self {
            senders: Mutex::new(Some(senders)),
            threads: Mutex::new(threads),
            next_lane: AtomicUsize::new(0),
            discarding,
            size: lanes,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Round-robin placement onto the next lane.
    pub(crate) fn dispatch(&self, task: LaneTask) {
        let guard = self.senders.lock().unwrap();
        let Some(senders) = guard.as_ref() else {
            error!(peer = %task.peer, "io pool is shut down; dropping connection");
            return;
        };

        let lane = self.next_lane.fetch_add(1, Ordering::Relaxed) % senders.len();
        if senders[lane].send(task).is_err() {
            error!(lane, "io lane is gone; dropping connection");
        }
    }

    /// Release the lane work guards and wait for the lane threads to drain
    /// their queues and exit. Connections already running are not waited
    /// for; they finish on their own coroutines.
    pub fn join(&self) {
        drop(self.senders.lock().unwrap().take());
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }

    /// Shut the pool down as soon as possible. Sockets still queued on a
    /// lane are discarded instead of served.
    pub fn stop(&self) {
        self.discarding.store(true, Ordering::Relaxed);
        self.join();
    }
}

fn run_lane(lane_id: usize, rx: mpsc::Receiver<LaneTask>, discarding: Arc<AtomicBool>) {
    // A lane that dies would silently strand its share of connections, so
    // recoverable faults restart the loop; the receiver survives restarts.
    loop {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for task in rx.iter() {
                if discarding.load(Ordering::Relaxed) {
                    debug!(lane_id, peer = %task.peer, "discarding queued connection");
                    continue;
                }
                debug!(lane_id, peer = %task.peer, "lane received connection");
                spawn_connection(task.stream, task.peer, task.router, task.opts, task.stop);
            }
        }));

        match outcome {
            Ok(()) => break,
            Err(_) => error!(lane_id, "io lane failed; restarting"),
        }
    }

    debug!(lane_id, "io lane exits");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_lanes_is_invalid() {
        let err = IoThreadPool::new(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_pool_reports_size_and_joins() {
        let pool = IoThreadPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);
        pool.join();
        // Joining twice is harmless.
        pool.join();
    }

    #[test]
    fn test_stop_discards_queued_work() {
        let pool = IoThreadPool::new(2).unwrap();
        pool.stop();
        assert_eq!(pool.size(), 2);
    }
}
