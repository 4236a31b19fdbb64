// src/worker.rs
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use tracing::{debug, error, info_span, trace};

use crate::conn::{Connection, RequestStatus, now_ms};
use crate::io::{ConnectionIo, Handler};
use crate::metrics::Metrics;
use crate::poller::Waker;
use crate::slab::Token;

pub const WORKERS_PER_REACTOR: usize = 4;

/// A connection with a parsed request, owned by a worker until completion.
pub(crate) struct Job {
    pub token: Token,
    pub conn: Box<Connection>,
}

/// A connection handed back to its reactor. `keep` tells whether it waits
/// for another request.
pub(crate) struct Completion {
    pub token: Token,
    pub conn: Box<Connection>,
    pub keep: bool,
}

#[derive(Clone)]
struct WorkerContext {
    handler: Arc<dyn Handler>,
    completions: Arc<SegQueue<Completion>>,
    waker: Arc<Waker>,
    metrics: Arc<Metrics>,
}

/// Worker threads of one reactor, fed round-robin.
pub(crate) struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    pub fn spawn(
        reactor: usize,
        count: usize,
        handler: Arc<dyn Handler>,
        completions: Arc<SegQueue<Completion>>,
        waker: Arc<Waker>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        let ctx = WorkerContext { handler, completions, waker, metrics };
        let mut pool = Self {
            senders: Vec::with_capacity(count),
            handles: Vec::with_capacity(count),
            next: 0,
        };

        for j in 0..count.max(1) {
            let (tx, rx) = mpsc::channel();
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}.{}", reactor, j))
                .spawn(move || run(rx, ctx));
            match handle {
                Ok(handle) => {
                    pool.senders.push(tx);
                    pool.handles.push(handle);
                }
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    /// Queue a job on the next worker. The job comes back if every worker
    /// is gone.
    pub fn submit(&mut self, mut job: Job) -> Result<(), Job> {
        for _ in 0..self.senders.len() {
            let i = self.next;
            self.next = (self.next + 1) % self.senders.len();
            match self.senders[i].send(job) {
                Ok(()) => return Ok(()),
                Err(SendError(back)) => job = back,
            }
        }
        Err(job)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Close the queues and join the threads after their current job.
    pub fn shutdown(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<Job>, ctx: WorkerContext) {
    trace!("worker started");
    while let Ok(Job { token, mut conn }) = rx.recv() {
        let keep = serve(&mut conn, &ctx);
        ctx.completions.push(Completion { token, conn, keep });
        if let Err(e) = ctx.waker.wake() {
            error!("failed to wake reactor: {}", e);
        }
    }
    trace!("worker stopped");
}

/// Answer every complete request buffered on the connection.
fn serve(conn: &mut Connection, ctx: &WorkerContext) -> bool {
    loop {
        if let Some(reject) = conn.reject.take() {
            let before = conn.bytes_sent;
            let mut io = ConnectionIo::new(conn);
            if let Err(e) = io.send_error(reject.status, Some(reject.reason)) {
                debug!("failed to send rejection: {}", e);
            }
            ctx.metrics.add_bytes(conn.bytes_sent - before);
            conn.rearm(None);
            return false;
        }

        conn.prepare_dispatch(now_ms());
        dispatch(conn, ctx);

        if !conn.rearm(Some(now_ms())) {
            return false;
        }
        if conn.parse_request() == RequestStatus::Busy {
            return true;
        }
    }
}

fn dispatch(conn: &mut Connection, ctx: &WorkerContext) {
    let span = info_span!(
        "request",
        client = %conn.request.client_addr,
        method = conn.request.method.as_str(),
        path = %conn.request.path,
    );
    let _enter = span.enter();
    let before = conn.bytes_sent;

    let mut io = ConnectionIo::new(conn);

    #[cfg(feature = "catch-panic")]
    {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.handler.handle(&mut io)));
        if let Err(payload) = result {
            error!("handler panicked: {}", panic_message(payload.as_ref()));
            io.disable_keepalive();
        }
    }
    #[cfg(not(feature = "catch-panic"))]
    ctx.handler.handle(&mut io);

    if !io.is_started() {
        if let Err(e) = io.send_error(500, Some("No response was produced")) {
            debug!("failed to send fallback response: {}", e);
        }
    }

    ctx.metrics.inc_req();
    ctx.metrics.add_bytes(conn.bytes_sent - before);
    debug!(status = conn.response.status, bytes = conn.response.sent, "request served");
}

#[cfg(feature = "catch-panic")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
