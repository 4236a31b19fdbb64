// src/reactor.rs
//! The per-thread readiness loop.
//!
//! A reactor owns a poller, the connections it accepted and a worker pool.
//! Each iteration polls, drains worker completions, accepts a bounded batch
//! of clients, then reads and parses every flagged connection. Complete
//! requests leave the poller and go to a worker; the worker hands the
//! connection back through the completion queue and wakes the reactor.

use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::config::{Config, Limits};
use crate::conn::{Connection, RequestStatus, now_ms};
use crate::error::{NocturneError, NocturneResult};
use crate::io::Handler;
use crate::metrics::Metrics;
use crate::poller::{EVENTS_CAPACITY, Event, Interest, LISTENER_KEY, Poller, Waker};
use crate::pool::ConnectionPool;
use crate::slab::{ConnectionSlab, SlotMut, Token};
use crate::syscalls;
use crate::worker::{Completion, Job, WORKERS_PER_REACTOR, WorkerPool};

/// Connections accepted per loop iteration.
pub const ACCEPT_BATCH: usize = 8;
/// Pause of the accept path after descriptor or memory exhaustion.
const ACCEPT_BACKOFF: i64 = 100;
/// Poll granularity while waiting for workers during shutdown.
const DRAIN_TICK: i64 = 100;

/// What the loop decided for an active connection.
enum Verdict {
    Wait(i64),
    Dispatch,
    Close { timed_out: bool },
}

pub(crate) struct Reactor<P: Poller> {
    id: usize,
    poller: P,
    listener: RawFd,
    slab: ConnectionSlab,
    pool: ConnectionPool,
    workers: WorkerPool,
    completions: Arc<SegQueue<Completion>>,
    limits: Limits,
    accept_batch: usize,
    stop_timeout: i64,
    accept_paused_until: Option<i64>,
    draining: bool,
    stopping: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    events: Vec<Event>,
    ready: Vec<Token>,
    closing: Vec<(Token, bool)>,
}

impl<P: Poller> Reactor<P> {
    /// Register the listener and start the worker pool. Runs on the
    /// caller's thread so setup failures reach `Daemon::start`.
    pub fn new(
        id: usize,
        mut poller: P,
        listener: RawFd,
        config: &Config,
        handler: Arc<dyn Handler>,
        stopping: Arc<AtomicBool>,
        metrics: Arc<Metrics>,
    ) -> NocturneResult<Self> {
        poller
            .register(listener, LISTENER_KEY, Interest::Accept)
            .map_err(NocturneError::Poller)?;

        let completions = Arc::new(SegQueue::new());
        let workers = WorkerPool::spawn(
            id,
            WORKERS_PER_REACTOR,
            handler,
            completions.clone(),
            poller.waker(),
            metrics.clone(),
        )?;

        Ok(Self {
            id,
            poller,
            listener,
            slab: ConnectionSlab::new(),
            pool: ConnectionPool::new(),
            workers,
            completions,
            limits: config.limits(),
            accept_batch: config.accept_batch.max(1),
            stop_timeout: config.stop_timeout as i64,
            accept_paused_until: None,
            draining: false,
            stopping,
            metrics,
            events: Vec::with_capacity(EVENTS_CAPACITY),
            ready: Vec::new(),
            closing: Vec::new(),
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.poller.waker()
    }

    pub fn run(mut self) {
        let span = info_span!("reactor", id = self.id);
        let _enter = span.enter();
        info!(workers = self.workers.len(), "reactor started");

        let mut timeout = None;
        loop {
            if let Err(e) = self.poller.wait(&mut self.events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("poll failed: {}", e);
                    break;
                }
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let now = now_ms();
            self.drain_completions();

            let mut accept_ready = false;
            let mut listener_closed = false;
            for i in 0..self.events.len() {
                let event = self.events[i];
                if event.key == LISTENER_KEY {
                    listener_closed |= event.hangup || event.error;
                    accept_ready |= event.readable;
                } else if let Some(conn) = self.slab.get_mut(Token::from_key(event.key)) {
                    conn.process = true;
                }
            }
            if listener_closed {
                info!("listener closed");
                break;
            }

            if self.accept_paused_until.is_some_and(|until| now >= until) {
                self.accept_paused_until = None;
                match self.poller.modify(self.listener, LISTENER_KEY, Some(Interest::Accept)) {
                    Ok(()) => accept_ready = true,
                    Err(e) => {
                        error!("failed to resume accepting: {}", e);
                        break;
                    }
                }
            }
            if accept_ready && self.accept_paused_until.is_none() && !self.accept(now) {
                break;
            }

            let now = now_ms();
            let mut next = self.process(now);
            if let Some(until) = self.accept_paused_until {
                next = Some(next.map_or(until, |at| at.min(until)));
            }
            timeout = next.map(|at| Duration::from_millis((at - now).max(0) as u64));
        }

        self.drain();
    }

    /// Accept up to one batch. Returns `false` once the listener is unusable.
    fn accept(&mut self, now: i64) -> bool {
        for _ in 0..self.accept_batch {
            match syscalls::accept(self.listener) {
                Ok((socket, peer)) => {
                    let fd = socket.as_raw_fd();
                    let mut conn = self.pool.acquire(socket, now, peer, self.limits);
                    // Try the first read without waiting for readiness
                    conn.process = true;
                    let token = self.slab.insert(conn);

                    if let Err(e) = self.poller.register(fd, token.key(), Interest::Read) {
                        warn!("failed to register connection: {}", e);
                        if let Some(conn) = self.slab.remove(token) {
                            self.pool.release(conn);
                        }
                        continue;
                    }
                    self.metrics.inc_conn();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::EBADF) | Some(libc::ENOTSOCK)) => {
                    debug!("listener is gone: {}", e);
                    return false;
                }
                Err(e) if syscalls::is_resource_exhaustion(&e) => {
                    warn!("accept failed, pausing for {}ms: {}", ACCEPT_BACKOFF, e);
                    if let Err(e) = self.poller.modify(self.listener, LISTENER_KEY, None) {
                        error!("failed to pause accepting: {}", e);
                        return false;
                    }
                    self.accept_paused_until = Some(now + ACCEPT_BACKOFF);
                    break;
                }
                Err(e) => debug!("accept failed: {}", e),
            }
        }
        true
    }

    /// Read and parse flagged connections, dispatch complete requests and
    /// close dead ones. Returns the earliest pending deadline.
    fn process(&mut self, now: i64) -> Option<i64> {
        let mut next: Option<i64> = None;
        let mut earliest = |at: i64| next = Some(next.map_or(at, |n: i64| n.min(at)));
        // Workers may pull an in-flight deadline in, so it is revisited at
        // least once per send timeout.
        let recheck = now + self.limits.send_timeout;

        for index in 0..self.slab.capacity() {
            let Some((token, slot)) = self.slab.slot_mut(index) else {
                continue;
            };
            match slot {
                SlotMut::InFlight { fd, deadline, shut } => {
                    if *shut {
                        continue;
                    }
                    if deadline.expired(now) {
                        debug!("in-flight connection timed out");
                        if let Err(e) = syscalls::shutdown(fd, Shutdown::Both) {
                            trace!("shutdown failed: {}", e);
                        }
                        *shut = true;
                        self.metrics.inc_timeout();
                    } else {
                        earliest(deadline.get().min(recheck));
                    }
                }
                SlotMut::Active(conn) => match Self::drive(conn, now) {
                    Verdict::Wait(at) => earliest(at),
                    Verdict::Dispatch => {
                        earliest(conn.deadline.get().min(recheck));
                        self.ready.push(token);
                    }
                    Verdict::Close { timed_out } => self.closing.push((token, timed_out)),
                },
            }
        }

        let ready = std::mem::take(&mut self.ready);
        for &token in &ready {
            self.dispatch(token);
        }
        self.ready = ready;
        self.ready.clear();

        let closing = std::mem::take(&mut self.closing);
        for &(token, timed_out) in &closing {
            if timed_out {
                self.metrics.inc_timeout();
            }
            self.park(token);
        }
        self.closing = closing;
        self.closing.clear();

        next
    }

    fn drive(conn: &mut Connection, now: i64) -> Verdict {
        if conn.process {
            conn.process = false;
            match conn.recv_available() {
                Ok(0) => return Verdict::Close { timed_out: false },
                Ok(n) => {
                    trace!(client = %conn.peer(), bytes = n, "received");
                    conn.deadline.extend(now + conn.limits.idle_timeout);
                    if conn.parse_request() == RequestStatus::Ready {
                        return Verdict::Dispatch;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(client = %conn.peer(), "receive failed: {}", e);
                    return Verdict::Close { timed_out: false };
                }
            }
        }

        if conn.deadline.expired(now) {
            debug!(client = %conn.peer(), "connection timed out");
            conn.shutdown(Shutdown::Both);
            Verdict::Close { timed_out: true }
        } else {
            Verdict::Wait(conn.deadline.get())
        }
    }

    /// Suspend polling and hand the connection to a worker.
    fn dispatch(&mut self, token: Token) {
        let Some(conn) = self.slab.get_mut(token) else {
            return;
        };
        let fd = conn.fd();
        if let Err(e) = self.poller.modify(fd, token.key(), None) {
            warn!("failed to suspend connection: {}", e);
            self.park(token);
            return;
        }
        let Some(conn) = self.slab.lend(token) else {
            return;
        };
        if let Err(Job { conn, .. }) = self.workers.submit(Job { token, conn }) {
            error!("no worker accepts jobs");
            if let Err(conn) = self.slab.restore(token, conn) {
                self.pool.release(conn);
                return;
            }
            self.park(token);
        }
    }

    /// Take connections back from the workers and re-arm or close them.
    fn drain_completions(&mut self) {
        while let Some(Completion { token, conn, keep }) = self.completions.pop() {
            let fd = conn.fd();
            if let Err(conn) = self.slab.restore(token, conn) {
                debug!("dropping stale completion");
                self.pool.release(conn);
                continue;
            }

            if !keep || self.draining {
                self.park(token);
                continue;
            }
            if let Some(conn) = self.slab.get_mut(token) {
                conn.process = true;
            }
            if let Err(e) = self.poller.modify(fd, token.key(), Some(Interest::Read)) {
                warn!("failed to re-arm connection: {}", e);
                self.park(token);
            }
        }
    }

    /// Remove an active connection, close its socket and recycle it.
    fn park(&mut self, token: Token) {
        let Some(conn) = self.slab.remove(token) else {
            return;
        };
        if let Err(e) = self.poller.deregister(conn.fd()) {
            trace!("deregister failed: {}", e);
        }
        self.metrics.dec_conn();
        self.pool.release(conn);
    }

    /// Close idle connections, give workers `stop_timeout` to finish and
    /// shut down whatever is still in flight.
    fn drain(mut self) {
        self.draining = true;
        if let Err(e) = self.poller.deregister(self.listener) {
            trace!("listener deregister failed: {}", e);
        }

        let mut active = Vec::new();
        for index in 0..self.slab.capacity() {
            if let Some((token, SlotMut::Active(_))) = self.slab.slot_mut(index) {
                active.push(token);
            }
        }
        for token in active {
            self.park(token);
        }

        let deadline = now_ms() + self.stop_timeout;
        loop {
            self.drain_completions();
            let now = now_ms();
            if self.slab.in_flight() == 0 || now >= deadline {
                break;
            }
            let tick = (deadline - now).min(DRAIN_TICK) as u64;
            if let Err(e) = self.poller.wait(&mut self.events, Some(Duration::from_millis(tick))) {
                trace!("poll failed while draining: {}", e);
            }
        }

        if self.slab.in_flight() > 0 {
            warn!(count = self.slab.in_flight(), "shutting down in-flight connections");
            for index in 0..self.slab.capacity() {
                if let Some((_, SlotMut::InFlight { fd, shut, .. })) = self.slab.slot_mut(index) {
                    if let Err(e) = syscalls::shutdown(fd, Shutdown::Both) {
                        trace!("shutdown failed: {}", e);
                    }
                    *shut = true;
                }
            }
        }

        self.workers.shutdown();
        self.drain_completions();
        info!("reactor stopped");
    }
}
