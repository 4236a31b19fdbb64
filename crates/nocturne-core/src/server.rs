// src/server.rs
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, trace, warn};

use crate::config::{Config, SocketType};
use crate::error::{NocturneError, NocturneResult};
use crate::io::Handler;
use crate::metrics::Metrics;
use crate::poller::{DefaultPoller, Waker};
use crate::reactor::Reactor;
use crate::syscalls;

/// Owns the listening sockets and the reactor threads.
///
/// `bind` opens the listeners, `start` spawns one reactor per configured
/// worker and `stop` (also run on drop) shuts everything down.
pub struct Daemon {
    config: Option<Config>,
    listeners: Vec<OwnedFd>,
    local_addr: Option<SocketAddr>,
    reactors: Vec<JoinHandle<()>>,
    wakers: Vec<Arc<Waker>>,
    started: bool,
    stopping: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            config: None,
            listeners: Vec::new(),
            local_addr: None,
            reactors: Vec::new(),
            wakers: Vec::new(),
            started: false,
            stopping: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Validate `config` and open its listeners. With port 0 every
    /// listener shares the port the kernel picked for the first one.
    pub fn bind(&mut self, config: Config) -> NocturneResult<()> {
        if self.config.is_some() {
            return Err(NocturneError::AlreadyBound);
        }
        if self.stopping.load(Ordering::Acquire) {
            return Err(NocturneError::AlreadyStarted);
        }
        config.validate()?;

        let count = config.listener_count();
        let mut port = config.port;
        let mut listeners = Vec::with_capacity(count);
        for _ in 0..count {
            let listener = syscalls::create_listener(&config, port).map_err(|source| NocturneError::Bind {
                addr: describe(&config, port),
                source,
            })?;
            if port == 0 {
                if let Some(addr) = syscalls::local_addr(listener.as_raw_fd())? {
                    port = addr.port();
                }
            }
            listeners.push(listener);
        }

        self.local_addr = match listeners.first() {
            Some(listener) => syscalls::local_addr(listener.as_raw_fd())?,
            None => None,
        };
        info!(listeners = count, addr = %describe(&config, port), "daemon bound");

        self.listeners = listeners;
        self.config = Some(config);
        Ok(())
    }

    /// The bound TCP address, `None` for Unix sockets or before `bind`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopping.load(Ordering::Acquire)
    }

    /// Spawn the reactors. Listener `i % N` feeds reactor `i`.
    pub fn start<H: Handler>(&mut self, handler: H) -> NocturneResult<()> {
        let config = self.config.as_ref().ok_or(NocturneError::NotBound)?;
        if self.started {
            return Err(NocturneError::AlreadyStarted);
        }

        let handler: Arc<dyn Handler> = Arc::new(handler);
        let core_ids = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        // Pollers and worker pools come up first so that failures leave
        // nothing running.
        let mut reactors = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let listener = self.listeners[i % self.listeners.len()].as_raw_fd();
            let poller = DefaultPoller::new().map_err(NocturneError::Poller)?;
            reactors.push(Reactor::new(
                i,
                poller,
                listener,
                config,
                handler.clone(),
                self.stopping.clone(),
                self.metrics.clone(),
            )?);
        }

        self.started = true;
        for (i, reactor) in reactors.into_iter().enumerate() {
            self.wakers.push(reactor.waker());
            let core = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let spawned = thread::Builder::new()
                .name(format!("nocturne-reactor-{}", i))
                .spawn(move || {
                    if let Some(id) = core {
                        if !core_affinity::set_for_current(id) {
                            warn!("failed to pin reactor {} to CPU {}", i, id.id);
                        }
                    }
                    reactor.run();
                });
            match spawned {
                Ok(handle) => self.reactors.push(handle),
                Err(e) => {
                    error!("failed to spawn reactor {}: {}", i, e);
                    self.stop();
                    return Err(e.into());
                }
            }
        }

        info!(reactors = self.reactors.len(), pinned = !core_ids.is_empty(), "daemon started");
        Ok(())
    }

    /// Stop accepting, drain the reactors and close the listeners.
    /// Blocks until every reactor and worker thread has exited.
    pub fn stop(&mut self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        for listener in &self.listeners {
            if let Err(e) = syscalls::shutdown(listener.as_raw_fd(), Shutdown::Both) {
                trace!("listener shutdown failed: {}", e);
            }
        }
        // Shutting a listener down does not interrupt kevent everywhere
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                warn!("failed to wake reactor: {}", e);
            }
        }

        let running = !self.reactors.is_empty();
        for handle in self.reactors.drain(..) {
            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }
        self.wakers.clear();
        self.listeners.clear();

        if let Some(config) = self.config.take() {
            if config.sock_type == SocketType::Unix {
                if let Some(path) = &config.unix_path {
                    if let Err(e) = std::fs::remove_file(path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!("failed to remove {}: {}", path, e);
                        }
                    }
                }
            }
        }
        if running {
            info!("daemon stopped");
        }
    }

    /// Block until SIGINT or SIGTERM, then stop.
    pub fn wait_for_signal(&mut self) -> NocturneResult<()> {
        let (tx, rx) = mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .map_err(io::Error::other)?;

        if rx.recv().is_ok() {
            info!("received shutdown signal");
        }
        self.stop();
        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn describe(config: &Config, port: u16) -> String {
    match config.sock_type {
        SocketType::Unix => config.unix_path.clone().unwrap_or_default(),
        _ => format!("{}:{}", config.bind_addr.as_deref().unwrap_or("*"), port),
    }
}
