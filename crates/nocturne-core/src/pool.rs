use std::os::fd::OwnedFd;

use arrayvec::ArrayVec;
use rand::Rng;

use crate::config::Limits;
use crate::conn::Connection;

/// Maximum number of idle connections kept for reuse per reactor.
pub const POOL_CAPACITY: usize = 64;

/// Free-list of recycled connections. Entries are taken at random so that
/// buffer sizes do not settle into a fixed reuse order.
#[derive(Default)]
pub struct ConnectionPool {
    free: ArrayVec<Box<Connection>, POOL_CAPACITY>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, socket: OwnedFd, start: i64, peer: String, limits: Limits) -> Box<Connection> {
        let mut conn = if self.free.is_empty() {
            Box::new(Connection::new())
        } else {
            let idx = rand::thread_rng().gen_range(0..self.free.len());
            self.free.swap_remove(idx)
        };
        conn.init(socket, start, peer, limits);
        conn
    }

    /// Close the socket and keep the object if there is room.
    pub fn release(&mut self, mut conn: Box<Connection>) {
        conn.clear();
        // Dropped when the pool is full
        let _ = self.free.try_push(conn);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}
