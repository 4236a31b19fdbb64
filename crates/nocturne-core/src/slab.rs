// src/slab.rs
use std::os::fd::RawFd;

use crate::conn::{Connection, Deadline};

const GENERATION_MASK: u32 = 0x7FFF_FFFF;

/// Generation-checked handle to an arena slot.
///
/// A token outlives the connection it named; once the slot is recycled
/// the generation no longer matches and lookups fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    /// Poller key. Generations are 31-bit so keys never reach the
    /// reserved listener and waker keys.
    pub fn key(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_key(key: u64) -> Self {
        Self {
            index: key as u32,
            generation: (key >> 32) as u32 & GENERATION_MASK,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

enum Slot {
    Vacant { next: Option<u32> },
    Active(Box<Connection>),
    /// Owned by a worker; the reactor keeps what it needs to enforce the deadline.
    InFlight { fd: RawFd, deadline: Deadline, shut: bool },
}

struct Entry {
    generation: u32,
    slot: Slot,
}

pub enum SlotMut<'a> {
    Active(&'a mut Connection),
    InFlight {
        fd: RawFd,
        deadline: &'a Deadline,
        shut: &'a mut bool,
    },
}

#[derive(Default)]
pub struct ConnectionSlab {
    entries: Vec<Entry>,
    head_free: Option<u32>,
    active_count: usize,
    in_flight: usize,
}

impl ConnectionSlab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Box<Connection>) -> Token {
        self.active_count += 1;

        if let Some(index) = self.head_free {
            let entry = &mut self.entries[index as usize];
            if let Slot::Vacant { next } = entry.slot {
                self.head_free = next;
            }
            entry.slot = Slot::Active(conn);
            return Token {
                index,
                generation: entry.generation,
            };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Active(conn),
        });
        Token { index, generation: 0 }
    }

    fn entry(&self, token: Token) -> Option<&Entry> {
        self.entries
            .get(token.index())
            .filter(|e| e.generation == token.generation)
    }

    fn entry_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.entries
            .get_mut(token.index())
            .filter(|e| e.generation == token.generation)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entry(token).is_some_and(|e| !matches!(e.slot, Slot::Vacant { .. }))
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        match &mut self.entry_mut(token)?.slot {
            Slot::Active(conn) => Some(&mut **conn),
            _ => None,
        }
    }

    /// Hand the connection to a worker. The slot stays reserved.
    pub fn lend(&mut self, token: Token) -> Option<Box<Connection>> {
        let entry = self.entry_mut(token)?;
        let (fd, deadline) = match &entry.slot {
            Slot::Active(conn) => (conn.fd(), conn.deadline.clone()),
            _ => return None,
        };
        let slot = std::mem::replace(&mut entry.slot, Slot::InFlight { fd, deadline, shut: false });
        self.in_flight += 1;
        match slot {
            Slot::Active(conn) => Some(conn),
            _ => None,
        }
    }

    /// Take back a lent connection. Fails if the token is stale.
    pub fn restore(&mut self, token: Token, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        let Some(entry) = self.entry_mut(token) else {
            return Err(conn);
        };
        if !matches!(entry.slot, Slot::InFlight { .. }) {
            return Err(conn);
        }
        entry.slot = Slot::Active(conn);
        self.in_flight -= 1;
        Ok(())
    }

    /// Release the slot of an active connection.
    pub fn remove(&mut self, token: Token) -> Option<Box<Connection>> {
        let head_free = self.head_free;
        let entry = self.entry_mut(token)?;
        if !matches!(entry.slot, Slot::Active(_)) {
            return None;
        }
        let slot = std::mem::replace(&mut entry.slot, Slot::Vacant { next: head_free });
        entry.generation = (entry.generation + 1) & GENERATION_MASK;
        self.head_free = Some(token.index);
        self.active_count -= 1;
        match slot {
            Slot::Active(conn) => Some(conn),
            _ => None,
        }
    }

    /// Visit slot `index` if it is occupied.
    pub fn slot_mut(&mut self, index: usize) -> Option<(Token, SlotMut<'_>)> {
        let entry = self.entries.get_mut(index)?;
        let token = Token {
            index: index as u32,
            generation: entry.generation,
        };
        match &mut entry.slot {
            Slot::Vacant { .. } => None,
            Slot::Active(conn) => Some((token, SlotMut::Active(&mut **conn))),
            Slot::InFlight { fd, deadline, shut } => Some((
                token,
                SlotMut::InFlight {
                    fd: *fd,
                    deadline: &*deadline,
                    shut,
                },
            )),
        }
    }

    /// Connections either polled or lent out.
    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
