//! Accept/reject policy applied by backends at transport accept.

use std::{
    collections::HashSet,
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

/// Why a remote was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Full,
    Banned,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Full => write!(f, "server is full"),
            Rejection::Banned => write!(f, "address is banned"),
        }
    }
}

/// Slot accounting and ban list shared between a host and its backend.
///
/// A slot is taken when a backend admits a connection and released by the
/// host when that connection ends, so pending connections count against the
/// ceiling too.
#[derive(Debug)]
pub struct Admission {
    max_slots: usize,
    occupied: AtomicUsize,
    banned: RwLock<HashSet<IpAddr>>,
}

impl Admission {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            occupied: AtomicUsize::new(0),
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Takes a slot for `ip` or explains why not.
    pub fn try_admit(&self, ip: IpAddr) -> Result<(), Rejection> {
        if self.is_banned(ip) {
            return Err(Rejection::Banned);
        }
        self.take_slot()
    }

    /// Takes a slot without a remote, used for the host's own player.
    pub fn take_slot(&self) -> Result<(), Rejection> {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_slots).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Rejection::Full)
    }

    pub fn release(&self) {
        let _ = self
            .occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn ban(&self, ip: IpAddr) {
        self.banned
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ip);
    }

    pub fn unban(&self, ip: IpAddr) -> bool {
        self.banned
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&ip)
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&ip)
    }
}
