//! Seam to the external event loop that owns all socket subscriptions.
//!
//! The pool core never polls sockets itself; a query awaiter registers the
//! connection's descriptor with the loop and reacts to readiness callbacks.
//! All subscription mutation happens on the loop thread; off-thread callers
//! defer through [`EventLoop::schedule`].

use std::sync::Arc;

use crate::wire::SocketFd;

/// Readiness interest bit-set (`READ | WRITE | PERSIST`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b010);
    pub const PERSIST: Interest = Interest(0b100);

    #[must_use]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Receiver of readiness callbacks, invoked on the loop thread.
pub trait ReadinessHandler: Send + Sync {
    fn ready(&self, readable: bool, writable: bool);
}

/// A live socket subscription. Dropping it does not unregister; the owner
/// calls [`unregister`](Self::unregister) explicitly so teardown stays on the
/// loop thread.
pub trait Registration: Send {
    /// Replace the subscription's interest set.
    fn rearm(&self, interest: Interest);

    /// Re-point the subscription at a different descriptor, keeping the
    /// handler (used when the wire library swaps sockets mid-connect).
    fn change_fd(&self, fd: SocketFd);

    fn unregister(&self);
}

/// The external event loop.
pub trait EventLoop: Send + Sync {
    fn register(
        &self,
        fd: SocketFd,
        interest: Interest,
        handler: Arc<dyn ReadinessHandler>,
    ) -> Box<dyn Registration>;

    /// Run a closure on the loop thread.
    fn schedule(&self, f: Box<dyn FnOnce() + Send>);

    fn is_loop_thread(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bit_ops() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.contains(Interest::WRITE));
        assert!(!rw.contains(Interest::PERSIST));
        assert!((rw | Interest::PERSIST).contains(Interest::PERSIST));
    }
}
