//! Typed channels between two port endpoints.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::attributes::Attributes;
use crate::packet::{is_any_sentinel, PacketRef};
use crate::registry::Datatype;

/// Which synchronization discipline a [`Link`] uses.
///
/// Chosen once, at the link's `configure` time, from whether its producing
/// node declared itself `threaded`. `Fast` links never block: a `get` with
/// nothing buffered returns `None` so the caller can pull the upstream node's
/// `work` and retry. `Queued` links block a `get` until a producer (on
/// another scheduling context) calls `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Single scheduling context; non-blocking.
    Fast,
    /// Threaded producer; `get` blocks on a condition variable.
    Queued,
}

/// A directed, typed edge carrying packets from one output port to one
/// input port.
///
/// Both link modes share one FIFO guarded by a mutex; `Fast` and `Queued`
/// differ only in whether [`Link::get`] blocks when the queue is empty. This
/// collapses the reference implementation's two separate representations
/// (a one-slot-plus-overflow structure for the fast case, a dedicated
/// mutex/condvar queue for the threaded case) into one, since both must
/// already satisfy "exactly one of slot/queue holds the next packet" and
/// FIFO delivery; see `DESIGN.md`.
pub struct Link {
    mode: LinkMode,
    /// `None` until either constructed with a known datatype or until the
    /// first non-sentinel packet locks one in; see [`Link::new_unresolved`].
    datatype: RefCell<Option<Arc<Datatype>>>,
    queue: Mutex<VecDeque<PacketRef>>,
    condvar: Condvar,
    attributes: RefCell<Option<Attributes>>,
    /// Requested buffering hint from `<link buffer="N"/>`; informational
    /// only, the queue itself is unbounded.
    pub buffer_hint: usize,
}

impl Link {
    /// Creates a link of datatype `datatype` in the given mode.
    pub fn new(datatype: Arc<Datatype>, mode: LinkMode, buffer_hint: usize) -> Self {
        Link {
            mode,
            datatype: RefCell::new(Some(datatype)),
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            attributes: RefCell::new(None),
            buffer_hint,
        }
    }

    /// Creates a link whose datatype is not yet known, locked in from the
    /// first non-sentinel packet it carries.
    ///
    /// Used by the network assembler: a `.flow` file wires links before any
    /// node's `configure` has run, so at construction time nothing has yet
    /// negotiated what will actually flow through them — unlike hand-built
    /// topologies, which always know their link types up front.
    pub fn new_unresolved(mode: LinkMode, buffer_hint: usize) -> Self {
        Link {
            mode,
            datatype: RefCell::new(None),
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            attributes: RefCell::new(None),
            buffer_hint,
        }
    }

    /// This link's datatype, if known yet.
    pub fn datatype(&self) -> Option<Arc<Datatype>> {
        self.datatype.borrow().clone()
    }

    /// Enqueues `packet`. The first non-sentinel packet on an
    /// unresolved link locks in its datatype; every later packet is
    /// asserted against whatever datatype is now locked in, or is a
    /// sentinel — a violation aborts the process, matching the reference
    /// implementation's invariant that a wrong-type packet on a link is a
    /// structural bug, not a recoverable error.
    pub fn put(&self, packet: PacketRef) {
        if !is_any_sentinel(&packet) {
            let mut slot = self.datatype.borrow_mut();
            match &*slot {
                Some(dt) if !Arc::ptr_eq(packet.datatype(), dt) => {
                    crate::abort_invariant!(
                        "packet of datatype '{}' put on link of datatype '{}'",
                        packet.datatype().name,
                        dt.name
                    );
                }
                Some(_) => {}
                None => *slot = Some(Arc::clone(packet.datatype())),
            }
        }
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(packet);
        if self.mode == LinkMode::Queued {
            self.condvar.notify_one();
        }
    }

    /// Removes and returns the next packet. `Fast` links return `None`
    /// immediately when empty; `Queued` links block until one arrives.
    pub fn get(&self) -> Option<PacketRef> {
        match self.mode {
            LinkMode::Fast => self.queue.lock().unwrap().pop_front(),
            LinkMode::Queued => {
                let mut queue = self.queue.lock().unwrap();
                while queue.is_empty() {
                    queue = self.condvar.wait(queue).unwrap();
                }
                queue.pop_front()
            }
        }
    }

    /// Non-blocking peek: true if `get` would return data without pulling
    /// an upstream `work`.
    pub fn is_data_available(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Drops all buffered packets, used when a reconfiguration invalidates
    /// whatever was in flight.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    /// This link's cached attributes, if `configure` has run and they have
    /// not since been erased.
    pub fn attributes(&self) -> Option<Attributes> {
        self.attributes.borrow().clone()
    }

    /// Sets this link's attributes and clears any buffered data (a
    /// reconfiguration discards stale packets downstream of it).
    pub fn set_attributes(&self, attrs: Attributes) {
        *self.attributes.borrow_mut() = Some(attrs);
        self.clear();
    }

    /// Invalidates this link's cached attributes, forcing the next
    /// `get_input_attributes` to re-run upstream `configure`.
    pub fn erase_attributes(&self) {
        *self.attributes.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{eos, sentinel};

    fn test_datatype() -> Arc<Datatype> {
        Arc::new(Datatype::new_internal("test", || unreachable!()))
    }

    #[test]
    fn fast_link_get_empty_returns_none() {
        let link = Link::new(test_datatype(), LinkMode::Fast, 0);
        assert!(!link.is_data_available());
        assert!(link.get().is_none());
    }

    #[test]
    fn preserves_fifo_order() {
        let link = Link::new(test_datatype(), LinkMode::Fast, 0);
        link.put(eos());
        link.put(sentinel());
        assert!(crate::packet::is_eos(&link.get().unwrap()));
        assert!(crate::packet::is_sentinel(&link.get().unwrap()));
    }

    #[test]
    fn clear_drops_buffered_packets() {
        let link = Link::new(test_datatype(), LinkMode::Fast, 0);
        link.put(eos());
        link.clear();
        assert!(link.get().is_none());
    }

    #[test]
    fn set_attributes_clears_buffer() {
        let link = Link::new(test_datatype(), LinkMode::Fast, 0);
        link.put(eos());
        link.set_attributes(Attributes::new());
        assert!(link.get().is_none());
        assert!(link.attributes().is_some());
    }
}
