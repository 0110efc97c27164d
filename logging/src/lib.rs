//! Typed, buffered event logging shared by every layer of the cadence runtime.
//!
//! The registry binds string names to typed [`Logger`] instances. A component that wants
//! to log (a node during `configure`, the network parser, a cache writer) looks up its
//! logger by name once and then logs freely; nothing downstream of the lookup allocates
//! unless the buffer is full.
//!
//! This mirrors the pull-based nature of the rest of the runtime: logging is a side
//! channel that the driver can attach a sink to, or leave unbound (in which case `log`
//! calls against a missing logger are simply not made, since `get` returns `None`).

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A map from names to typed loggers, plus the shared clock all of them stamp events with.
pub struct Registry {
    time: Instant,
    map: HashMap<String, Box<dyn Any>>,
}

impl Registry {
    /// Creates a new registry with its own start-of-time instant.
    pub fn new(time: Instant) -> Self {
        Registry { time, map: HashMap::new() }
    }

    /// Binds `name` to a new logger that hands batches of events to `action`.
    ///
    /// Returns any logger previously bound to the name. Existing [`Logger`] handles keep
    /// writing to their original destination; only lookups made after this call observe
    /// the new one.
    pub fn insert<T: 'static>(
        &mut self,
        name: impl Into<String>,
        action: Box<dyn Fn(&Duration, &[(Duration, T)])>,
    ) -> Option<Box<dyn Any>> {
        let logger = Logger::<T>::new(self.time, action);
        self.map.insert(name.into(), Box::new(logger))
    }

    /// Removes and returns a previously bound logger, closing its stream.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name)
    }

    /// Retrieves a clone of a bound logger, if `name` is bound and the types match.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map.get(name).and_then(|entry| entry.downcast_ref::<Logger<T>>()).cloned()
    }
}

/// A cheaply-cloned handle to a buffered event stream of type `T`.
pub struct Logger<T> {
    time: Instant,
    action: Rc<dyn Fn(&Duration, &[(Duration, T)])>,
    buffer: Rc<RefCell<Vec<(Duration, T)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger { time: self.time, action: self.action.clone(), buffer: self.buffer.clone() }
    }
}

impl<T> Logger<T> {
    /// Allocates a logger bound to a sink `action`, buffering up to 1024 events at a time.
    pub fn new(time: Instant, action: Box<dyn Fn(&Duration, &[(Duration, T)])>) -> Self {
        Logger { time, action: action.into(), buffer: Rc::new(RefCell::new(Vec::with_capacity(1024))) }
    }

    /// Records `event`, stamped with the time elapsed since the registry was created.
    ///
    /// Flushes automatically once the buffer reaches capacity.
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Forces a flush of any buffered events.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        (self.action)(&self.time.elapsed(), &buffer[..]);
        buffer.clear();
    }
}

/// Events produced by the node lifecycle, shared across the runtime's `configure` and
/// `work` paths so a single log sink can reconstruct a timeline of graph activity.
pub mod events {
    /// A `configure` or `work` lifecycle event on a named node.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum NodeEvent {
        /// `configure` was entered for the named node.
        ConfigureStart { node: String },
        /// `configure` completed; `success` mirrors its boolean return.
        ConfigureStop { node: String, success: bool },
        /// `work` was called for the named node and output port index.
        WorkStart { node: String, port: usize },
        /// `work` returned; `produced` is the number of packets emitted during the call.
        WorkStop { node: String, port: usize, produced: usize },
        /// A non-fatal condition was logged and execution continued (a `SoftWarning`).
        Warning { node: String, message: String },
        /// A configuration error was recorded against the node (a `ConfigurationError`).
        ConfigurationError { node: String, message: String },
        /// The end-of-stream sentinel was forwarded on the named node's port.
        Eos { node: String, port: usize },
        /// The out-of-data (transient stall) sentinel was forwarded on the named node's port.
        Ood { node: String, port: usize },
    }
}
