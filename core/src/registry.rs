//! Global, process-wide datatype and filter registries.
//!
//! Both registries are append-only after start-up: the reference
//! implementation treats registration as happening once from a fixed list of
//! built-ins plus whatever a host program adds before the first network is
//! built, and a duplicate name is a fatal configuration mistake rather than
//! a runtime condition a caller can recover from.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use once_cell::sync::Lazy;

use crate::error::FlowError;
use crate::packet::Data;

/// A registered packet kind: a unique name, a factory producing a fresh,
/// uninitialized packet of that kind, and the gathered (run-length) binary
/// codec for sequences of packets of that kind.
///
/// `Datatype` values are handed out as `Arc<Datatype>` and compared by
/// pointer identity (`Arc::ptr_eq`), matching the reference implementation's
/// "pointer-equal to the registry entry" contract for `Data::datatype()`.
pub struct Datatype {
    /// The registered name, e.g. `"flow-vector-f32"`.
    pub name: String,
    factory: Box<dyn Fn() -> Box<dyn Data> + Send + Sync>,
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datatype").field("name", &self.name).finish()
    }
}

impl Datatype {
    /// Internal constructor used for types (like the sentinel tag) that are
    /// never placed in a [`Registry`] under a name.
    pub(crate) fn new_internal(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Data> + Send + Sync + 'static,
    ) -> Self {
        Datatype { name: name.into(), factory: Box::new(factory) }
    }

    /// Produces a fresh, uninitialized packet of this kind.
    pub fn make(&self) -> Box<dyn Data> {
        (self.factory)()
    }

    /// Reads and returns one packet of this datatype, asserting (per
    /// `read_data`'s contract) that the caller already knows the datatype
    /// matches; the packet itself is read via [`Data::read`].
    pub fn read_data(&self, input: &mut dyn io::Read) -> io::Result<Box<dyn Data>> {
        let mut packet = self.make();
        packet.read(input)?;
        Ok(packet)
    }

    /// Writes one packet, which must be of this datatype.
    pub fn write_data(&self, packet: &dyn Data, output: &mut dyn io::Write) -> io::Result<()> {
        packet.write(output)
    }

    /// Reads a gathered run: a `u32` count followed by that many
    /// individually-coded packets of this datatype.
    pub fn read_gathered(&self, input: &mut dyn io::Read) -> io::Result<Vec<Box<dyn Data>>> {
        let count = input.read_u32::<BigEndian>()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.read_data(input)?);
        }
        Ok(out)
    }

    /// Writes a gathered run: a `u32` count followed by each packet's codec,
    /// in order.
    pub fn write_gathered(&self, packets: &[Box<dyn Data>], output: &mut dyn io::Write) -> io::Result<()> {
        output.write_u32::<BigEndian>(packets.len() as u32)?;
        for packet in packets {
            self.write_data(packet.as_ref(), output)?;
        }
        Ok(())
    }
}

/// Constructs a fresh, shared handle to a concrete [`crate::node::Node`];
/// registered under a filter name.
///
/// Returns [`crate::node::NodeHandle`] rather than `Box<dyn Node>`: a boxed
/// trait object has no `Sized` content left to move into a `RefCell`, so the
/// factory itself must do the `Rc::new(RefCell::new(..))` wrapping while the
/// concrete type is still in scope.
pub type NodeFactory = Box<dyn Fn() -> crate::node::NodeHandle + Send + Sync>;

/// The process-wide datatype and filter registry.
///
/// A single process-wide instance is reached through the free functions in
/// this module; building a private instance (e.g. for an isolated test) is
/// also supported via [`Registry::new`].
#[derive(Default)]
pub struct Registry {
    datatypes: HashMap<String, Arc<Datatype>>,
    filters: HashMap<String, Arc<NodeFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a datatype factory under `name`. Fatal (returns an error
    /// the caller is expected to treat as unrecoverable) on a duplicate name.
    pub fn register_datatype(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Data> + Send + Sync + 'static,
    ) -> Result<(), FlowError> {
        let name = name.into();
        if self.datatypes.contains_key(&name) {
            return Err(FlowError::DuplicateRegistration { kind: "datatype", name });
        }
        self.datatypes.insert(name.clone(), Arc::new(Datatype::new_internal(name, factory)));
        Ok(())
    }

    /// Looks up a registered datatype by name.
    pub fn get_datatype(&self, name: &str) -> Option<Arc<Datatype>> {
        self.datatypes.get(name).cloned()
    }

    /// Registers a node factory under a filter name. Fatal on a duplicate
    /// name.
    pub fn register_filter(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> crate::node::NodeHandle + Send + Sync + 'static,
    ) -> Result<(), FlowError> {
        let name = name.into();
        if self.filters.contains_key(&name) {
            return Err(FlowError::DuplicateRegistration { kind: "filter", name });
        }
        self.filters.insert(name, Arc::new(Box::new(factory)));
        Ok(())
    }

    /// Looks up a registered filter factory by name.
    pub fn get_filter(&self, name: &str) -> Option<Arc<NodeFactory>> {
        self.filters.get(name).cloned()
    }
}

static GLOBAL: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::new()));

/// Registers a datatype in the process-wide registry.
pub fn register_datatype(
    name: impl Into<String>,
    factory: impl Fn() -> Box<dyn Data> + Send + Sync + 'static,
) -> Result<(), FlowError> {
    GLOBAL.write().unwrap().register_datatype(name, factory)
}

/// Looks up a datatype in the process-wide registry.
pub fn get_datatype(name: &str) -> Option<Arc<Datatype>> {
    GLOBAL.read().unwrap().get_datatype(name)
}

/// Registers a filter in the process-wide registry.
pub fn register_filter(
    name: impl Into<String>,
    factory: impl Fn() -> crate::node::NodeHandle + Send + Sync + 'static,
) -> Result<(), FlowError> {
    GLOBAL.write().unwrap().register_filter(name, factory)
}

/// Looks up a filter in the process-wide registry.
pub fn get_filter(name: &str) -> Option<Arc<NodeFactory>> {
    GLOBAL.read().unwrap().get_filter(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug)]
    struct Dummy;

    impl Data for Dummy {
        fn datatype(&self) -> &Arc<Datatype> {
            unimplemented!("not needed by these tests")
        }
        fn clone_box(&self) -> Box<dyn Data> {
            Box::new(Dummy)
        }
        fn read(&mut self, _input: &mut dyn io::Read) -> io::Result<()> {
            Ok(())
        }
        fn write(&self, _output: &mut dyn io::Write) -> io::Result<()> {
            Ok(())
        }
        fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
            write!(out, "<dummy/>")
        }
        fn equals(&self, _other: &dyn Data) -> bool {
            false
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn duplicate_datatype_registration_is_rejected() {
        let mut reg = Registry::new();
        reg.register_datatype("foo", || Box::new(Dummy)).unwrap();
        let err = reg.register_datatype("foo", || Box::new(Dummy)).unwrap_err();
        match err {
            FlowError::DuplicateRegistration { kind, name } => {
                assert_eq!(kind, "datatype");
                assert_eq!(name, "foo");
            }
            other => panic!("expected DuplicateRegistration, got {other:?}"),
        }
    }

    #[test]
    fn lookup_returns_pointer_stable_entry() {
        let mut reg = Registry::new();
        reg.register_datatype("foo", || Box::new(Dummy)).unwrap();
        let a = reg.get_datatype("foo").unwrap();
        let b = reg.get_datatype("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn duplicate_filter_registration_is_rejected() {
        use crate::nodes::PassThroughNode;
        use std::cell::RefCell;
        use std::rc::Rc;
        let mut reg = Registry::new();
        reg.register_filter("pass", || Rc::new(RefCell::new(PassThroughNode::new()))).unwrap();
        let err = reg.register_filter("pass", || Rc::new(RefCell::new(PassThroughNode::new()))).unwrap_err();
        match err {
            FlowError::DuplicateRegistration { kind, .. } => assert_eq!(kind, "filter"),
            other => panic!("expected DuplicateRegistration, got {other:?}"),
        }
    }
}
