//! Node, port, and pull-scheduling machinery.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::attributes::Attributes;
use crate::error::ErrorLog;
use crate::link::{Link, LinkMode};
use crate::packet::{eos, is_any_sentinel, ood, Data, PacketRef, Ref};
use crate::param_expr::ParamTable;
use crate::registry::Datatype;

/// Index of a port within a node, stable once the node's ports are sealed.
pub type PortId = usize;

/// A shared handle to a node, as stored by the owning [`crate::network::Network`]
/// and referenced from the producer/consumer side of a [`Link`].
pub type NodeHandle = Rc<RefCell<dyn Node>>;

struct InputPort {
    name: String,
    link: Option<Rc<Link>>,
    producer: Option<(NodeHandle, PortId)>,
}

struct OutgoingLink {
    link: Rc<Link>,
    consumer: Option<(NodeHandle, PortId)>,
}

struct OutputPort {
    name: String,
    links: Vec<OutgoingLink>,
}

/// Shared state and bookkeeping every concrete node embeds.
///
/// Ports are an append-only vector keyed by [`PortId`]; once any output has
/// had `work` called on it, the port vectors are sealed and further
/// `add_input_port`/`add_output_port` calls abort.
pub struct AbstractNode {
    name: String,
    inputs: RefCell<Vec<InputPort>>,
    outputs: RefCell<Vec<OutputPort>>,
    sealed: Cell<bool>,
    threaded: bool,
    errors: RefCell<ErrorLog>,
    /// Parameter-expression table (`$(name)` / `$input(port)` resolution).
    pub params: RefCell<ParamTable>,
    logger: Option<cadence_logging::Logger<cadence_logging::events::NodeEvent>>,
}

impl fmt::Debug for AbstractNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbstractNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs.borrow().len())
            .field("outputs", &self.outputs.borrow().len())
            .finish()
    }
}

impl AbstractNode {
    /// Builds an empty node shell named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        AbstractNode {
            name: name.into(),
            inputs: RefCell::new(Vec::new()),
            outputs: RefCell::new(Vec::new()),
            sealed: Cell::new(false),
            threaded: false,
            errors: RefCell::new(ErrorLog::new()),
            params: RefCell::new(ParamTable::new()),
            logger: None,
        }
    }

    /// This node's name, as declared in the network description.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds the structured-event logger this node reports lifecycle events
    /// through.
    pub fn set_logger(&mut self, logger: cadence_logging::Logger<cadence_logging::events::NodeEvent>) {
        self.logger = Some(logger);
    }

    fn log(&self, event: cadence_logging::events::NodeEvent) {
        if let Some(logger) = &self.logger {
            logger.log(event);
        }
    }

    /// Marks this node as threaded: every outgoing link added after this
    /// call uses [`LinkMode::Queued`].
    pub fn set_threaded(&mut self, threaded: bool) {
        self.threaded = threaded;
    }

    /// Whether this node declared itself threaded.
    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    /// Appends a new input port, returning its [`PortId`]. Aborts if ports
    /// have been sealed by a prior `work` call.
    pub fn add_input_port(&self, name: impl Into<String>) -> PortId {
        assert!(!self.sealed.get(), "cannot add ports to node '{}' after work() has run", self.name);
        let mut inputs = self.inputs.borrow_mut();
        inputs.push(InputPort { name: name.into(), link: None, producer: None });
        inputs.len() - 1
    }

    /// Appends a new output port, returning its [`PortId`].
    pub fn add_output_port(&self, name: impl Into<String>) -> PortId {
        assert!(!self.sealed.get(), "cannot add ports to node '{}' after work() has run", self.name);
        let mut outputs = self.outputs.borrow_mut();
        outputs.push(OutputPort { name: name.into(), links: Vec::new() });
        outputs.len() - 1
    }

    /// Resolves a port name to its [`PortId`].
    pub fn name_to_input_port(&self, name: &str) -> Option<PortId> {
        self.inputs.borrow().iter().position(|p| p.name == name)
    }

    /// Resolves a port name to its [`PortId`].
    pub fn name_to_output_port(&self, name: &str) -> Option<PortId> {
        self.outputs.borrow().iter().position(|p| p.name == name)
    }

    /// Whether `in_port` has a producer attached by the network assembler.
    pub fn input_connected(&self, in_port: PortId) -> bool {
        self.inputs.borrow()[in_port].link.is_some()
    }

    /// Whether `out_port` has at least one outgoing link attached.
    pub fn output_connected(&self, out_port: PortId) -> bool {
        !self.outputs.borrow()[out_port].links.is_empty()
    }

    /// Number of input ports.
    pub fn n_inputs(&self) -> usize {
        self.inputs.borrow().len()
    }

    /// Number of output ports.
    pub fn n_outputs(&self) -> usize {
        self.outputs.borrow().len()
    }

    /// Attaches the input side of a link already created by the network
    /// assembler.
    pub fn attach_input(&self, in_port: PortId, link: Rc<Link>, producer: NodeHandle, producer_port: PortId) {
        let mut inputs = self.inputs.borrow_mut();
        inputs[in_port].link = Some(link);
        inputs[in_port].producer = Some((producer, producer_port));
    }

    /// Attaches the output side of a link already created by the network
    /// assembler.
    pub fn attach_output(&self, out_port: PortId, link: Rc<Link>, consumer: Option<(NodeHandle, PortId)>) {
        self.outputs.borrow_mut()[out_port].links.push(OutgoingLink { link, consumer });
    }

    /// The mode new outgoing links from this node should use.
    pub fn link_mode(&self) -> LinkMode {
        if self.threaded {
            LinkMode::Queued
        } else {
            LinkMode::Fast
        }
    }

    /// Pulls a typed packet from `in_port`. Seals the node's ports as a
    /// side effect, the same way an output `work` call does: by this point
    /// the graph around this node is considered fixed.
    pub fn get_data<T: Data + Clone + 'static>(&self, in_port: PortId) -> Ref<T> {
        Ref::downcast(self.get_data_raw(in_port))
    }

    /// Pulls the next packet from `in_port` without downcasting it — the
    /// base-level primitive `get_data<T>` wraps with a typed [`Ref`], for
    /// nodes (a generic pass-through, a dumper) that forward packets
    /// without caring what they carry.
    pub fn get_data_raw(&self, in_port: PortId) -> PacketRef {
        self.sealed.set(true);
        let (link, producer) = {
            let inputs = self.inputs.borrow();
            let input = &inputs[in_port];
            (input.link.clone(), input.producer.clone())
        };
        let Some(link) = link else {
            return crate::packet::sentinel();
        };
        if let Some(packet) = link.get() {
            return packet;
        }
        if let Some((producer, producer_port)) = producer {
            if producer.borrow_mut().work(producer_port) {
                if let Some(packet) = link.get() {
                    return packet;
                }
            }
        }
        crate::packet::sentinel()
    }

    /// Fans `packet` out to every link attached to `out_port`. Silently
    /// drops the packet (after the fan-out loop, so refcounts still settle
    /// correctly) if the port has no listeners.
    pub fn put_data(&self, out_port: PortId, packet: PacketRef) {
        self.sealed.set(true);
        let outputs = self.outputs.borrow();
        for out in &outputs[out_port].links {
            out.link.put(std::sync::Arc::clone(&packet));
        }
    }

    /// Forwards the end-of-stream sentinel on `out_port`.
    pub fn put_eos(&self, out_port: PortId) {
        self.log(cadence_logging::events::NodeEvent::Eos { node: self.name.clone(), port: out_port });
        self.put_data(out_port, eos());
    }

    /// Forwards the out-of-data sentinel on `out_port`.
    pub fn put_ood(&self, out_port: PortId) {
        self.log(cadence_logging::events::NodeEvent::Ood { node: self.name.clone(), port: out_port });
        self.put_data(out_port, ood());
    }

    /// Reads `attrs["datatype"]`, resolves it in the datatype registry, and
    /// records a configuration error unless it is exactly `expected`.
    /// Returns whether it matched.
    pub fn configure_datatype(&self, attrs: &Attributes, expected: &std::sync::Arc<Datatype>) -> bool {
        let Some(name) = attrs.get(crate::attributes::keys::DATATYPE) else {
            self.errors.borrow_mut().push(crate::error::FlowError::Configuration {
                node: self.name.clone(),
                message: "upstream attributes carry no 'datatype' entry".into(),
            });
            return false;
        };
        match crate::registry::get_datatype(name) {
            Some(dt) if std::sync::Arc::ptr_eq(&dt, expected) => true,
            Some(_) => {
                self.errors.borrow_mut().push(crate::error::FlowError::Configuration {
                    node: self.name.clone(),
                    message: format!("datatype mismatch: expected '{}', got '{name}'", expected.name),
                });
                false
            }
            None => {
                self.errors.borrow_mut().push(crate::error::FlowError::UnknownDatatype { name: name.to_string() });
                false
            }
        }
    }

    /// Returns `in_port`'s attributes, lazily invoking the upstream node's
    /// `configure` if none are cached yet. On upstream failure, fabricates
    /// an empty bag and logs a warning.
    pub fn get_input_attributes(&self, in_port: PortId) -> Attributes {
        let (link, producer) = {
            let inputs = self.inputs.borrow();
            let input = &inputs[in_port];
            (input.link.clone(), input.producer.clone())
        };
        let Some(link) = link else {
            return Attributes::new();
        };
        if let Some(attrs) = link.attributes() {
            return attrs;
        }
        if let Some((producer, _)) = producer {
            if producer.borrow_mut().configure() {
                if let Some(attrs) = link.attributes() {
                    return attrs;
                }
            }
        }
        tracing::warn!(node = %self.name, port = in_port, "no attributes available from upstream; using empty set");
        self.log(cadence_logging::events::NodeEvent::Warning {
            node: self.name.clone(),
            message: format!("missing input attributes on port {in_port}"),
        });
        Attributes::new()
    }

    /// Sets `attrs` on every link attached to `out_port`, discarding
    /// whatever was buffered there.
    pub fn put_output_attributes(&self, out_port: PortId, attrs: &Attributes) {
        let outputs = self.outputs.borrow();
        for out in &outputs[out_port].links {
            out.link.set_attributes(attrs.clone());
        }
    }

    /// Recursively erases attributes on every downstream link, forcing a
    /// reconfiguration of whatever depends on them.
    pub fn erase_output_attributes(&self) {
        let outputs = self.outputs.borrow();
        for port in outputs.iter() {
            for out in &port.links {
                out.link.erase_attributes();
                if let Some((consumer, _)) = &out.consumer {
                    consumer.borrow().erase_output_attributes();
                }
            }
        }
    }

    /// Records a configuration-time error without aborting the node.
    pub fn report_error(&self, error: crate::error::FlowError) {
        self.errors.borrow_mut().push(error);
    }

    /// Whether this node has any recorded configuration error.
    pub fn has_errors(&self) -> bool {
        self.errors.borrow().has_errors()
    }

    /// Drains this node's recorded configuration errors.
    pub fn take_errors(&self) -> Vec<crate::error::FlowError> {
        self.errors.borrow_mut().take()
    }

    /// Logs node-level `configure` start/stop.
    pub fn log_configure_start(&self) {
        self.log(cadence_logging::events::NodeEvent::ConfigureStart { node: self.name.clone() });
    }

    /// Logs node-level `configure` start/stop.
    pub fn log_configure_stop(&self, success: bool) {
        self.log(cadence_logging::events::NodeEvent::ConfigureStop { node: self.name.clone(), success });
    }

    /// Logs node-level `work` start/stop.
    pub fn log_work_start(&self, port: PortId) {
        self.log(cadence_logging::events::NodeEvent::WorkStart { node: self.name.clone(), port });
    }

    /// Logs node-level `work` start/stop.
    pub fn log_work_stop(&self, port: PortId, produced: usize) {
        self.log(cadence_logging::events::NodeEvent::WorkStop { node: self.name.clone(), port, produced });
    }
}

/// Capability every concrete node implements: naming, configuration, and
/// the pull-driven `work` loop.
///
/// DSP nodes additionally implement [`Configurable`] and [`Stateful`]; the
/// network type implements both `Node` and the composite-container surface
/// in `crate::network`.
pub trait Node: fmt::Debug {
    /// Shared port/attribute/parameter state.
    fn abstract_node(&self) -> &AbstractNode;

    /// Evaluates upstream attributes and publishes this node's own output
    /// attributes. Returns `false` on a recorded configuration error.
    fn configure(&mut self) -> bool;

    /// Produces at least one packet on `out_port`. Returns `false` on
    /// end-of-stream or unrecoverable error, having already emitted `eos`
    /// on every output still open.
    fn work(&mut self, out_port: PortId) -> bool;

    /// Dynamic parameter update. Returns whether `name` was recognized.
    fn set_parameter(&mut self, _name: &str, _value: &str) -> bool {
        false
    }

    /// This node's declared name.
    fn name(&self) -> &str {
        self.abstract_node().name()
    }

    /// Forwards a recursive attribute erase, see
    /// [`AbstractNode::erase_output_attributes`].
    fn erase_output_attributes(&self) {
        self.abstract_node().erase_output_attributes();
    }
}

/// Capability for nodes whose behavior is driven by named, typed
/// parameters resolved through [`crate::param_expr`].
pub trait Configurable: Node {
    /// Applies a fully-resolved parameter value, rebuilding whatever
    /// internal tables depend on it.
    fn apply_parameter(&mut self, name: &str, value: &str) -> bool;
}

/// Capability for nodes that carry internal streaming state (sliding
/// windows, accumulators) that must be reset on reconfiguration.
pub trait Stateful: Node {
    /// Drops accumulated internal state, e.g. after a parameter changes.
    fn reset_state(&mut self);
}

/// The ordered list of dependents a network parameter notifies when
/// `set_parameter` changes it, keyed by parameter name.
pub type ParameterDependents = HashMap<String, Vec<NodeHandle>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Vector;

    #[derive(Debug)]
    struct Source {
        base: AbstractNode,
        out: PortId,
        dt: std::sync::Arc<Datatype>,
        emitted: bool,
    }

    impl Source {
        fn new(dt: std::sync::Arc<Datatype>) -> Self {
            let base = AbstractNode::new("source");
            let out = base.add_output_port("out");
            Source { base, out, dt, emitted: false }
        }
    }

    impl Node for Source {
        fn abstract_node(&self) -> &AbstractNode {
            &self.base
        }
        fn configure(&mut self) -> bool {
            let mut attrs = Attributes::new();
            attrs.set(crate::attributes::keys::DATATYPE, self.dt.name.clone());
            self.base.put_output_attributes(self.out, &attrs);
            true
        }
        fn work(&mut self, out_port: PortId) -> bool {
            if self.emitted {
                self.base.put_eos(out_port);
                return false;
            }
            self.emitted = true;
            let v = Vector::with_data(
                std::sync::Arc::clone(&self.dt),
                crate::timestamp::Timestamp::new(0.0, 1.0),
                vec![1.0f32, 2.0],
            );
            self.base.put_data(out_port, std::sync::Arc::new(v));
            true
        }
    }

    #[derive(Debug)]
    struct Sink {
        base: AbstractNode,
        input: PortId,
    }

    impl Sink {
        fn new() -> Self {
            let base = AbstractNode::new("sink");
            let input = base.add_input_port("in");
            Sink { base, input }
        }
    }

    impl Node for Sink {
        fn abstract_node(&self) -> &AbstractNode {
            &self.base
        }
        fn configure(&mut self) -> bool {
            let attrs = self.base.get_input_attributes(self.input);
            attrs.get(crate::attributes::keys::DATATYPE).is_some()
        }
        fn work(&mut self, _out_port: PortId) -> bool {
            let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
            !handle.is_sentinel()
        }
    }

    fn wire(dt: std::sync::Arc<Datatype>) -> (NodeHandle, NodeHandle) {
        let source: NodeHandle = Rc::new(RefCell::new(Source::new(dt.clone())));
        let sink: NodeHandle = Rc::new(RefCell::new(Sink::new()));
        let link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        source.borrow().abstract_node().attach_output(0, Rc::clone(&link), Some((Rc::clone(&sink), 0)));
        sink.borrow().abstract_node().attach_input(0, link, Rc::clone(&source), 0);
        (source, sink)
    }

    #[test]
    fn pull_through_one_hop_link() {
        let datatype = std::sync::Arc::new(Datatype::new_internal("test-f32", || unreachable!()));
        let (source, sink) = wire(datatype);
        assert!(source.borrow_mut().configure());
        assert!(sink.borrow_mut().configure());
        assert!(sink.borrow_mut().work(0));
    }

    #[test]
    fn work_returns_false_and_emits_eos_at_end_of_stream() {
        let datatype = std::sync::Arc::new(Datatype::new_internal("test-f32", || unreachable!()));
        let (source, sink) = wire(datatype);
        assert!(sink.borrow_mut().work(0));
        // second pull: the source has nothing left and must emit eos.
        assert!(!sink.borrow_mut().work(0));
        // a further pull on the same input observes the eos sentinel directly.
        let handle: Ref<Vector<f32>> = sink.borrow().abstract_node().get_data(0);
        assert!(handle.is_sentinel());
    }
}
