//! Declarative network assembly: the `.flow` XML grammar, the
//! [`NodeBuilder`] filter-lookup order, and the [`Network`] composite node
//! that results from assembling a [`NetworkTemplate`].
//!
//! Grounded on the reference implementation's `Flow::NetworkParser` /
//! `Flow::NetworkBuilder` pair and on `Flow::Network` itself, which (per
//! the reference's own description) is "an abstract node whose inputs and
//! outputs are backed by the nodes it contains."

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::FlowError;
use crate::link::{Link, LinkMode};
use crate::node::{AbstractNode, Node, NodeHandle, PortId};
use crate::packet::is_any_sentinel;

/// One `<node name=… filter=… …/>` declaration: its instance name, its
/// filter (a builtin name, a sibling `<network-node>`'s filter, or an
/// external `.flow` file stem), and every other attribute, forwarded
/// verbatim as a parameter-expression template.
#[derive(Debug, Clone)]
pub struct NodeDecl {
    pub name: String,
    pub filter: String,
    pub attrs: BTreeMap<String, String>,
}

/// One `<link from=… to=… buffer=…/>` declaration, endpoints still in their
/// raw `node[:port]` textual form.
#[derive(Debug, Clone)]
pub struct LinkDecl {
    pub from: String,
    pub to: String,
    pub buffer: usize,
}

/// The accumulated declarations of one `<network>` or `<network-node>`
/// scope, as parsed from XML or built up programmatically.
#[derive(Debug, Clone, Default)]
pub struct NetworkTemplate {
    pub name: Option<String>,
    pub threaded: bool,
    pub params: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub nodes: Vec<NodeDecl>,
    /// Nested `<network-node filter="x">` templates, keyed by the filter
    /// name other `<node filter="x">` declarations in this same scope (or a
    /// scope nested inside it) resolve against — lookup order (b) in
    /// [`NodeBuilder`].
    pub sub_templates: HashMap<String, NetworkTemplate>,
    pub links: Vec<LinkDecl>,
}

fn attr_to_string(attrs_str: &str) -> Result<String, FlowError> {
    Ok(attrs_str.to_string())
}

fn local_name_str(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn missing_attr(tag: &str, attr: &str) -> FlowError {
    FlowError::Configuration { node: format!("<{tag}>"), message: format!("missing required attribute '{attr}'") }
}

fn collect_attrs(e: &BytesStart) -> Result<BTreeMap<String, String>, FlowError> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(value_checked(out)?)
}

fn value_checked(m: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, FlowError> {
    for v in m.values() {
        attr_to_string(v)?;
    }
    Ok(m)
}

/// Parses a `.flow` document, returning the template declared by its root
/// `<network>` element.
pub fn parse_network_xml(xml: &str) -> Result<NetworkTemplate, FlowError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if local_name_str(&e) == "network" => {
                let attrs = collect_attrs(&e)?;
                let name = attrs.get("name").cloned();
                let threaded = attrs.get("threaded").map(|v| v == "true").unwrap_or(false);
                return parse_network_body(&mut reader, &mut buf, name, threaded);
            }
            Event::Eof => {
                return Err(FlowError::Xml(quick_xml::Error::UnexpectedEof("no <network> root element".into())));
            }
            _ => {}
        }
    }
}

fn parse_network_body(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
    name: Option<String>,
    threaded: bool,
) -> Result<NetworkTemplate, FlowError> {
    let mut template = NetworkTemplate { name, threaded, ..Default::default() };
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Empty(e) => record_leaf(&mut template, &e)?,
            Event::Start(e) => {
                let tag = local_name_str(&e);
                if tag == "network-node" {
                    let attrs = collect_attrs(&e)?;
                    let sub_name = attrs.get("name").cloned();
                    let sub_filter = attrs.get("filter").cloned();
                    let sub_threaded = attrs.get("threaded").map(|v| v == "true").unwrap_or(false);
                    let key = sub_filter.or_else(|| sub_name.clone()).ok_or_else(|| missing_attr("network-node", "filter"))?;
                    let sub = parse_network_body(reader, buf, sub_name, sub_threaded)?;
                    template.sub_templates.insert(key, sub);
                } else {
                    record_leaf(&mut template, &e)?;
                }
            }
            Event::End(e) => {
                let tag = local_name_str_end(&e);
                if tag == "network" || tag == "network-node" {
                    return Ok(template);
                }
            }
            Event::Eof => return Ok(template),
            _ => {}
        }
    }
}

fn local_name_str_end(e: &quick_xml::events::BytesEnd) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn record_leaf(template: &mut NetworkTemplate, e: &BytesStart) -> Result<(), FlowError> {
    let tag = local_name_str(e);
    let attrs = collect_attrs(e)?;
    match tag.as_str() {
        "param" => template.params.push(attrs.get("name").cloned().ok_or_else(|| missing_attr("param", "name"))?),
        "in" => template.inputs.push(attrs.get("name").cloned().ok_or_else(|| missing_attr("in", "name"))?),
        "out" => template.outputs.push(attrs.get("name").cloned().ok_or_else(|| missing_attr("out", "name"))?),
        "node" => {
            let mut attrs = attrs;
            let node_name = attrs.remove("name").ok_or_else(|| missing_attr("node", "name"))?;
            let filter = attrs.remove("filter").ok_or_else(|| missing_attr("node", "filter"))?;
            template.nodes.push(NodeDecl { name: node_name, filter, attrs });
        }
        "link" => {
            let from = attrs.get("from").cloned().ok_or_else(|| missing_attr("link", "from"))?;
            let to = attrs.get("to").cloned().ok_or_else(|| missing_attr("link", "to"))?;
            let buffer = attrs.get("buffer").and_then(|v| v.parse().ok()).unwrap_or(0);
            template.links.push(LinkDecl { from, to, buffer });
        }
        "network-node" => {
            // Self-closing network-node: an empty nested scope.
            let sub_name = attrs.get("name").cloned();
            let sub_filter = attrs.get("filter").cloned();
            let sub_threaded = attrs.get("threaded").map(|v| v == "true").unwrap_or(false);
            let key = sub_filter.or_else(|| sub_name.clone()).ok_or_else(|| missing_attr("network-node", "filter"))?;
            template.sub_templates.insert(key, NetworkTemplate { name: sub_name, threaded: sub_threaded, ..Default::default() });
        }
        _ => {}
    }
    Ok(())
}

/// Where [`resolve_node`] looks for a filter name not found in the builtin
/// registry: the local scope's `<network-node>` templates, plus a
/// filesystem search path used for external `.flow` files.
pub struct BuildContext<'a> {
    pub sub_templates: &'a HashMap<String, NetworkTemplate>,
    pub base_dir: &'a Path,
    pub search_path: &'a [PathBuf],
    pub extension: &'a str,
}

impl<'a> BuildContext<'a> {
    fn nested(&self, template: &'a NetworkTemplate, file_dir: &'a Path) -> BuildContext<'a> {
        BuildContext { sub_templates: &template.sub_templates, base_dir: file_dir, search_path: self.search_path, extension: self.extension }
    }
}

fn resolve_external_file(ctx: &BuildContext, filter: &str) -> Option<PathBuf> {
    let add_extension = |mut p: PathBuf| -> PathBuf {
        if p.extension().is_none() {
            p.set_extension(ctx.extension.trim_start_matches('.'));
        }
        p
    };
    let candidate = add_extension(ctx.base_dir.join(filter));
    if candidate.is_file() {
        return Some(candidate);
    }
    for dir in ctx.search_path {
        let candidate = add_extension(dir.join(filter));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Resolves a `<node filter="…">` to a fresh [`NodeHandle`], in the order:
/// (a) the builtin filter registry, (b) a `<network-node>` template declared
/// in the enclosing scope, (c) an external `.flow` file.
pub fn resolve_node(ctx: &BuildContext, filter: &str) -> Result<NodeHandle, FlowError> {
    if let Some(factory) = crate::registry::get_filter(filter) {
        return Ok(factory());
    }
    if let Some(sub) = ctx.sub_templates.get(filter) {
        return create_network(sub, ctx);
    }
    let path = resolve_external_file(ctx, filter).ok_or_else(|| FlowError::UnknownFilter { name: filter.to_string() })?;
    let xml = std::fs::read_to_string(&path)?;
    let template = parse_network_xml(&xml)?;
    let file_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let nested = BuildContext { sub_templates: &template.sub_templates, base_dir: &file_dir, search_path: ctx.search_path, extension: ctx.extension };
    create_network(&template, &nested)
}

fn split_endpoint(s: &str) -> (String, Option<String>) {
    match s.split_once(':') {
        Some((n, p)) => (n.to_string(), Some(p.to_string())),
        None => (s.to_string(), None),
    }
}

enum PortKind {
    Input,
    Output,
}

fn resolve_node_port(
    nodes: &HashMap<String, NodeHandle>,
    node_name: &str,
    port_name: Option<&str>,
    kind: PortKind,
) -> Result<(NodeHandle, PortId), FlowError> {
    let handle = nodes
        .get(node_name)
        .ok_or_else(|| FlowError::Configuration { node: node_name.to_string(), message: "link references an undeclared node".into() })?;
    let port = {
        let node_ref = handle.borrow();
        let base = node_ref.abstract_node();
        match port_name {
            Some(name) => match kind {
                PortKind::Input => base.name_to_input_port(name),
                PortKind::Output => base.name_to_output_port(name),
            },
            None => Some(0),
        }
    };
    let port = port.ok_or_else(|| FlowError::Configuration {
        node: node_name.to_string(),
        message: format!("no such port '{}'", port_name.unwrap_or("0")),
    })?;
    Ok((Rc::clone(handle), port))
}

/// Assembles `template` into a ready [`Network`], wrapped as a
/// [`NodeHandle`] so it can be wired as an ordinary node by an enclosing
/// scope.
///
/// Two passes, since internal nodes that connect to `network:…` need a
/// handle to the network being built before it exists as a value: first the
/// (portless) `Network` shell is built and wrapped in its `Rc<RefCell<_>>`,
/// then every declared node is instantiated and wired, with the already-live
/// handle available for `network:`-endpoint links.
pub fn create_network(template: &NetworkTemplate, ctx: &BuildContext) -> Result<NodeHandle, FlowError> {
    Ok(create_network_concrete(template, ctx)? as NodeHandle)
}

/// Same assembly as [`create_network`], but keeps the concrete [`Network`]
/// type instead of erasing it to [`NodeHandle`] — needed by callers (tests,
/// a top-level driver) that want to `feed`/`pull` the network directly
/// rather than treat it as an opaque contained node.
pub fn create_network_concrete(template: &NetworkTemplate, ctx: &BuildContext) -> Result<Rc<std::cell::RefCell<Network>>, FlowError> {
    let network = Network::new(
        template.name.clone().unwrap_or_default(),
        template.threaded,
        &template.inputs,
        &template.outputs,
        template.params.iter().cloned().collect(),
    );
    let network_handle: Rc<std::cell::RefCell<Network>> = Rc::new(std::cell::RefCell::new(network));

    let mut nodes: HashMap<String, NodeHandle> = HashMap::new();
    for decl in &template.nodes {
        let handle = resolve_node(ctx, &decl.filter)?;
        nodes.insert(decl.name.clone(), handle);
    }

    for decl in &template.links {
        wire_network_link(&network_handle, &nodes, decl)?;
    }

    for decl in &template.nodes {
        let handle = &nodes[&decl.name];
        for (key, value) in &decl.attrs {
            apply_deferred_attribute(&network_handle, handle, key, value);
        }
    }

    network_handle.borrow_mut().nodes = nodes;
    Ok(network_handle)
}

fn wire_network_link(network_handle: &Rc<std::cell::RefCell<Network>>, nodes: &HashMap<String, NodeHandle>, decl: &LinkDecl) -> Result<(), FlowError> {
    let (from_node, from_port) = split_endpoint(&decl.from);
    let (to_node, to_port) = split_endpoint(&decl.to);

    if from_node == "network" {
        let port_name = from_port.ok_or_else(|| missing_attr("link", "from port"))?;
        let (consumer, consumer_port) = resolve_node_port(nodes, &to_node, to_port.as_deref(), PortKind::Input)?;
        let (real_idx, link) = {
            let net = network_handle.borrow();
            let idx = net
                .base
                .name_to_input_port(&port_name)
                .ok_or_else(|| FlowError::Configuration { node: "network".into(), message: format!("no such external input '{port_name}'") })?;
            (idx, Rc::clone(&net.input_bridges[idx]))
        };
        let network_as_node: NodeHandle = Rc::clone(network_handle) as NodeHandle;
        consumer.borrow().abstract_node().attach_input(consumer_port, link, network_as_node, real_idx);
    } else if to_node == "network" {
        let port_name = to_port.ok_or_else(|| missing_attr("link", "to port"))?;
        let (producer, producer_port) = resolve_node_port(nodes, &from_node, from_port.as_deref(), PortKind::Output)?;
        let mode = producer.borrow().abstract_node().link_mode();
        let link = Rc::new(Link::new_unresolved(mode, decl.buffer));
        producer.borrow().abstract_node().attach_output(producer_port, Rc::clone(&link), None);
        let shadow = {
            let net = network_handle.borrow();
            let idx = net
                .base
                .name_to_output_port(&port_name)
                .ok_or_else(|| FlowError::Configuration { node: "network".into(), message: format!("no such external output '{port_name}'") })?;
            net.shadow_input_for_output[idx]
        };
        network_handle.borrow().base.attach_input(shadow, link, producer, producer_port);
    } else {
        let (producer, producer_port) = resolve_node_port(nodes, &from_node, from_port.as_deref(), PortKind::Output)?;
        let (consumer, consumer_port) = resolve_node_port(nodes, &to_node, to_port.as_deref(), PortKind::Input)?;
        let mode = producer.borrow().abstract_node().link_mode();
        let link = Rc::new(Link::new_unresolved(mode, decl.buffer));
        producer.borrow().abstract_node().attach_output(producer_port, Rc::clone(&link), Some((Rc::clone(&consumer), consumer_port)));
        consumer.borrow().abstract_node().attach_input(consumer_port, link, producer, producer_port);
    }
    Ok(())
}

fn apply_deferred_attribute(network_handle: &Rc<std::cell::RefCell<Network>>, node: &NodeHandle, key: &str, value: &str) {
    let refs = crate::param_expr::config_references(value);
    let (resolved, is_constant) = {
        let node_ref = node.borrow();
        let base = node_ref.abstract_node();
        base.params.borrow().add_parameter(base, key, value);
        let constant = base.params.borrow().is_constant(key);
        let value = base.params.borrow().value(key);
        (value, constant)
    };
    if !refs.is_empty() {
        let mut net = network_handle.borrow_mut();
        for name in &refs {
            net.dependents.entry(name.clone()).or_default().push((Rc::clone(node), key.to_string()));
        }
    }
    if is_constant {
        if let Some(value) = resolved {
            node.borrow_mut().set_parameter(key, &value);
        }
    }
}

/// A composite node assembled from a [`NetworkTemplate`]: itself an
/// [`AbstractNode`], whose external inputs are fed to the internal nodes
/// wired to `network:port` sources, and whose external outputs are pulled
/// from the internal nodes wired to `network:port` sinks.
///
/// Grounded on the reference implementation's `Flow::Network`: "external
/// inputs are backed by a hidden repeater, external outputs delegate
/// `get_data` to the internal link." A repeater is unnecessary here: an
/// internal consumer treats the `Network` handle itself as its producer
/// (`attach_input(.., network_handle, real_input_index)`), so `Network::work`
/// simply forwards whatever is on its own (possibly externally-attached)
/// input port onto the matching bridge link — see `DESIGN.md`.
#[derive(Debug)]
pub struct Network {
    base: AbstractNode,
    nodes: HashMap<String, NodeHandle>,
    /// One bridge [`Link`] per external input, shared between `Network`
    /// itself (producer side, written from `work`) and whichever internal
    /// node(s) a `<link from="network:name">` attached as consumer.
    input_bridges: Vec<Rc<Link>>,
    /// For external output `i`, the [`PortId`] of the hidden input port on
    /// `base` that the producing internal node is attached to.
    shadow_input_for_output: Vec<PortId>,
    n_outputs: usize,
    /// Parameter name -> nodes (and which of their parameter names) that
    /// reference it via `$(name)`.
    dependents: HashMap<String, Vec<(NodeHandle, String)>>,
    declared_params: HashSet<String>,
    output_active: Vec<bool>,
}

impl Network {
    /// Builds an empty network shell with the given external port names;
    /// node instantiation and link wiring happen afterward in
    /// [`create_network`].
    pub fn new(name: impl Into<String>, threaded: bool, input_names: &[String], output_names: &[String], declared_params: HashSet<String>) -> Self {
        let mut base = AbstractNode::new(name);
        base.set_threaded(threaded);
        let mut input_bridges = Vec::with_capacity(input_names.len());
        for input_name in input_names {
            base.add_input_port(input_name.clone());
            input_bridges.push(Rc::new(Link::new_unresolved(LinkMode::Fast, 0)));
        }
        let mut shadow_input_for_output = Vec::with_capacity(output_names.len());
        for output_name in output_names {
            base.add_output_port(output_name.clone());
            let shadow = base.add_input_port(format!("$internal-out:{output_name}"));
            shadow_input_for_output.push(shadow);
        }
        let n_outputs = output_names.len();
        Network {
            base,
            nodes: HashMap::new(),
            input_bridges,
            shadow_input_for_output,
            n_outputs,
            dependents: HashMap::new(),
            declared_params,
            output_active: vec![true; n_outputs],
        }
    }

    /// Looks up a contained node by its declared `name`.
    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.get(name)
    }

    /// Pushes `packet` directly onto the external input `name`'s bridge
    /// link, for a standalone harness driving the network without an
    /// enclosing parent network.
    pub fn feed(&self, name: &str, packet: crate::packet::PacketRef) -> bool {
        match self.base.name_to_input_port(name) {
            Some(idx) => {
                self.input_bridges[idx].put(packet);
                true
            }
            None => false,
        }
    }

    /// Pulls one packet from the external output `name`, recursing into
    /// whichever internal node produces it. Panics (via
    /// [`crate::abort_invariant`]) if `name` is not a declared output.
    pub fn pull(&mut self, name: &str) -> crate::packet::PacketRef {
        let out_port = match self.base.name_to_output_port(name) {
            Some(p) => p,
            None => crate::abort_invariant!("no such network output '{name}'"),
        };
        let shadow = self.shadow_input_for_output[out_port];
        let packet = self.base.get_data_raw(shadow);
        self.base.put_data(out_port, std::sync::Arc::clone(&packet));
        packet
    }

    /// Reconnects external output `name` for consumption after it was
    /// deactivated; see [`Network::deactivate_output`].
    pub fn activate_output(&mut self, name: &str) {
        if let Some(idx) = self.base.name_to_output_port(name) {
            self.output_active[idx] = true;
        }
    }

    /// Disables external output `name`: `work` on it returns `false`
    /// without pulling the internal producer, so packets are not produced
    /// only to be orphaned while this network is embedded and that output
    /// is not wired to anything.
    pub fn deactivate_output(&mut self, name: &str) {
        if let Some(idx) = self.base.name_to_output_port(name) {
            self.output_active[idx] = false;
        }
    }

    fn set_network_parameter(&mut self, name: &str, value: &str) -> bool {
        let Some(dependents) = self.dependents.get(name).cloned() else {
            return self.declared_params.contains(name);
        };
        for (node, expr_name) in &dependents {
            let resolved = {
                let node_ref = node.borrow();
                let base = node_ref.abstract_node();
                base.params.borrow_mut().set_config(name, value);
                base.params.borrow().value(expr_name)
            };
            if let Some(resolved) = resolved {
                let changed = node.borrow_mut().set_parameter(expr_name, &resolved);
                if changed {
                    node.borrow().erase_output_attributes();
                }
            }
        }
        true
    }
}

impl Node for Network {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn configure(&mut self) -> bool {
        let n_inputs = self.input_bridges.len();
        for i in 0..n_inputs {
            let attrs = self.base.get_input_attributes(i);
            self.input_bridges[i].set_attributes(attrs);
        }
        let mut ok = true;
        for out_port in 0..self.n_outputs {
            let shadow = self.shadow_input_for_output[out_port];
            let attrs = self.base.get_input_attributes(shadow);
            self.base.put_output_attributes(out_port, &attrs);
        }
        for node in self.nodes.values() {
            if node.borrow().abstract_node().has_errors() {
                ok = false;
            }
        }
        ok
    }

    fn work(&mut self, out_port: PortId) -> bool {
        if out_port < self.n_outputs {
            if !self.output_active[out_port] {
                return false;
            }
            let shadow = self.shadow_input_for_output[out_port];
            let packet = self.base.get_data_raw(shadow);
            let ended = is_any_sentinel(&packet);
            self.base.put_data(out_port, packet);
            !ended
        } else {
            let real_in = out_port - self.n_outputs;
            let packet = self.base.get_data_raw(real_in);
            let ended = is_any_sentinel(&packet);
            self.input_bridges[real_in].put(packet);
            !ended
        }
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        self.set_network_parameter(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use std::sync::{Arc, Once};

    static INIT: Once = Once::new();

    fn ensure_builtins_registered() {
        INIT.call_once(|| {
            crate::nodes::register_builtins().ok();
            crate::window::register_builtins().ok();
            crate::dsp::register_builtins().ok();
        });
    }

    fn empty_ctx<'a>(sub_templates: &'a HashMap<String, NetworkTemplate>, dir: &'a Path, search: &'a [PathBuf]) -> BuildContext<'a> {
        BuildContext { sub_templates, base_dir: dir, search_path: search, extension: "flow" }
    }

    #[test]
    fn parses_the_seed_pipeline() {
        let xml = r#"
        <network name="pipeline">
          <param name="warping-factor"/>
          <in name="samples"/>
          <out name="features"/>
          <node name="preemph" filter="signal-preemphasis" alpha="1.0"/>
          <node name="win" filter="signal-window" length="0.025" shift="0.010"/>
          <node name="fft" filter="signal-real-fast-fourier-transform"/>
          <link from="network:samples" to="preemph"/>
          <link from="preemph" to="win"/>
          <link from="win" to="fft"/>
          <link from="fft" to="network:features"/>
        </network>
        "#;
        let template = parse_network_xml(xml).unwrap();
        assert_eq!(template.name.as_deref(), Some("pipeline"));
        assert_eq!(template.params, vec!["warping-factor"]);
        assert_eq!(template.inputs, vec!["samples"]);
        assert_eq!(template.outputs, vec!["features"]);
        assert_eq!(template.nodes.len(), 3);
        assert_eq!(template.links.len(), 4);
        assert_eq!(template.nodes[0].attrs.get("alpha").map(String::as_str), Some("1.0"));
    }

    fn ensure_vector_f32_registered() -> Arc<crate::registry::Datatype> {
        if let Some(dt) = registry::get_datatype("flow-vector-f32") {
            return dt;
        }
        registry::register_datatype("flow-vector-f32", || Box::new(crate::packet::Vector::<f32>::new(registry::get_datatype("flow-vector-f32").unwrap()))).ok();
        registry::get_datatype("flow-vector-f32").unwrap()
    }

    #[test]
    fn assembles_and_runs_the_seed_pipeline() {
        use crate::attributes::{keys, Attributes};
        use crate::packet::{TimestampedData, Vector};
        use crate::timestamp::Timestamp;

        ensure_builtins_registered();
        let dt = ensure_vector_f32_registered();

        let xml = r#"
        <network name="pipeline">
          <in name="samples"/>
          <out name="features"/>
          <node name="preemph" filter="signal-preemphasis" alpha="0.0"/>
          <link from="network:samples" to="preemph"/>
          <link from="preemph" to="network:features"/>
        </network>
        "#;
        let template = parse_network_xml(xml).unwrap();
        let empty = HashMap::new();
        let dir = PathBuf::from(".");
        let search: Vec<PathBuf> = Vec::new();
        let ctx = empty_ctx(&empty, &dir, &search);
        let net = create_network_concrete(&template, &ctx).unwrap();

        // No parent network supplies attributes on the external `samples`
        // input, so the standalone harness sets them on the bridge link
        // directly (playing the role of an enclosing network's `configure`)
        // and configures the one contained node itself, before pulling.
        let mut attrs = Attributes::new();
        attrs.set(keys::DATATYPE, &dt.name);
        net.borrow().input_bridges[0].set_attributes(attrs);
        assert!(net.borrow().node("preemph").unwrap().borrow_mut().configure());

        assert!(net.borrow().feed("samples", Arc::new(Vector::with_data(dt, Timestamp::new(0.0, 0.01), vec![1.0f32, 2.0, 3.0]))));

        let out = net.borrow_mut().pull("features");
        let out: crate::packet::Ref<Vector<f32>> = crate::packet::Ref::downcast(out);
        let out = out.get().expect("preemphasis with alpha=0 forwards the input unchanged");
        assert_eq!(out.data, vec![1.0, 2.0, 3.0]);
        assert!(out.interval().approx_eq(&Timestamp::new(0.0, 0.01)));
    }
}
