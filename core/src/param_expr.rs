//! Parameter expressions: textual node-attribute templates with `$(name)`
//! (network-parameter substitution) and `$input(port)` (per-packet
//! substitution from a string-valued input stream) placeholders.
//!
//! Grounded on the reference implementation's `Flow::StringExpressionNode`:
//! a node opens one extra input port per distinct `$input(...)` placeholder
//! in its deferred attribute values, and re-resolves the template each time
//! `update` decides the current input packet no longer covers the timestamp
//! being processed.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::node::{AbstractNode, PortId};
use crate::packet::Ref;
use crate::timestamp::Timestamp;

/// One piece of a parsed template: either literal text, a `$(name)`
/// configuration reference, or a `$input(name)` stream reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Config(String),
    Input(String),
}

fn parse_template(template: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("$input(") {
            if let Some(close) = template[i..].find(')') {
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                let name = &template[i + "$input(".len()..i + close];
                pieces.push(Piece::Input(name.to_string()));
                i += close + 1;
                continue;
            }
        } else if template[i..].starts_with("$(") {
            if let Some(close) = template[i..].find(')') {
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                let name = &template[i + "$(".len()..i + close];
                pieces.push(Piece::Config(name.to_string()));
                i += close + 1;
                continue;
            }
        }
        let ch_len = template[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        literal.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    pieces
}

/// Returns the distinct `$(name)` configuration-variable names referenced by
/// `template`, in first-seen order. Used by the network assembler to
/// register a node as a dependent of each network parameter it uses.
pub fn config_references(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    for piece in parse_template(template) {
        if let Piece::Config(name) = piece {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Per-`$input(...)` placeholder bookkeeping: the opened port and the value
/// currently considered in effect, with its validity window.
struct InputSlot {
    port: PortId,
    value: Option<String>,
    /// The `[start, end)` window the current `value` is valid for. Reset to
    /// `(+inf, +inf)` on reconfiguration, matching the reference
    /// implementation's "last-seen timestamps" reset — deliberately distinct
    /// from [`Timestamp::invalid`] (`+inf, -inf`), which would make every
    /// timestamp immediately fail to be contained and force a re-read on the
    /// very first `update`, whereas the reference resets to a window that
    /// simply contains nothing yet.
    window: Timestamp,
}

/// One node parameter, resolved from a literal template against the node's
/// network-parameter bindings and (for `$input` placeholders) its input
/// ports.
pub struct ParamExpr {
    pieces: Vec<Piece>,
    inputs: Vec<InputSlot>,
}

impl ParamExpr {
    fn new(template: &str, base: &AbstractNode) -> Self {
        let pieces = parse_template(template);
        let mut inputs = Vec::new();
        for piece in &pieces {
            if let Piece::Input(name) = piece {
                let port = base.add_input_port(name.clone());
                inputs.push(InputSlot {
                    port,
                    value: None,
                    window: Timestamp::new(f64::INFINITY, f64::INFINITY),
                });
            }
        }
        ParamExpr { pieces, inputs }
    }

    /// True if this expression has no `$input(...)` placeholders, i.e. it
    /// can be fully resolved at configuration time.
    pub fn is_constant(&self) -> bool {
        self.inputs.is_empty()
    }

    fn read_string_packet(&mut self, base: &AbstractNode, slot: usize) -> bool {
        let port = self.inputs[slot].port;
        let handle: Ref<StringPacket> = base.get_data(port);
        match handle.get() {
            Some(packet) => {
                self.inputs[slot].value = Some(packet.value.clone());
                self.inputs[slot].window = packet.timestamp;
                true
            }
            None => false,
        }
    }

    /// Consumes at most one value per `$input` port, regardless of whether
    /// the currently cached value already covers any particular timestamp.
    pub fn update(&mut self, base: &AbstractNode) -> bool {
        let mut changed = false;
        for slot in 0..self.inputs.len() {
            if self.read_string_packet(base, slot) {
                changed = true;
            }
        }
        changed
    }

    /// Consumes string packets from each parameter port until the cached
    /// value's window contains `timestamp`. Returns whether any slot's value
    /// changed as a result.
    pub fn update_at(&mut self, base: &AbstractNode, timestamp: f64) -> bool {
        let mut changed = false;
        for slot in 0..self.inputs.len() {
            while !self.inputs[slot].window.contains(timestamp) {
                if !self.read_string_packet(base, slot) {
                    break;
                }
                changed = true;
            }
        }
        changed
    }

    /// Resolves this expression's current value, substituting `$(name)`
    /// placeholders from `config` and `$input(name)` placeholders from the
    /// most recently read value on each opened port.
    pub fn value(&self, config: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        let mut input_idx = 0;
        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Config(name) => {
                    if let Some(v) = config.get(name) {
                        out.push_str(v);
                    }
                }
                Piece::Input(_) => {
                    if let Some(v) = self.inputs.get(input_idx).and_then(|s| s.value.as_deref()) {
                        out.push_str(v);
                    }
                    input_idx += 1;
                }
            }
        }
        out
    }
}

/// A timestamped string packet: the datatype carried on `$input(...)`
/// parameter ports.
#[derive(Debug, Clone)]
pub struct StringPacket {
    datatype: std::sync::Arc<crate::registry::Datatype>,
    timestamp: Timestamp,
    /// The string value.
    pub value: String,
}

impl StringPacket {
    /// Builds a timestamped string packet tagged with the process-wide
    /// `flow-string` datatype, registering it on first use.
    pub fn new(timestamp: Timestamp, value: impl Into<String>) -> Self {
        StringPacket { datatype: string_datatype(), timestamp, value: value.into() }
    }
}

/// The `flow-string` datatype singleton carried by every [`StringPacket`].
///
/// Kept process-local (outside the public [`crate::registry`]) rather than
/// registered under a name: parameter-expression ports are opened
/// internally by [`ParamExpr::new`], never wired from a `.flow` file, so
/// there is no `<node filter="...">` that would need to look this datatype
/// up by name.
static STRING_DATATYPE: once_cell::sync::Lazy<std::sync::Arc<crate::registry::Datatype>> = once_cell::sync::Lazy::new(|| {
    std::sync::Arc::new(crate::registry::Datatype::new_internal("flow-string", || {
        Box::new(StringPacket { datatype: string_datatype(), timestamp: Timestamp::invalid(), value: String::new() })
    }))
});

fn string_datatype() -> std::sync::Arc<crate::registry::Datatype> {
    std::sync::Arc::clone(&STRING_DATATYPE)
}

impl crate::packet::Data for StringPacket {
    fn datatype(&self) -> &std::sync::Arc<crate::registry::Datatype> {
        &self.datatype
    }

    fn clone_box(&self) -> Box<dyn crate::packet::Data> {
        Box::new(self.clone())
    }

    fn read(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        use byteorder::{BigEndian, ReadBytesExt};
        self.timestamp.start = input.read_f64::<BigEndian>()?;
        self.timestamp.end = input.read_f64::<BigEndian>()?;
        let len = input.read_u32::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(input, &mut buf)?;
        self.value = String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(())
    }

    fn write(&self, output: &mut dyn std::io::Write) -> std::io::Result<()> {
        use byteorder::{BigEndian, WriteBytesExt};
        output.write_f64::<BigEndian>(self.timestamp.start)?;
        output.write_f64::<BigEndian>(self.timestamp.end)?;
        let bytes = self.value.as_bytes();
        output.write_u32::<BigEndian>(bytes.len() as u32)?;
        output.write_all(bytes)
    }

    fn dump(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        write!(out, "<string start=\"{}\" end=\"{}\">{}</string>", self.timestamp.start, self.timestamp.end, self.value)
    }

    fn equals(&self, other: &dyn crate::packet::Data) -> bool {
        other
            .as_any()
            .downcast_ref::<StringPacket>()
            .map(|o| o.timestamp.approx_eq(&self.timestamp) && o.value == self.value)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl crate::packet::TimestampedData for StringPacket {
    fn interval(&self) -> Timestamp {
        self.timestamp
    }
    fn set_interval(&mut self, t: Timestamp) {
        self.timestamp = t;
    }
}

/// The set of parameter expressions declared on one node, plus the
/// network-parameter bindings (`$(name)` substitutions) they're resolved
/// against.
#[derive(Default)]
pub struct ParamTable {
    config: BTreeMap<String, String>,
    expressions: RefCell<BTreeMap<String, ParamExpr>>,
}

impl ParamTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a network-scope configuration variable (`$(name)`), used by
    /// every expression on this node that references it.
    pub fn set_config(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.config.insert(name.into(), value.into());
    }

    /// Declares a parameter named `name` with raw template text
    /// `expression`, opening one input port per `$input(...)` placeholder.
    pub fn add_parameter(&self, base: &AbstractNode, name: impl Into<String>, expression: &str) {
        let expr = ParamExpr::new(expression, base);
        self.expressions.borrow_mut().insert(name.into(), expr);
    }

    /// True if `name`'s expression has no `$input(...)` placeholders.
    pub fn is_constant(&self, name: &str) -> bool {
        self.expressions.borrow().get(name).map(|e| e.is_constant()).unwrap_or(true)
    }

    /// Resolves `name`'s current value.
    pub fn value(&self, name: &str) -> Option<String> {
        self.expressions.borrow().get(name).map(|e| e.value(&self.config))
    }

    /// Drives every declared expression's `update` (unconditional, at most
    /// one value per port). Returns whether any value changed.
    pub fn update_all(&self, base: &AbstractNode) -> bool {
        let mut changed = false;
        for expr in self.expressions.borrow_mut().values_mut() {
            if expr.update(base) {
                changed = true;
            }
        }
        changed
    }

    /// Drives `name`'s expression's `update_at(timestamp)`. Returns whether
    /// its value changed.
    pub fn update_at(&self, base: &AbstractNode, name: &str, timestamp: f64) -> bool {
        self.expressions.borrow_mut().get_mut(name).map(|e| e.update_at(base, timestamp)).unwrap_or(false)
    }

    /// Clears every expression's cached substitutions and resets its
    /// per-port validity windows, matching a full reconfiguration.
    pub fn reset(&self) {
        for expr in self.expressions.borrow_mut().values_mut() {
            for slot in &mut expr.inputs {
                slot.value = None;
                slot.window = Timestamp::new(f64::INFINITY, f64::INFINITY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AbstractNode;

    #[test]
    fn parses_mixed_placeholders() {
        let pieces = parse_template("$(warp).matrix");
        assert_eq!(pieces, vec![Piece::Config("warp".into()), Piece::Literal(".matrix".into())]);
    }

    #[test]
    fn parses_input_placeholder_and_opens_a_port() {
        let base = AbstractNode::new("n");
        let table = ParamTable::new();
        table.add_parameter(&base, "file", "$input(warp).matrix");
        assert_eq!(base.n_inputs(), 1);
        assert!(!table.is_constant("file"));
    }

    #[test]
    fn constant_expression_resolves_without_any_port() {
        let base = AbstractNode::new("n");
        let mut table = ParamTable::new();
        table.set_config("warp", "0.9");
        table.add_parameter(&base, "file", "$(warp).matrix");
        assert_eq!(base.n_inputs(), 0);
        assert!(table.is_constant("file"));
        assert_eq!(table.value("file").as_deref(), Some("0.9.matrix"));
    }

    #[test]
    fn reparsing_the_seed_scenario_6_template_reresolves_on_new_input() {
        // "$input(warp).matrix"; warp port receives ("0.9"@[0,1)), ("1.1"@[1,2)).
        let base = AbstractNode::new("n");
        let table = ParamTable::new();
        table.add_parameter(&base, "file", "$input(warp).matrix");
        // Feed packets directly onto the opened port's link via a tiny
        // source node, mirroring how the network assembler would wire it.
        let port = base.name_to_input_port("warp").unwrap();
        let link = std::rc::Rc::new(crate::link::Link::new(string_datatype(), crate::link::LinkMode::Fast, 0));
        base.attach_input(port, std::rc::Rc::clone(&link), source_stub(), 0);
        link.put(std::sync::Arc::new(StringPacket::new(Timestamp::new(0.0, 1.0), "0.9")));
        link.put(std::sync::Arc::new(StringPacket::new(Timestamp::new(1.0, 2.0), "1.1")));

        assert!(table.update_at(&base, "file", 0.5));
        assert_eq!(table.value("file").as_deref(), Some("0.9.matrix"));
        assert!(table.update_at(&base, "file", 1.5));
        assert_eq!(table.value("file").as_deref(), Some("1.1.matrix"));
    }

    fn source_stub() -> crate::node::NodeHandle {
        #[derive(Debug)]
        struct Stub(AbstractNode);
        impl crate::node::Node for Stub {
            fn abstract_node(&self) -> &AbstractNode {
                &self.0
            }
            fn configure(&mut self) -> bool {
                true
            }
            fn work(&mut self, _out_port: PortId) -> bool {
                false
            }
        }
        std::rc::Rc::new(RefCell::new(Stub(AbstractNode::new("stub"))))
    }
}
