//! Small general-purpose nodes that are not specific to any one DSP
//! algorithm: a passthrough forwarder, a debug dumper, and a sliding-window
//! margin-policy consumer.

use std::sync::Arc;

use crate::node::{AbstractNode, Node, PortId};
use crate::packet::{Data, Ref, TimestampedData, Vector};
use crate::sliding_window::{MarginCondition, MarginPolicy, SlidingWindow};

/// Forwards whatever packet it receives on its single input to its single
/// output, unchanged.
///
/// Grounded on the reference implementation's `Flow::PipeNode`/`SleeveNode`
/// pair: `Pipe` there reads from an external process and carries an
/// unresolved "which data to read, datatypes necessary?" defect marker for
/// non-text payloads. This model has no untyped byte-stream packet kind, so
/// that ambiguity does not reappear here — `PassThroughNode` is the faithful
/// reading of a `SleeveNode` with no transformation at all.
#[derive(Debug)]
pub struct PassThroughNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
}

impl PassThroughNode {
    pub fn new() -> Self {
        let base = AbstractNode::new("generic-pass-through");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        PassThroughNode { base, input, output }
    }
}

impl Default for PassThroughNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for PassThroughNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.base.put_output_attributes(self.output, &attrs);
        true
    }

    fn work(&mut self, _out_port: PortId) -> bool {
        let packet = self.base.get_data_raw(self.input);
        let is_sentinel = crate::packet::is_any_sentinel(&packet);
        self.base.put_data(self.output, packet);
        !is_sentinel
    }
}

/// Writes every packet's [`crate::packet::Data::dump`] rendering to the
/// tracing log, then forwards it unchanged.
///
/// Grounded on `Flow::DumpNode`, minus the filesystem/`XmlOutputStream`
/// plumbing: file output is an ambient concern handled the same way the
/// rest of this crate handles it (`tracing`), rather than reimplementing
/// `Core::XmlOutputStream` here.
#[derive(Debug)]
pub struct DumpNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    unbuffered: bool,
}

impl DumpNode {
    pub fn new() -> Self {
        let base = AbstractNode::new("generic-dump");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        DumpNode { base, input, output, unbuffered: false }
    }
}

impl Default for DumpNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for DumpNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "unbuffered" => {
                self.unbuffered = value == "true" || value == "1";
                true
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.base.put_output_attributes(self.output, &attrs);
        true
    }

    fn work(&mut self, _out_port: PortId) -> bool {
        let packet = self.base.get_data_raw(self.input);
        let is_sentinel = crate::packet::is_any_sentinel(&packet);
        if !is_sentinel {
            let mut dump = String::new();
            if packet.dump(&mut dump).is_ok() {
                if self.unbuffered {
                    tracing::info!(node = %self.base.name(), dump = %dump, "dump");
                } else {
                    tracing::debug!(node = %self.base.name(), dump = %dump, "dump");
                }
            }
        }
        self.base.put_data(self.output, packet);
        !is_sentinel
    }
}

/// Concatenates `left + right + 1` sliding-window positions of
/// `Vector<f32>` frames, oldest to newest, into one output vector, applying
/// a [`MarginPolicy`] where a position falls outside what has been seen.
///
/// Grounded on `Signal::TemporalIntegration`/`VectorSequenceConcatenation`:
/// the consumer that exercises [`crate::sliding_window::SlidingWindow`]'s
/// margin policies, which are otherwise inert without one.
#[derive(Debug)]
pub struct MarginWindowNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    left: i64,
    right: i64,
    policy: MarginPolicy,
    condition: MarginCondition,
    window: SlidingWindow<Arc<Vector<f32>>>,
    datatype: Option<Arc<crate::registry::Datatype>>,
    primed: bool,
}

impl MarginWindowNode {
    pub fn new(left: i64, right: i64, policy: MarginPolicy, condition: MarginCondition) -> Self {
        let base = AbstractNode::new("generic-margin-window");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        let window = SlidingWindow::new((left + right + 1) as usize, right as usize)
            .unwrap_or_else(|| crate::abort_invariant!("MarginWindowNode with left={left} right={right}"));
        MarginWindowNode {
            base,
            input,
            output,
            left,
            right,
            policy,
            condition,
            window,
            datatype: None,
            primed: false,
        }
    }

    fn margin_value(&self, relative_index: i64) -> Arc<Vector<f32>> {
        let shaped = self.window.get_with_copy_margin(relative_index);
        match self.policy {
            MarginPolicy::Copy => shaped,
            MarginPolicy::Zero | MarginPolicy::One | MarginPolicy::Mean => {
                let fill = match self.policy {
                    MarginPolicy::Zero => 0.0,
                    MarginPolicy::One => 1.0,
                    MarginPolicy::Mean => self.mean_value(),
                    MarginPolicy::Copy => unreachable!(),
                };
                Arc::new(Vector::with_data(
                    Arc::clone(shaped.datatype()),
                    shaped.interval(),
                    vec![fill; shaped.data.len()],
                ))
            }
        }
    }

    fn mean_value(&self) -> f32 {
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for idx in -self.left..=self.right {
            if let Some(v) = self.window.get(idx) {
                sum += v.data.iter().sum::<f32>() / v.data.len().max(1) as f32;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    }

    fn pull_one(&mut self) {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        match handle.get() {
            Some(v) => self.window.add(Arc::new(v.clone())),
            None => self.window.flush(),
        }
    }
}

impl Node for MarginWindowNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        let Some(name) = attrs.get(crate::attributes::keys::DATATYPE) else {
            return false;
        };
        let Some(dt) = crate::registry::get_datatype(name) else {
            return false;
        };
        self.datatype = Some(dt);
        self.window.clear();
        self.primed = false;
        self.base.put_output_attributes(self.output, &attrs);
        true
    }

    fn work(&mut self, out_port: PortId) -> bool {
        if !self.primed {
            while !self.condition.is_satisfied(&self.window) {
                let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
                match handle.get() {
                    Some(v) => self.window.add(Arc::new(v.clone())),
                    None => {
                        self.window.flush_out();
                        break;
                    }
                }
            }
            self.primed = true;
        } else {
            self.pull_one();
        }

        if !self.condition.is_satisfied(&self.window) {
            self.base.put_eos(out_port);
            return false;
        }

        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };

        let mut concatenated = Vec::new();
        let mut interval = crate::timestamp::Timestamp::invalid();
        for idx in -self.left..=self.right {
            let frame = match self.window.get(idx) {
                Some(v) => Arc::clone(v),
                None => self.margin_value(idx),
            };
            interval = interval.expand(&frame.interval());
            concatenated.extend_from_slice(&frame.data);
        }

        let out = Vector::with_data(dt, interval, concatenated);
        self.base.put_data(out_port, Arc::new(out));
        true
    }
}

/// Registers `generic-pass-through`, `generic-dump`, and
/// `generic-margin-window` under the builtin filter registry (§4.5 lookup
/// order (a)).
pub fn register_builtins() -> Result<(), crate::error::FlowError> {
    use std::cell::RefCell;
    use std::rc::Rc;

    crate::registry::register_filter("generic-pass-through", || Rc::new(RefCell::new(PassThroughNode::new())))?;
    crate::registry::register_filter("generic-dump", || Rc::new(RefCell::new(DumpNode::new())))?;
    crate::registry::register_filter("generic-margin-window", || {
        Rc::new(RefCell::new(MarginWindowNode::new(0, 0, MarginPolicy::Copy, MarginCondition::NotEmpty)))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Link, LinkMode};
    use crate::node::NodeHandle;
    use crate::registry::Datatype;
    use crate::timestamp::Timestamp;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_datatype() -> Arc<Datatype> {
        Arc::new(Datatype::new_internal("test-margin-f32", || unreachable!()))
    }

    #[test]
    fn passthrough_forwards_one_packet_then_reports_eos() {
        let dt = test_datatype();
        let mut node = PassThroughNode::new();
        let in_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let dummy_producer: NodeHandle = Rc::new(RefCell::new(PassThroughNode::new()));
        node.abstract_node().attach_input(0, Rc::clone(&in_link), dummy_producer, 0);
        node.abstract_node().attach_output(0, Rc::clone(&out_link), None);

        let packet = Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.0, 1.0), vec![1.0, 2.0]));
        in_link.put(packet);
        assert!(node.work(0));
        let forwarded = out_link.get().unwrap();
        let as_vector = forwarded.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert_eq!(as_vector.data, vec![1.0, 2.0]);

        in_link.put(crate::packet::eos());
        assert!(!node.work(0));
        assert!(crate::packet::is_eos(&out_link.get().unwrap()));
    }

    #[test]
    fn dump_node_reports_eos_when_input_unattached() {
        let dt = test_datatype();
        let mut node = DumpNode::new();
        let out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        node.abstract_node().attach_output(0, Rc::clone(&out_link), None);
        assert!(!node.work(0));
        assert!(crate::packet::is_sentinel(&out_link.get().unwrap()));
    }

    #[test]
    fn margin_window_copy_margin_duplicates_present_at_the_edge() {
        let dt = test_datatype();
        let mut node = MarginWindowNode::new(1, 1, MarginPolicy::Copy, MarginCondition::PresentNotEmpty);
        node.datatype = Some(dt.clone());

        let frame0 = Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.0, 1.0), vec![1.0, 1.0]));
        let frame1 = Arc::new(Vector::with_data(dt.clone(), Timestamp::new(1.0, 2.0), vec![2.0, 2.0]));
        node.window.add(frame0);
        node.window.add(frame1);

        // Only two frames seen so far (present plus one future lookahead);
        // no past neighbour exists yet, so copy-margin clamps to the oldest
        // frame buffered.
        assert_eq!(node.window.get(0).unwrap().data, vec![1.0, 1.0]);
        assert_eq!(node.window.get(1).unwrap().data, vec![2.0, 2.0]);
        let left_margin = node.window.get_with_copy_margin(-1);
        assert_eq!(left_margin.data, vec![1.0, 1.0]);
    }

    #[test]
    fn margin_window_zero_margin_fills_with_zeros_shaped_like_present() {
        let dt = test_datatype();
        let mut node = MarginWindowNode::new(1, 1, MarginPolicy::Zero, MarginCondition::PresentNotEmpty);
        node.datatype = Some(dt.clone());
        let frame0 = Arc::new(Vector::with_data(dt, Timestamp::new(0.0, 1.0), vec![3.0, 3.0, 3.0]));
        node.window.add(frame0);

        let zero_margin = node.margin_value(-1);
        assert_eq!(zero_margin.data, vec![0.0, 0.0, 0.0]);
    }
}
