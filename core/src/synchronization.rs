//! Aligning one stream to a "target" stream by timestamp.
//!
//! Grounded on the reference implementation's `Flow::SynchronizationNode<Algorithm>`
//! template (`Synchronization`, `TimestampCopy`) and `Signal::RepeatingFramePrediction`.
//! The reference factors the shared port layout, monotonicity check, and
//! ignore-errors handling into `SynchronizationNode<Algorithm>`, with `Algorithm`
//! supplying only the per-target-time `work` step. Rust has no ergonomic
//! equivalent of that mixin (a generic `Algorithm` parameter would need to
//! reach back into the node's own port-pulling, which the C++ does through
//! `virtual nextData`); each node here is a small concrete type instead,
//! at the cost of a few duplicated lines of port bookkeeping. See DESIGN.md.

use std::sync::Arc;

use crate::node::{AbstractNode, Node, PortId};
use crate::packet::{Ref, TimestampedData};
use crate::param::ParamBool;
use crate::timestamp::{Timestamp, TOLERANCE};

static PARAM_IGNORE_ERRORS: ParamBool =
    ParamBool::new("ignore-errors", "ignore it if the synchronization algorithm fails to produce an element", false);

/// Pulls from `in_port`, checking that start-times increase strictly
/// monotonically; logs once if the stream is empty on the very first pull.
fn next_monotonic<T: TimestampedData + Clone + 'static>(
    base: &AbstractNode,
    in_port: PortId,
    first: &mut bool,
    previous_start: &mut f64,
) -> Option<T> {
    let handle: Ref<T> = base.get_data(in_port);
    let value = handle.get()?.clone();
    let start = value.interval().start;
    if !*first && !(*previous_start < start - TOLERANCE) {
        crate::abort_invariant!("input start-times do not increase monotonously: {start} after {previous_start}");
    }
    *first = false;
    *previous_start = start;
    Some(value)
}

/// Discards input packets behind the target start-time, then emits the one
/// that matches it (or fails). See `spec.md` §4.8 "Synchronization".
#[derive(Debug)]
pub struct SynchronizationNode<T: TimestampedData + Clone + 'static> {
    base: AbstractNode,
    data_in: PortId,
    target_in: PortId,
    data_out: PortId,
    target_out: PortId,
    ignore_errors: bool,
    first: bool,
    previous_start: f64,
    last_error: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T: TimestampedData + Clone + 'static> SynchronizationNode<T> {
    /// Builds a synchronization node with empty in/out/target ports.
    pub fn new() -> Self {
        let base = AbstractNode::new("generic-synchronization");
        let data_in = base.add_input_port("in");
        let target_in = base.add_input_port("target");
        let data_out = base.add_output_port("out");
        let target_out = base.add_output_port("target");
        SynchronizationNode {
            base,
            data_in,
            target_in,
            data_out,
            target_out,
            ignore_errors: false,
            first: true,
            previous_start: f64::NEG_INFINITY,
            last_error: String::new(),
            _marker: std::marker::PhantomData,
        }
    }

    fn next_data(&mut self) -> Option<T> {
        next_monotonic::<T>(&self.base, self.data_in, &mut self.first, &mut self.previous_start)
    }

    /// Discards inputs whose start-time is significantly behind `target`,
    /// then returns the one matching it, or an error describing why none
    /// could be produced.
    fn step(&mut self, target: Timestamp) -> Result<T, String> {
        loop {
            let Some(value) = self.next_data() else {
                return Err(format!("input stream ended before the start-time {}", target.start));
            };
            let start = value.interval().start;
            if start < target.start - TOLERANCE {
                continue;
            }
            if (start - target.start).abs() < TOLERANCE {
                return Ok(value);
            }
            return Err(format!("input stream has no element with the start-time {}", target.start));
        }
    }
}

impl<T: TimestampedData + Clone + 'static> Default for SynchronizationNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimestampedData + Clone + 'static> Node for SynchronizationNode<T> {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        if PARAM_IGNORE_ERRORS.matches(name) {
            self.ignore_errors = PARAM_IGNORE_ERRORS.parse(value);
            true
        } else {
            false
        }
    }

    fn configure(&mut self) -> bool {
        self.first = true;
        self.previous_start = f64::NEG_INFINITY;
        for port in [self.data_in, self.target_in] {
            let attrs = self.base.get_input_attributes(port);
            self.base.put_output_attributes(port, &attrs);
        }
        true
    }

    fn work(&mut self, _out_port: PortId) -> bool {
        let target_handle: Ref<T> = self.base.get_data(self.target_in);
        let Some(target) = target_handle.get().cloned() else {
            self.base.put_eos(self.data_out);
            self.base.put_eos(self.target_out);
            return false;
        };
        match self.step(target.interval()) {
            Ok(value) => {
                self.base.put_data(self.data_out, Arc::new(value));
                self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
                true
            }
            Err(message) => {
                self.last_error = message;
                if !self.ignore_errors {
                    tracing::error!(node = %self.base.name(), error = %self.last_error, "synchronization failed");
                }
                self.base.put_eos(self.data_out);
                self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
                false
            }
        }
    }
}

/// Copies the target stream's timestamps onto the next input packet.
/// See `spec.md` §4.8 "TimestampCopy".
#[derive(Debug)]
pub struct TimestampCopyNode<T: TimestampedData + Clone + 'static> {
    base: AbstractNode,
    data_in: PortId,
    target_in: PortId,
    data_out: PortId,
    target_out: PortId,
    first: bool,
    previous_start: f64,
}

impl<T: TimestampedData + Clone + 'static> TimestampCopyNode<T> {
    /// Builds a timestamp-copy node with empty in/out/target ports.
    pub fn new() -> Self {
        let base = AbstractNode::new("timestamp-copy");
        let data_in = base.add_input_port("in");
        let target_in = base.add_input_port("target");
        let data_out = base.add_output_port("out");
        let target_out = base.add_output_port("target");
        TimestampCopyNode {
            base,
            data_in,
            target_in,
            data_out,
            target_out,
            first: true,
            previous_start: f64::NEG_INFINITY,
        }
    }

    fn next_data(&mut self) -> Option<T> {
        next_monotonic::<T>(&self.base, self.data_in, &mut self.first, &mut self.previous_start)
    }
}

impl<T: TimestampedData + Clone + 'static> Default for TimestampCopyNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimestampedData + Clone + 'static> Node for TimestampCopyNode<T> {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn configure(&mut self) -> bool {
        self.first = true;
        self.previous_start = f64::NEG_INFINITY;
        for port in [self.data_in, self.target_in] {
            let attrs = self.base.get_input_attributes(port);
            self.base.put_output_attributes(port, &attrs);
        }
        true
    }

    fn work(&mut self, _out_port: PortId) -> bool {
        let target_handle: Ref<T> = self.base.get_data(self.target_in);
        let Some(target) = target_handle.get().cloned() else {
            self.base.put_eos(self.data_out);
            self.base.put_eos(self.target_out);
            return false;
        };
        let Some(mut value) = self.next_data() else {
            tracing::error!(node = %self.base.name(), "input stream ended before target stream");
            self.base.put_eos(self.data_out);
            self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
            return false;
        };
        value.set_interval(target.interval());
        self.base.put_data(self.data_out, Arc::new(value));
        self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
        true
    }
}

static PARAM_PREDICT_ONLY_MISSING: ParamBool =
    ParamBool::new("predict-only-missing", "only repeat the previous input where the target has no matching start-time", true);
static PARAM_SYNC_END_TIMES: ParamBool =
    ParamBool::new("sync-end-times", "give a repeated element the target's end-time instead of its start-time", false);

/// Repeats the most recent input value to cover target times the input
/// stream has no element for. See `spec.md` §4.8 "RepeatingFramePrediction".
#[derive(Debug)]
pub struct RepeatingFramePredictionNode<T: TimestampedData + Clone + 'static> {
    base: AbstractNode,
    data_in: PortId,
    target_in: PortId,
    data_out: PortId,
    target_out: PortId,
    predict_only_missing: bool,
    sync_end_times: bool,
    /// An input value pulled ahead of the target time currently being
    /// processed, buffered until a target time reaches or passes it.
    pending: Option<T>,
    /// The most recently consumed input value, repeated when no input is
    /// available yet for the current target time.
    last: Option<T>,
}

impl<T: TimestampedData + Clone + 'static> RepeatingFramePredictionNode<T> {
    /// Builds a prediction node with empty in/out/target ports.
    pub fn new() -> Self {
        let base = AbstractNode::new("signal-repeating-frame-prediction");
        let data_in = base.add_input_port("in");
        let target_in = base.add_input_port("target");
        let data_out = base.add_output_port("out");
        let target_out = base.add_output_port("target");
        RepeatingFramePredictionNode {
            base,
            data_in,
            target_in,
            data_out,
            target_out,
            predict_only_missing: true,
            sync_end_times: false,
            pending: None,
            last: None,
        }
    }

    fn pull_input(&self) -> Option<T> {
        let handle: Ref<T> = self.base.get_data(self.data_in);
        handle.get().cloned()
    }
}

impl<T: TimestampedData + Clone + 'static> Default for RepeatingFramePredictionNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimestampedData + Clone + 'static> Node for RepeatingFramePredictionNode<T> {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        if PARAM_PREDICT_ONLY_MISSING.matches(name) {
            self.predict_only_missing = PARAM_PREDICT_ONLY_MISSING.parse(value);
            true
        } else if PARAM_SYNC_END_TIMES.matches(name) {
            self.sync_end_times = PARAM_SYNC_END_TIMES.parse(value);
            true
        } else {
            false
        }
    }

    fn configure(&mut self) -> bool {
        self.pending = None;
        self.last = None;
        for port in [self.data_in, self.target_in] {
            let attrs = self.base.get_input_attributes(port);
            self.base.put_output_attributes(port, &attrs);
        }
        true
    }

    fn work(&mut self, _out_port: PortId) -> bool {
        let target_handle: Ref<T> = self.base.get_data(self.target_in);
        let Some(target) = target_handle.get().cloned() else {
            self.base.put_eos(self.data_out);
            self.base.put_eos(self.target_out);
            return false;
        };
        let t = target.interval().start;

        if self.pending.is_none() {
            self.pending = self.pull_input();
        }

        let mut emitted_verbatim = None;
        if let Some(candidate) = &self.pending {
            if candidate.interval().start <= t + TOLERANCE {
                let value = self.pending.take().unwrap();
                let matches_exactly = (value.interval().start - t).abs() < TOLERANCE;
                self.last = Some(value.clone());
                if self.predict_only_missing && matches_exactly {
                    emitted_verbatim = Some(value);
                }
            }
        }

        let out_value = match emitted_verbatim {
            Some(value) => value,
            None => match &self.last {
                Some(last) => {
                    let mut value = last.clone();
                    let end = if self.sync_end_times { target.interval().end } else { t };
                    value.set_interval(Timestamp::new(t, end));
                    value
                }
                None => {
                    self.base.put_eos(self.data_out);
                    self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
                    return false;
                }
            },
        };
        self.base.put_data(self.data_out, Arc::new(out_value));
        self.base.put_data(self.target_out, Arc::clone(target_handle.raw()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Link, LinkMode};
    use crate::node::NodeHandle;
    use crate::packet::{eos, Vector};
    use crate::registry::Datatype;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_datatype() -> Arc<Datatype> {
        Arc::new(Datatype::new_internal("test-sync-f32", || unreachable!()))
    }

    #[derive(Debug)]
    struct StubSource;
    impl Node for StubSource {
        fn abstract_node(&self) -> &AbstractNode {
            unreachable!("stub is never asked for its own state")
        }
        fn configure(&mut self) -> bool {
            true
        }
        fn work(&mut self, _out_port: PortId) -> bool {
            false
        }
    }

    fn stub() -> NodeHandle {
        Rc::new(RefCell::new(StubSource))
    }

    fn wire<N: Node>(
        node: &N,
        data_link: &Rc<Link>,
        target_link: &Rc<Link>,
        out_link: &Rc<Link>,
        target_out_link: &Rc<Link>,
    ) {
        let base = node.abstract_node();
        base.attach_input(0, Rc::clone(data_link), stub(), 0);
        base.attach_input(1, Rc::clone(target_link), stub(), 0);
        base.attach_output(0, Rc::clone(out_link), None);
        base.attach_output(1, Rc::clone(target_out_link), None);
    }

    #[test]
    fn synchronization_discards_inputs_behind_the_target_and_matches_by_start_time() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        for (s, e, v) in [(0.00, 0.01, 1.0f32), (0.01, 0.02, 2.0), (0.02, 0.03, 3.0)] {
            data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(s, e), vec![v])));
        }
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.02, 0.03), vec![])));

        let mut node: SynchronizationNode<Vector<f32>> = SynchronizationNode::new();
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        assert!(node.work(0));
        let packet = out_link.get().unwrap();
        let v = packet.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert_eq!(v.data, vec![3.0]);
    }

    #[test]
    fn synchronization_fails_and_emits_eos_when_no_input_matches() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.00, 0.01), vec![1.0f32])));
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.05, 0.06), vec![])));

        let mut node: SynchronizationNode<Vector<f32>> = SynchronizationNode::new();
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        node.ignore_errors = true;
        assert!(!node.work(0));
        assert!(crate::packet::is_eos(&out_link.get().unwrap()));
    }

    #[test]
    fn synchronization_forwards_eos_once_target_stream_ends() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        target_link.put(eos());

        let mut node: SynchronizationNode<Vector<f32>> = SynchronizationNode::new();
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        assert!(!node.work(0));
        assert!(crate::packet::is_eos(&out_link.get().unwrap()));
        assert!(crate::packet::is_eos(&target_out_link.get().unwrap()));
    }

    #[test]
    fn timestamp_copy_overwrites_interval_with_targets() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.00, 0.01), vec![1.0f32, 2.0])));
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(1.00, 1.01), vec![])));

        let mut node: TimestampCopyNode<Vector<f32>> = TimestampCopyNode::new();
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        assert!(node.work(0));
        let packet = out_link.get().unwrap();
        let v = packet.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert_eq!(v.data, vec![1.0, 2.0]);
        assert!(v.interval().approx_eq(&Timestamp::new(1.00, 1.01)));
    }

    #[test]
    fn repeating_frame_prediction_repeats_the_last_input_for_unmatched_targets() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.00, 0.01), vec![1.0f32])));
        data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.02, 0.03), vec![2.0f32])));
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        for (s, e) in [(0.00, 0.01), (0.01, 0.02), (0.02, 0.03), (0.03, 0.04)] {
            target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(s, e), vec![])));
        }

        let mut node: RepeatingFramePredictionNode<Vector<f32>> = RepeatingFramePredictionNode::new();
        node.predict_only_missing = true;
        node.sync_end_times = false;
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        for want in [1.0f32, 1.0, 2.0, 2.0] {
            assert!(node.work(0));
            let packet = out_link.get().unwrap();
            let v = packet.as_any().downcast_ref::<Vector<f32>>().unwrap();
            assert_eq!(v.data, vec![want]);
        }
    }

    #[test]
    fn repeating_frame_prediction_copies_target_end_time_when_requested() {
        let dt = test_datatype();
        let data_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        data_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.00, 0.01), vec![1.0f32])));
        let target_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.00, 0.01), vec![])));
        target_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.01, 0.05), vec![])));

        let mut node: RepeatingFramePredictionNode<Vector<f32>> = RepeatingFramePredictionNode::new();
        node.predict_only_missing = true;
        node.sync_end_times = true;
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let target_out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        wire(&node, &data_link, &target_link, &out_link, &target_out_link);

        assert!(node.work(0));
        let _ = out_link.get().unwrap();
        assert!(node.work(0));
        let packet = out_link.get().unwrap();
        let v = packet.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert!(v.interval().approx_eq(&Timestamp::new(0.01, 0.05)));
    }
}
