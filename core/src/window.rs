//! Fixed-length overlapping frame extraction from a contiguous sample
//! stream, and the pluggable window functions applied to each frame.
//!
//! Grounded on the reference implementation's `Signal::WindowBuffer` (the
//! deque-backed frame accumulator) and `Signal::Window` (adds a tapering
//! function on top, recomputed whenever the configured length changes).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::node::{AbstractNode, Node, PortId};
use crate::packet::{Ref, TimestampedData, Vector};
use crate::timestamp::{Timestamp, TOLERANCE};

/// One extracted frame: an interval and its samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub interval: Timestamp,
    pub samples: Vec<f32>,
}

/// Accumulates a contiguous sample stream and emits overlapping
/// fixed-length frames.
///
/// `put` requires contiguous input (within [`TOLERANCE`] of the previous
/// packet's end time) unless `flush_before_gap` is false, in which case a
/// gap is filled with zeros instead of rejected.
#[derive(Debug)]
pub struct WindowBuffer {
    length: u32,
    shift: u32,
    buffer_start_time: f64,
    sample_rate: f64,
    flush_before_gap: bool,
    flush_all: bool,
    buffer: VecDeque<f32>,
    n_outputs: u32,
    flushed: bool,
    need_init: bool,
}

impl Default for WindowBuffer {
    fn default() -> Self {
        WindowBuffer {
            length: 0,
            shift: 0,
            buffer_start_time: 0.0,
            sample_rate: 0.0,
            flush_before_gap: true,
            flush_all: false,
            buffer: VecDeque::new(),
            n_outputs: 0,
            flushed: true,
            need_init: true,
        }
    }
}

impl WindowBuffer {
    /// A buffer with `length`/`shift` samples at `sample_rate` Hz.
    pub fn new(length: u32, shift: u32, sample_rate: f64) -> Self {
        let mut b = WindowBuffer::default();
        b.length = length;
        b.shift = shift;
        b.sample_rate = sample_rate;
        b
    }

    pub fn length(&self) -> u32 {
        self.length
    }
    pub fn set_length(&mut self, length: u32) {
        self.length = length;
    }
    pub fn shift(&self) -> u32 {
        self.shift
    }
    pub fn set_shift(&mut self, shift: u32) {
        self.shift = shift;
    }
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }
    pub fn flush_all(&self) -> bool {
        self.flush_all
    }
    pub fn set_flush_all(&mut self, flush_all: bool) {
        self.flush_all = flush_all;
    }
    pub fn flush_before_gap(&self) -> bool {
        self.flush_before_gap
    }
    pub fn set_flush_before_gap(&mut self, flush_before_gap: bool) {
        self.flush_before_gap = flush_before_gap;
    }
    /// True once `flush` has drained this segment completely.
    pub fn flushed(&self) -> bool {
        self.flushed
    }
    /// Number of frames emitted by `get`/`flush` since the last `reset`.
    pub fn n_outputs(&self) -> u32 {
        self.n_outputs
    }
    /// Forces the next `put`/`get`/`flush` to re-`init` first.
    pub fn set_need_init(&mut self) {
        self.need_init = true;
    }
    pub fn needs_init(&self) -> bool {
        self.need_init
    }

    /// Re-initializes bookkeeping, discarding any buffered samples.
    pub fn init(&mut self) {
        if self.sample_rate <= 0.0 {
            crate::abort_invariant!("WindowBuffer::init with non-positive sample rate {}", self.sample_rate);
        }
        self.reset();
        self.need_init = false;
    }

    /// Drops all buffered samples and output bookkeeping, keeping
    /// length/shift/sample-rate configuration.
    pub fn reset(&mut self) {
        self.n_outputs = 0;
        self.flushed = false;
        self.buffer.clear();
        self.buffer_start_time = 0.0;
    }

    fn lazy_init(&mut self) {
        if self.need_init {
            self.init();
        }
    }

    fn buffer_end_time(&self) -> f64 {
        self.buffer_start_time + self.buffer.len() as f64 / self.sample_rate
    }

    /// Appends `samples` starting at `start_time`. Returns `false` without
    /// modifying the buffer if `start_time` does not abut the buffered
    /// content and `flush_before_gap` is set; otherwise a gap is filled
    /// with zeros.
    pub fn put(&mut self, start_time: f64, samples: &[f32]) -> bool {
        self.lazy_init();
        if self.buffer.is_empty() {
            self.buffer_start_time = start_time;
        } else {
            let gap = start_time - self.buffer_end_time();
            if gap.abs() > TOLERANCE {
                if self.flush_before_gap {
                    return false;
                }
                let filler = (gap * self.sample_rate).round();
                if filler > 0.0 {
                    self.buffer.extend(std::iter::repeat(0.0f32).take(filler as usize));
                }
            }
        }
        self.buffer.extend(samples.iter().copied());
        true
    }

    fn copy(&mut self, length: usize) -> Frame {
        let length = length.min(self.buffer.len());
        let samples: Vec<f32> = self.buffer.iter().take(length).copied().collect();
        let start = self.buffer_start_time;
        let end = start + length as f64 / self.sample_rate;
        self.n_outputs += 1;
        Frame { interval: Timestamp::new(start, end), samples }
    }

    fn advance(&mut self, shift: usize) {
        let shift = shift.min(self.buffer.len());
        self.buffer.drain(0..shift);
        self.buffer_start_time += shift as f64 / self.sample_rate;
    }

    /// Emits one `length`-sample frame and drops `shift` samples, or
    /// returns `None` until the buffer holds at least
    /// `2 * max(shift, length)` samples.
    pub fn get(&mut self) -> Option<Frame> {
        self.lazy_init();
        let threshold = 2 * self.length.max(self.shift) as usize;
        if self.buffer.len() < threshold {
            return None;
        }
        let frame = self.copy(self.length as usize);
        self.advance(self.shift as usize);
        Some(frame)
    }

    /// Drains the tail once `get` can no longer produce a full frame.
    /// With `flush_all` set, frames (possibly shorter than `length`) are
    /// emitted shift-by-shift until the buffer is empty; otherwise a
    /// single, possibly-short final frame is emitted and the residue
    /// below `shift` is discarded. Must only be called once `get` has
    /// returned `None` for the current segment.
    pub fn flush(&mut self) -> Option<Frame> {
        self.lazy_init();
        let threshold = 2 * self.length.max(self.shift) as usize;
        if self.buffer.len() >= threshold {
            crate::abort_invariant!(
                "WindowBuffer::flush called while {} samples remain (>= threshold {}); call get() first",
                self.buffer.len(),
                threshold
            );
        }
        if self.buffer.is_empty() {
            self.flushed = true;
            return None;
        }
        self.flushed = if self.flush_all {
            self.shift as usize >= self.buffer.len()
        } else {
            self.length.max(self.shift) as usize >= self.buffer.len()
        };
        let frame = self.copy(self.length as usize);
        if self.flushed {
            self.need_init = true;
        } else {
            self.advance(self.shift as usize);
        }
        Some(frame)
    }
}

/// A tapering function applied to each emitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    Rectangular,
    Hamming,
    Hanning,
    Bartlett,
    Blackman,
}

impl WindowFunction {
    /// Computes `n` weights for this function.
    pub fn weights(self, n: usize) -> Vec<f32> {
        if n <= 1 {
            return vec![1.0; n];
        }
        let denom = (n - 1) as f32;
        (0..n)
            .map(|i| {
                let x = i as f32 / denom;
                match self {
                    WindowFunction::Rectangular => 1.0,
                    WindowFunction::Hamming => 0.54 - 0.46 * (2.0 * std::f32::consts::PI * x).cos(),
                    WindowFunction::Hanning => 0.5 - 0.5 * (2.0 * std::f32::consts::PI * x).cos(),
                    WindowFunction::Bartlett => 1.0 - (2.0 * x - 1.0).abs(),
                    WindowFunction::Blackman => {
                        0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
                            + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
                    }
                }
            })
            .collect()
    }
}

/// A [`WindowBuffer`] with a [`WindowFunction`] applied to each emitted
/// frame; length/shift are configured in seconds and converted to samples
/// whenever the sample rate or either duration changes.
#[derive(Debug)]
pub struct Window {
    buffer: WindowBuffer,
    length_in_s: f64,
    shift_in_s: f64,
    window_function: WindowFunction,
}

impl Window {
    pub fn new(window_function: WindowFunction) -> Self {
        Window { buffer: WindowBuffer::default(), length_in_s: 0.0, shift_in_s: 0.0, window_function }
    }

    pub fn set_window_function(&mut self, window_function: WindowFunction) {
        self.window_function = window_function;
    }

    pub fn set_length_in_s(&mut self, length: f64) {
        if self.length_in_s != length {
            self.length_in_s = length;
            self.buffer.set_need_init();
        }
    }
    pub fn length_in_s(&self) -> f64 {
        self.length_in_s
    }

    pub fn set_shift_in_s(&mut self, shift: f64) {
        if self.shift_in_s != shift {
            self.shift_in_s = shift;
            self.buffer.set_need_init();
        }
    }
    pub fn shift_in_s(&self) -> f64 {
        self.shift_in_s
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate <= 0.0 {
            crate::abort_invariant!("Window::set_sample_rate with non-positive rate {}", sample_rate);
        }
        if self.buffer.sample_rate() != sample_rate {
            self.buffer.set_sample_rate(sample_rate);
            self.buffer.set_need_init();
        }
    }
    pub fn sample_rate(&self) -> f64 {
        self.buffer.sample_rate()
    }

    pub fn set_flush_all(&mut self, flush_all: bool) {
        self.buffer.set_flush_all(flush_all);
    }
    pub fn set_flush_before_gap(&mut self, flush_before_gap: bool) {
        self.buffer.set_flush_before_gap(flush_before_gap);
    }

    fn prepare(&mut self) {
        if self.buffer.needs_init() {
            let sample_rate = self.buffer.sample_rate();
            self.buffer.set_length((self.length_in_s * sample_rate).round() as u32);
            self.buffer.set_shift((self.shift_in_s * sample_rate).round() as u32);
        }
    }

    fn apply_window(&self, frame: &mut Frame) {
        let weights = self.window_function.weights(frame.samples.len());
        for (sample, weight) in frame.samples.iter_mut().zip(weights) {
            *sample *= weight;
        }
    }

    pub fn put(&mut self, start_time: f64, samples: &[f32]) -> bool {
        self.prepare();
        self.buffer.put(start_time, samples)
    }

    pub fn get(&mut self) -> Option<Frame> {
        self.prepare();
        let mut frame = self.buffer.get()?;
        self.apply_window(&mut frame);
        Some(frame)
    }

    pub fn flush(&mut self) -> Option<Frame> {
        self.prepare();
        let mut frame = self.buffer.flush()?;
        self.apply_window(&mut frame);
        Some(frame)
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
    }
}

/// The `signal-window` filter: consumes a contiguous `Vector<f32>` sample
/// stream and emits overlapping, tapered frames via [`Window`].
///
/// Grounded on `Signal::WindowNode`: `sample-rate` is read from upstream
/// attributes rather than declared as a node parameter, matching the
/// reference's convention of inferring it from the stream rather than
/// requiring the network author to repeat it.
#[derive(Debug)]
pub struct WindowNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    window: Window,
    datatype: Option<Arc<crate::registry::Datatype>>,
    draining: bool,
}

impl WindowNode {
    pub fn new(window_function: WindowFunction) -> Self {
        let base = AbstractNode::new("signal-window");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        WindowNode { base, input, output, window: Window::new(window_function), datatype: None, draining: false }
    }

    fn emit(&mut self, out_port: PortId, frame: Frame) -> bool {
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let out = Vector::with_data(dt, frame.interval, frame.samples);
        self.base.put_data(out_port, Arc::new(out));
        true
    }
}

impl Node for WindowNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "length" => {
                if let Ok(v) = value.parse() {
                    self.window.set_length_in_s(v);
                    true
                } else {
                    false
                }
            }
            "shift" => {
                if let Ok(v) = value.parse() {
                    self.window.set_shift_in_s(v);
                    true
                } else {
                    false
                }
            }
            "flush-all" => {
                self.window.set_flush_all(value == "true" || value == "1");
                true
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        let Some(rate) = attrs.get(crate::attributes::keys::SAMPLE_RATE).and_then(|s| s.parse::<f64>().ok()) else {
            return false;
        };
        self.window.set_sample_rate(rate);
        self.window.reset();
        self.draining = false;

        let Some(name) = attrs.get(crate::attributes::keys::DATATYPE) else {
            return false;
        };
        self.datatype = crate::registry::get_datatype(name);

        let mut out_attrs = attrs;
        out_attrs.set(crate::attributes::keys::FRAME_SHIFT, self.window.shift_in_s().to_string());
        self.base.put_output_attributes(self.output, &out_attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        loop {
            if let Some(frame) = self.window.get() {
                return self.emit(out_port, frame);
            }
            if self.draining {
                return match self.window.flush() {
                    Some(frame) => self.emit(out_port, frame),
                    None => {
                        self.base.put_eos(out_port);
                        false
                    }
                };
            }
            let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
            match handle.get() {
                Some(v) => {
                    self.window.put(v.interval().start, &v.data);
                }
                None => self.draining = true,
            }
        }
    }
}

/// Registers `signal-window` under the builtin filter registry (§4.5
/// lookup order (a)), defaulting to a rectangular window; `window-type` is
/// not itself a settable parameter (choosing it requires a fresh `Window`),
/// so a network that needs tapering constructs the filter directly rather
/// than through this registration — see `DESIGN.md`.
pub fn register_builtins() -> Result<(), crate::error::FlowError> {
    use std::cell::RefCell;
    use std::rc::Rc;

    crate::registry::register_filter("signal-window", || Rc::new(RefCell::new(WindowNode::new(WindowFunction::Rectangular))))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_withholds_until_two_windows_worth_buffered() {
        let mut w = WindowBuffer::new(400, 160, 16000.0);
        assert!(w.put(0.0, &vec![1.0f32; 500]));
        assert!(w.get().is_none());
        assert!(w.put(500.0 / 16000.0, &vec![1.0f32; 300]));
        assert!(w.get().is_some());
    }

    #[test]
    fn put_rejects_noncontiguous_input_when_flush_before_gap() {
        let mut w = WindowBuffer::new(400, 160, 16000.0);
        assert!(w.put(0.0, &vec![1.0f32; 100]));
        assert!(!w.put(1.0, &vec![1.0f32; 100]));
    }

    #[test]
    fn put_fills_gap_with_zeros_when_flush_before_gap_disabled() {
        let mut w = WindowBuffer::new(4, 4, 16000.0);
        w.set_flush_before_gap(false);
        assert!(w.put(0.0, &[1.0, 1.0]));
        // one sample period of gap at 16000 Hz.
        assert!(w.put(2.0 / 16000.0 + 1.0 / 16000.0, &[1.0, 1.0]));
        assert_eq!(w.buffer.len(), 5);
        assert_eq!(w.buffer.back().copied(), Some(1.0));
    }

    // Self-consistent with spec.md's seed scenario 1 per-frame timing
    // (length=400, shift=160, sample_rate=16000: frame 0 is [0, 0.025),
    // frame 1 is [0.010, 0.035)), but applied to an internally consistent
    // sample count rather than the scenario's literal frame-count claim —
    // see DESIGN.md.
    #[test]
    fn frame_timing_matches_length_and_shift_in_seconds() {
        let mut w = WindowBuffer::new(400, 160, 16000.0);
        let total_samples = 800usize;
        assert!(w.put(0.0, &vec![1.0f32; total_samples]));

        let frame0 = w.get().expect("first frame available with 800 buffered samples");
        assert_eq!(frame0.samples.len(), 400);
        assert!(frame0.interval.approx_eq(&Timestamp::new(0.0, 0.025)));

        let frame1 = w.get().expect("second frame available after one shift");
        assert_eq!(frame1.samples.len(), 400);
        assert!(frame1.interval.approx_eq(&Timestamp::new(0.010, 0.035)));
    }

    #[test]
    fn flush_all_drains_shorter_tail_frames() {
        let mut w = WindowBuffer::new(4, 2, 16000.0);
        w.set_flush_all(true);
        assert!(w.put(0.0, &[1.0, 2.0, 3.0]));
        assert!(w.get().is_none());
        let first = w.flush().unwrap();
        assert_eq!(first.samples, vec![1.0, 2.0, 3.0]);
        assert!(!w.flushed());
        let second = w.flush().unwrap();
        assert_eq!(second.samples, vec![3.0]);
        assert!(w.flushed());
    }

    #[test]
    fn flush_without_flush_all_discards_short_residue() {
        let mut w = WindowBuffer::new(4, 2, 16000.0);
        assert!(w.put(0.0, &[1.0, 2.0, 3.0]));
        let frame = w.flush().unwrap();
        assert_eq!(frame.samples, vec![1.0, 2.0, 3.0]);
        assert!(w.flushed());
    }

    #[test]
    #[should_panic]
    fn flush_before_buffer_drained_by_get_panics() {
        let mut w = WindowBuffer::new(4, 2, 16000.0);
        assert!(w.put(0.0, &vec![1.0f32; 20]));
        w.flush();
    }

    #[test]
    fn rectangular_window_leaves_samples_unchanged() {
        let weights = WindowFunction::Rectangular.weights(5);
        assert_eq!(weights, vec![1.0; 5]);
    }

    #[test]
    fn hamming_window_tapers_edges_toward_zero() {
        let weights = WindowFunction::Hamming.weights(5);
        assert!(weights[0] < weights[2]);
        assert!(weights[4] < weights[2]);
        assert!((weights[0] - weights[4]).abs() < 1e-6);
    }

    #[test]
    fn window_recomputes_length_in_samples_from_seconds_and_rate() {
        let mut win = Window::new(WindowFunction::Rectangular);
        win.set_sample_rate(16000.0);
        win.set_length_in_s(0.025);
        win.set_shift_in_s(0.010);
        assert!(win.put(0.0, &vec![1.0f32; 800]));
        let frame = win.get().expect("frame available");
        assert_eq!(frame.samples.len(), 400);
        assert!(frame.interval.approx_eq(&Timestamp::new(0.0, 0.025)));
    }

    #[test]
    fn window_node_frames_a_sample_stream_from_upstream_attributes() {
        use crate::attributes::{keys, Attributes};
        use crate::link::{Link, LinkMode};
        use crate::node::NodeHandle;
        use crate::registry::Datatype;
        use std::cell::RefCell;
        use std::rc::Rc;

        let dt = Arc::new(Datatype::new_internal("window-test-f32", || unreachable!()));

        #[derive(Debug)]
        struct SampleSource {
            base: AbstractNode,
            out: PortId,
            dt: Arc<Datatype>,
            remaining: Vec<f32>,
        }
        impl Node for SampleSource {
            fn abstract_node(&self) -> &AbstractNode {
                &self.base
            }
            fn configure(&mut self) -> bool {
                let mut attrs = Attributes::new();
                attrs.set(keys::DATATYPE, self.dt.name.clone());
                attrs.set(keys::SAMPLE_RATE, "16000");
                self.base.put_output_attributes(self.out, &attrs);
                true
            }
            fn work(&mut self, out_port: PortId) -> bool {
                if self.remaining.is_empty() {
                    self.base.put_eos(out_port);
                    return false;
                }
                let chunk: Vec<f32> = self.remaining.drain(..).collect();
                let v = Vector::with_data(Arc::clone(&self.dt), Timestamp::new(0.0, chunk.len() as f64 / 16000.0), chunk);
                self.base.put_data(out_port, Arc::new(v));
                true
            }
        }

        let source_base = AbstractNode::new("source");
        let source_out = source_base.add_output_port("out");
        let source: NodeHandle = Rc::new(RefCell::new(SampleSource {
            base: source_base,
            out: source_out,
            dt: dt.clone(),
            remaining: vec![1.0f32; 800],
        }));

        let mut node = WindowNode::new(WindowFunction::Rectangular);
        node.set_parameter("length", "0.025");
        node.set_parameter("shift", "0.010");
        let link = Rc::new(Link::new(dt, LinkMode::Fast, 0));
        node.abstract_node().attach_input(0, Rc::clone(&link), Rc::clone(&source), 0);
        source.borrow().abstract_node().attach_output(0, link, None);

        assert!(node.configure());
        assert!(node.work(0));
    }
}
