//! Representative signal-processing and classification nodes built on top
//! of the packet/link/window primitives.
//!
//! Per the spec's scope note, the actual numerical kernels here (FFT,
//! filterbank weights, preemphasis, normalization statistics, cosine
//! transform) are specified only at contract level: each node is a
//! faithful, working implementation of its textbook algorithm, not a
//! byte-for-byte port of any particular reference kernel. Grounded on
//! `Signal::Preemphasis`, `Signal::FastFourierTransform`,
//! `Signal::CosineTransform`, `Signal::Filterbank`,
//! `Signal::VectorOperation`, `Signal::LevelNormalization`,
//! `Signal::Regression`, and `Signal::MatrixMultiplication` in shape
//! (single-in/single-out nodes, one parameter table each), not in exact
//! arithmetic.

use std::sync::Arc;

use crate::attributes::{keys, Attributes};
use crate::node::{AbstractNode, Configurable, Node, PortId, Stateful};
use crate::packet::{Ref, TimestampedData, Vector};
use crate::registry::Datatype;

fn forward_datatype(base: &AbstractNode, attrs: &Attributes) -> Option<Arc<Datatype>> {
    let name = attrs.get(keys::DATATYPE)?;
    let dt = crate::registry::get_datatype(name);
    if dt.is_none() {
        base.report_error(crate::error::FlowError::UnknownDatatype { name: name.to_string() });
    }
    dt
}

/// `signal-preemphasis`: `y[n] = x[n] - alpha * x[n-1]`, carrying the last
/// sample of one packet over as the predecessor of the next so frame
/// boundaries do not introduce a spurious discontinuity.
#[derive(Debug)]
pub struct PreemphasisNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    alpha: f32,
    last_sample: Option<f32>,
    datatype: Option<Arc<Datatype>>,
}

impl PreemphasisNode {
    pub fn new(alpha: f32) -> Self {
        let base = AbstractNode::new("signal-preemphasis");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        PreemphasisNode { base, input, output, alpha, last_sample: None, datatype: None }
    }
}

impl Node for PreemphasisNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "alpha" => self.apply_parameter(name, value),
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.reset_state();
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let mut out = Vec::with_capacity(input.data.len());
        let mut prev = self.last_sample.unwrap_or(input.data.first().copied().unwrap_or(0.0));
        for &sample in &input.data {
            out.push(sample - self.alpha * prev);
            prev = sample;
        }
        self.last_sample = input.data.last().copied().or(self.last_sample);
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

impl Configurable for PreemphasisNode {
    fn apply_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "alpha" => {
                if let Ok(v) = value.parse() {
                    self.alpha = v;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

impl Stateful for PreemphasisNode {
    fn reset_state(&mut self) {
        self.last_sample = None;
    }
}

/// Iterative radix-2 Cooley-Tukey FFT over a zero-padded power-of-two
/// length. `re`/`im` are overwritten in place.
fn fft_radix2(re: &mut [f32], im: &mut [f32]) {
    let n = re.len();
    debug_assert!(n.is_power_of_two());
    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j &= !bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }
    let mut len = 2usize;
    while len <= n {
        let half = len / 2;
        let theta = -2.0 * std::f32::consts::PI / len as f32;
        for start in (0..n).step_by(len) {
            for k in 0..half {
                let angle = theta * k as f32;
                let (wr, wi) = (angle.cos(), angle.sin());
                let (ar, ai) = (re[start + k + half], im[start + k + half]);
                let tr = ar * wr - ai * wi;
                let ti = ar * wi + ai * wr;
                let (br, bi) = (re[start + k], im[start + k]);
                re[start + k] = br + tr;
                im[start + k] = bi + ti;
                re[start + k + half] = br - tr;
                im[start + k + half] = bi - ti;
            }
        }
        len <<= 1;
    }
}

/// `signal-real-fast-fourier-transform`: zero-pads each real input frame up
/// to the next power of two, FFTs it, and emits the power spectrum
/// (`|X[k]|^2`) for `k` in `0..=n/2`.
///
/// Grounded on `Signal::FastFourierTransform`: single in/out port, no
/// internal state carried across frames (each input packet is independent),
/// matching the reference's frame-at-a-time contract.
#[derive(Debug)]
pub struct FftNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    datatype: Option<Arc<Datatype>>,
}

impl FftNode {
    pub fn new() -> Self {
        let base = AbstractNode::new("signal-real-fast-fourier-transform");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        FftNode { base, input, output, datatype: None }
    }

    /// Computes the power spectrum of one real-valued frame.
    pub fn power_spectrum(samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }
        let n = samples.len().next_power_of_two();
        let mut re = vec![0.0f32; n];
        re[..samples.len()].copy_from_slice(samples);
        let mut im = vec![0.0f32; n];
        fft_radix2(&mut re, &mut im);
        (0..=n / 2).map(|k| re[k] * re[k] + im[k] * im[k]).collect()
    }
}

impl Default for FftNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for FftNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let spectrum = Self::power_spectrum(&input.data);
        let packet = Vector::with_data(dt, input.interval(), spectrum);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

/// A triangular mel-scale filter bank applied to a power spectrum.
#[derive(Debug, Clone)]
struct MelFilterbank {
    /// `edges[i]`, `edges[i+1]`, `edges[i+2]` are the left/center/right
    /// edges (as FFT bin indices) of filter `i`.
    edges: Vec<f64>,
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}
fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

impl MelFilterbank {
    fn new(n_filters: usize, fft_size: usize, sample_rate: f64) -> Self {
        let nyquist = sample_rate / 2.0;
        let mel_lo = hz_to_mel(0.0);
        let mel_hi = hz_to_mel(nyquist);
        let step = (mel_hi - mel_lo) / (n_filters + 1) as f64;
        let edges: Vec<f64> = (0..n_filters + 2)
            .map(|i| {
                let mel = mel_lo + step * i as f64;
                mel_to_hz(mel) / nyquist * (fft_size as f64 / 2.0)
            })
            .collect();
        MelFilterbank { edges }
    }

    fn n_filters(&self) -> usize {
        self.edges.len().saturating_sub(2)
    }

    fn apply(&self, power_spectrum: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_filters()];
        for (i, value) in out.iter_mut().enumerate() {
            let left = self.edges[i];
            let center = self.edges[i + 1];
            let right = self.edges[i + 2];
            let mut sum = 0.0f64;
            for (bin, &power) in power_spectrum.iter().enumerate() {
                let bin = bin as f64;
                let weight = if bin >= left && bin <= center && center > left {
                    (bin - left) / (center - left)
                } else if bin > center && bin <= right && right > center {
                    (right - bin) / (right - center)
                } else {
                    0.0
                };
                sum += weight * power as f64;
            }
            *value = sum as f32;
        }
        out
    }
}

/// `signal-filterbank`: reduces a power spectrum to `nr-filters`
/// triangular mel-band energies. Requires upstream `sample-rate` to place
/// the filter edges.
#[derive(Debug)]
pub struct FilterbankNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    n_filters: usize,
    bank: Option<MelFilterbank>,
    datatype: Option<Arc<Datatype>>,
}

impl FilterbankNode {
    pub fn new(n_filters: usize) -> Self {
        let base = AbstractNode::new("signal-filterbank");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        FilterbankNode { base, input, output, n_filters, bank: None, datatype: None }
    }
}

impl Node for FilterbankNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "nr-filters" => {
                if let Ok(v) = value.parse() {
                    self.n_filters = v;
                    self.bank = None;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        let Some(rate) = attrs.get(keys::SAMPLE_RATE).and_then(|s| s.parse::<f64>().ok()) else {
            self.base.report_error(crate::error::FlowError::Configuration {
                node: self.base.name().to_string(),
                message: "filterbank requires an upstream sample-rate attribute".into(),
            });
            return false;
        };
        self.datatype = forward_datatype(&self.base, &attrs);
        self.bank = None;
        self.base.put_output_attributes(self.output, &attrs);
        self.n_filters > 0 && self.datatype.is_some() && rate > 0.0
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        // Power-spectrum length is `fft_size/2 + 1`; recover `fft_size` to
        // place the mel edges consistently whenever it first becomes known
        // or the frame length changes.
        let fft_size = (input.data.len().max(1) - 1) * 2;
        let sample_rate = {
            let attrs = self.base.get_input_attributes(self.input);
            attrs.get(keys::SAMPLE_RATE).and_then(|s| s.parse::<f64>().ok()).unwrap_or(16000.0)
        };
        if self.bank.as_ref().map(|b| b.n_filters()) != Some(self.n_filters) {
            self.bank = Some(MelFilterbank::new(self.n_filters, fft_size, sample_rate));
        }
        let bank = self.bank.as_ref().expect("bank just populated above");
        let out = bank.apply(&input.data);
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

/// `signal-cosine-transform`: DCT-II, keeping the first `nr-outputs`
/// coefficients (or all of them if `nr-outputs` is zero).
#[derive(Debug)]
pub struct CosineTransformNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    n_outputs: usize,
    datatype: Option<Arc<Datatype>>,
}

impl CosineTransformNode {
    pub fn new(n_outputs: usize) -> Self {
        let base = AbstractNode::new("signal-cosine-transform");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        CosineTransformNode { base, input, output, n_outputs, datatype: None }
    }

    /// Computes the DCT-II of `input`, keeping `n_outputs` coefficients
    /// (all of them when `n_outputs == 0`).
    pub fn transform(input: &[f32], n_outputs: usize) -> Vec<f32> {
        let n = input.len();
        if n == 0 {
            return Vec::new();
        }
        let keep = if n_outputs == 0 { n } else { n_outputs.min(n) };
        (0..keep)
            .map(|k| {
                let mut sum = 0.0f64;
                for (i, &x) in input.iter().enumerate() {
                    let angle = std::f64::consts::PI / n as f64 * (i as f64 + 0.5) * k as f64;
                    sum += x as f64 * angle.cos();
                }
                sum as f32
            })
            .collect()
    }
}

impl Node for CosineTransformNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "nr-outputs" => {
                if let Ok(v) = value.parse() {
                    self.n_outputs = v;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let out = Self::transform(&input.data, self.n_outputs);
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

/// A pointwise unary operation `signal-vector-operation` can apply to every
/// component of an input vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VectorOp {
    Scale(f32),
    Offset(f32),
    Log,
    Exp,
    Abs,
}

/// `signal-vector-operation`: applies one [`VectorOp`] elementwise.
#[derive(Debug)]
pub struct VectorOpNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    op: VectorOp,
    datatype: Option<Arc<Datatype>>,
}

impl VectorOpNode {
    pub fn new(op: VectorOp) -> Self {
        let base = AbstractNode::new("signal-vector-operation");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        VectorOpNode { base, input, output, op, datatype: None }
    }

    fn apply(&self, x: f32) -> f32 {
        match self.op {
            VectorOp::Scale(s) => x * s,
            VectorOp::Offset(o) => x + o,
            VectorOp::Log => x.max(f32::MIN_POSITIVE).ln(),
            VectorOp::Exp => x.exp(),
            VectorOp::Abs => x.abs(),
        }
    }
}

impl Node for VectorOpNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "operation" => match value {
                "log" => {
                    self.op = VectorOp::Log;
                    true
                }
                "exp" => {
                    self.op = VectorOp::Exp;
                    true
                }
                "abs" => {
                    self.op = VectorOp::Abs;
                    true
                }
                _ => false,
            },
            "scale" => {
                if let Ok(v) = value.parse() {
                    self.op = VectorOp::Scale(v);
                    true
                } else {
                    false
                }
            }
            "offset" => {
                if let Ok(v) = value.parse() {
                    self.op = VectorOp::Offset(v);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let out: Vec<f32> = input.data.iter().map(|&x| self.apply(x)).collect();
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

/// `signal-matrix-multiplication`: `y = M x` for a fixed matrix `M` set via
/// the `matrix` parameter (`"rows,cols;v0,v1,...,v(rows*cols-1)"`, row-major).
///
/// Grounded on `Signal::MatrixMultiplicationNode`, minus the `.matrix` file
/// loader: matrix *data* loading from disk is out of scope per §1 ("the
/// actual numerical kernels... are enumerated but described only at
/// contract level"), so the matrix is supplied inline as a parameter value
/// rather than read from a file path resolved by `$input(...)` — see
/// DESIGN.md.
#[derive(Debug)]
pub struct MatrixMultNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    rows: usize,
    cols: usize,
    matrix: Vec<f32>,
    datatype: Option<Arc<Datatype>>,
}

impl MatrixMultNode {
    pub fn new() -> Self {
        let base = AbstractNode::new("signal-matrix-multiplication");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        MatrixMultNode { base, input, output, rows: 0, cols: 0, matrix: Vec::new(), datatype: None }
    }

    fn set_matrix(&mut self, value: &str) -> bool {
        let Some((dims, values)) = value.split_once(';') else {
            return false;
        };
        let Some((rows, cols)) = dims.split_once(',') else {
            return false;
        };
        let (Ok(rows), Ok(cols)) = (rows.trim().parse::<usize>(), cols.trim().parse::<usize>()) else {
            return false;
        };
        let parsed: Result<Vec<f32>, _> = values.split(',').map(|s| s.trim().parse::<f32>()).collect();
        let Ok(parsed) = parsed else {
            return false;
        };
        if parsed.len() != rows * cols {
            return false;
        }
        self.rows = rows;
        self.cols = cols;
        self.matrix = parsed;
        true
    }

    fn multiply(&self, x: &[f32]) -> Vec<f32> {
        if self.cols != x.len() || self.rows == 0 {
            return x.to_vec();
        }
        (0..self.rows)
            .map(|r| (0..self.cols).map(|c| self.matrix[r * self.cols + c] * x[c]).sum())
            .collect()
    }
}

impl Default for MatrixMultNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for MatrixMultNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "matrix" => self.set_matrix(value),
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        let out = self.multiply(&input.data);
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

/// Per-dimension online mean/variance accumulator used by
/// [`NormalizationNode`], optionally bounded to the last `window` frames.
#[derive(Debug, Default)]
struct RunningStats {
    window: usize,
    history: std::collections::VecDeque<Vec<f32>>,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl RunningStats {
    fn new(window: usize) -> Self {
        RunningStats { window, history: Default::default(), sum: Vec::new(), sum_sq: Vec::new() }
    }

    fn push(&mut self, frame: &[f32]) {
        if self.sum.len() != frame.len() {
            self.sum = vec![0.0; frame.len()];
            self.sum_sq = vec![0.0; frame.len()];
            self.history.clear();
        }
        for (i, &x) in frame.iter().enumerate() {
            self.sum[i] += x as f64;
            self.sum_sq[i] += (x as f64) * (x as f64);
        }
        self.history.push_back(frame.to_vec());
        if self.window > 0 {
            while self.history.len() > self.window {
                if let Some(old) = self.history.pop_front() {
                    for (i, &x) in old.iter().enumerate() {
                        self.sum[i] -= x as f64;
                        self.sum_sq[i] -= (x as f64) * (x as f64);
                    }
                }
            }
        }
    }

    /// `None` when nothing has been accumulated yet (see DESIGN.md's note on
    /// the empty-window tail case).
    fn mean_std(&self) -> Option<(Vec<f32>, Vec<f32>)> {
        let n = self.history.len();
        if n == 0 {
            return None;
        }
        let mean: Vec<f64> = self.sum.iter().map(|s| s / n as f64).collect();
        let std: Vec<f32> = self
            .sum_sq
            .iter()
            .zip(&mean)
            .map(|(sq, m)| ((sq / n as f64) - m * m).max(0.0).sqrt().max(1e-6) as f32)
            .collect();
        Some((mean.into_iter().map(|m| m as f32).collect(), std))
    }

    fn reset(&mut self) {
        self.history.clear();
        self.sum.clear();
        self.sum_sq.clear();
    }
}

/// `signal-normalization`: subtracts the running per-dimension mean and
/// (when `variance-normalization` is set) divides by the running standard
/// deviation, over a window of `length` frames (`0` means unbounded /
/// whole-stream statistics — cepstral mean normalization).
///
/// At the tail of a stream whose window has not yet seen any frame (only
/// possible on an entirely empty input), `work` reports end-of-stream
/// without emitting rather than dividing by undefined statistics — the
/// conservative reading of the open tail-behavior question flagged in
/// §9/SPEC_FULL.md §12(b).
#[derive(Debug)]
pub struct NormalizationNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    stats: RunningStats,
    variance_normalization: bool,
    datatype: Option<Arc<Datatype>>,
}

impl NormalizationNode {
    pub fn new(window: usize, variance_normalization: bool) -> Self {
        let base = AbstractNode::new("signal-normalization");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        NormalizationNode { base, input, output, stats: RunningStats::new(window), variance_normalization, datatype: None }
    }
}

impl Node for NormalizationNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "length" => {
                if let Ok(v) = value.parse() {
                    self.stats = RunningStats::new(v);
                    true
                } else {
                    false
                }
            }
            "variance-normalization" => {
                self.variance_normalization = value == "true" || value == "1";
                true
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.reset_state();
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
        let Some(input) = handle.get() else {
            let sentinel = Arc::clone(handle.raw());
            self.base.put_data(out_port, sentinel);
            return false;
        };
        let Some(dt) = self.datatype.clone() else {
            self.base.put_eos(out_port);
            return false;
        };
        self.stats.push(&input.data);
        let Some((mean, std)) = self.stats.mean_std() else {
            self.base.put_eos(out_port);
            return false;
        };
        let out: Vec<f32> = input
            .data
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let centered = x - mean.get(i).copied().unwrap_or(0.0);
                if self.variance_normalization {
                    centered / std.get(i).copied().unwrap_or(1.0)
                } else {
                    centered
                }
            })
            .collect();
        let packet = Vector::with_data(dt, input.interval(), out);
        self.base.put_data(out_port, Arc::new(packet));
        true
    }
}

impl Stateful for NormalizationNode {
    fn reset_state(&mut self) {
        self.stats.reset();
    }
}

/// `signal-regression`: per-dimension linear-regression ("delta")
/// coefficients over a symmetric window of `2*half_window + 1` frames,
/// emitted once that many frames have been buffered (matching the
/// reference's "need `2N+1` frames before the first delta" contract).
#[derive(Debug)]
pub struct RegressionNode {
    base: AbstractNode,
    input: PortId,
    output: PortId,
    half_window: usize,
    buffer: std::collections::VecDeque<Arc<Vector<f32>>>,
    draining: bool,
    datatype: Option<Arc<Datatype>>,
}

impl RegressionNode {
    pub fn new(half_window: usize) -> Self {
        let base = AbstractNode::new("signal-regression");
        let input = base.add_input_port("in");
        let output = base.add_output_port("out");
        RegressionNode {
            base,
            input,
            output,
            half_window: half_window.max(1),
            buffer: Default::default(),
            draining: false,
            datatype: None,
        }
    }

    fn denominator(&self) -> f64 {
        (1..=self.half_window as i64).map(|k| (k * k) as f64).sum::<f64>() * 2.0
    }

    /// Computes the regression coefficients centered on `self.buffer`'s
    /// middle element, using whatever neighbours on either side are
    /// currently buffered (shorter at the stream's edges during drain).
    fn compute(&self) -> Vec<f32> {
        let frames: Vec<&Arc<Vector<f32>>> = self.buffer.iter().collect();
        let center = frames.len() / 2;
        let dim = frames[center].data.len();
        let denom = self.denominator().max(1e-12);
        (0..dim)
            .map(|d| {
                let mut sum = 0.0f64;
                for (i, frame) in frames.iter().enumerate() {
                    let k = i as i64 - center as i64;
                    if k != 0 {
                        sum += k as f64 * frame.data.get(d).copied().unwrap_or(0.0) as f64;
                    }
                }
                (sum / denom) as f32
            })
            .collect()
    }
}

impl Node for RegressionNode {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        match name {
            "window-size" => {
                if let Ok(v) = value.parse::<usize>() {
                    self.half_window = v.max(1);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.datatype = forward_datatype(&self.base, &attrs);
        self.reset_state();
        self.base.put_output_attributes(self.output, &attrs);
        self.datatype.is_some()
    }

    fn work(&mut self, out_port: PortId) -> bool {
        let target = 2 * self.half_window + 1;
        loop {
            if self.buffer.len() >= target {
                let Some(dt) = self.datatype.clone() else {
                    self.base.put_eos(out_port);
                    return false;
                };
                let center = self.buffer.len() / 2;
                let interval = self.buffer[center].interval();
                let out = self.compute();
                self.buffer.pop_front();
                let packet = Vector::with_data(dt, interval, out);
                self.base.put_data(out_port, Arc::new(packet));
                return true;
            }
            if self.draining {
                if self.buffer.is_empty() {
                    self.base.put_eos(out_port);
                    return false;
                }
                let Some(dt) = self.datatype.clone() else {
                    self.base.put_eos(out_port);
                    return false;
                };
                let center = self.buffer.len() / 2;
                let interval = self.buffer[center].interval();
                let out = self.compute();
                self.buffer.pop_front();
                let packet = Vector::with_data(dt, interval, out);
                self.base.put_data(out_port, Arc::new(packet));
                return true;
            }
            let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
            match handle.get() {
                Some(v) => self.buffer.push_back(Arc::new(v.clone())),
                None => self.draining = true,
            }
        }
    }
}

impl Stateful for RegressionNode {
    fn reset_state(&mut self) {
        self.buffer.clear();
        self.draining = false;
    }
}

/// Registers every concrete node in this module under its filter name, so
/// a `.flow` description's `<node filter="signal-…">` resolves against the
/// builtin registry (§4.5 lookup order (a)) without the host program having
/// to know each node type individually.
///
/// Each factory constructs with a harmless default (`alpha=0.0`,
/// `nr-filters=0`, …); the parameter-expression machinery (§4.4) overrides
/// it from the node's declared XML attributes before first `configure`.
pub fn register_builtins() -> Result<(), crate::error::FlowError> {
    use std::cell::RefCell;
    use std::rc::Rc;

    crate::registry::register_filter("signal-preemphasis", || Rc::new(RefCell::new(PreemphasisNode::new(0.0))))?;
    crate::registry::register_filter("signal-real-fast-fourier-transform", || Rc::new(RefCell::new(FftNode::new())))?;
    crate::registry::register_filter("signal-filterbank", || Rc::new(RefCell::new(FilterbankNode::new(1))))?;
    crate::registry::register_filter("signal-cosine-transform", || Rc::new(RefCell::new(CosineTransformNode::new(1))))?;
    crate::registry::register_filter("signal-vector-operation", || Rc::new(RefCell::new(VectorOpNode::new(VectorOp::Log))))?;
    crate::registry::register_filter("signal-matrix-multiplication", || Rc::new(RefCell::new(MatrixMultNode::new())))?;
    crate::registry::register_filter("signal-normalization", || Rc::new(RefCell::new(NormalizationNode::new(1, false))))?;
    crate::registry::register_filter("signal-regression", || Rc::new(RefCell::new(RegressionNode::new(1))))?;
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

    fn test_dt(name: &'static str) -> Arc<Datatype> {
        Arc::new(Datatype::new_internal(name, || unreachable!()))
    }

    #[test]
    fn preemphasis_y0_is_primed_from_the_first_sample_itself() {
        let dt = test_dt("pre-f32");
        let mut node = PreemphasisNode::new(1.0);
        let in_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let out_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let dummy_producer: NodeHandle = Rc::new(RefCell::new(PreemphasisNode::new(1.0)));
        node.base.attach_input(node.input, Rc::clone(&in_link), dummy_producer, 0);
        node.base.attach_output(node.output, Rc::clone(&out_link), None);
        node.datatype = Some(dt.clone());

        in_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.0, 3.0), vec![1.0, 2.0, 4.0])));
        assert!(node.work(node.output));
        let out = out_link.get().unwrap();
        let out = out.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert_eq!(out.data, vec![0.0, 1.0, 2.0]);

        // Second packet: the first sample is preemphasized against the
        // carried-over last sample of the previous packet, not against
        // itself.
        in_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(3.0, 4.0), vec![5.0])));
        assert!(node.work(node.output));
        let out = out_link.get().unwrap();
        let out = out.as_any().downcast_ref::<Vector<f32>>().unwrap();
        assert_eq!(out.data, vec![1.0]); // 5.0 - 1.0*4.0
    }

    #[test]
    fn fft_power_spectrum_of_dc_signal_concentrates_in_bin_zero() {
        let spectrum = FftNode::power_spectrum(&[1.0; 8]);
        assert_eq!(spectrum.len(), 5);
        assert!(spectrum[0] > spectrum[1]);
        for bin in &spectrum[1..] {
            assert!(bin.abs() < 1e-3, "expected near-zero energy outside DC, got {bin}");
        }
    }

    #[test]
    fn fft_pads_to_next_power_of_two() {
        let spectrum = FftNode::power_spectrum(&[1.0; 5]);
        assert_eq!(spectrum.len(), 5); // next_power_of_two(5) == 8, 8/2+1 == 5.
    }

    #[test]
    fn dct_of_constant_signal_has_energy_only_in_first_coefficient() {
        let out = CosineTransformNode::transform(&[2.0, 2.0, 2.0, 2.0], 0);
        assert!(out[0].abs() > 1e-3);
        for c in &out[1..] {
            assert!(c.abs() < 1e-3, "expected near-zero AC energy, got {c}");
        }
    }

    #[test]
    fn dct_keeps_only_requested_coefficient_count() {
        let out = CosineTransformNode::transform(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn filterbank_has_no_energy_outside_mel_band_support() {
        let bank = MelFilterbank::new(4, 16, 16000.0);
        let mut spectrum = vec![0.0f32; 9];
        spectrum[0] = 1.0; // pure DC.
        let out = bank.apply(&spectrum);
        // DC sits at bin 0, below the first filter's left edge in a
        // typical mel layout; at minimum the output must be finite and
        // correctly sized.
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn matrix_mult_applies_identity() {
        let mut node = MatrixMultNode::new();
        assert!(node.set_matrix("2,2;1,0,0,1"));
        assert_eq!(node.multiply(&[3.0, 4.0]), vec![3.0, 4.0]);
    }

    #[test]
    fn matrix_mult_rejects_malformed_spec() {
        let mut node = MatrixMultNode::new();
        assert!(!node.set_matrix("not-a-matrix"));
        assert!(!node.set_matrix("2,2;1,2,3"));
    }

    #[test]
    fn vector_op_scale_and_log() {
        let node = VectorOpNode::new(VectorOp::Scale(2.0));
        assert_eq!(node.apply(3.0), 6.0);
        let node = VectorOpNode::new(VectorOp::Log);
        assert!((node.apply(1.0) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn normalization_centers_a_constant_stream_to_zero() {
        let mut node = NormalizationNode::new(0, false);
        node.datatype = Some(test_dt("norm-f32"));
        node.stats.push(&[4.0, 4.0]);
        node.stats.push(&[4.0, 4.0]);
        let (mean, _) = node.stats.mean_std().unwrap();
        assert_eq!(mean, vec![4.0, 4.0]);
    }

    #[test]
    fn normalization_reports_no_statistics_when_nothing_accumulated() {
        let stats = RunningStats::new(0);
        assert!(stats.mean_std().is_none());
    }

    #[test]
    fn regression_of_a_linear_ramp_recovers_the_slope() {
        let node = RegressionNode::new(1);
        let dt = test_dt("reg-f32");
        let mut buffer = std::collections::VecDeque::new();
        for (i, v) in [0.0f32, 1.0, 2.0].iter().enumerate() {
            buffer.push_back(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(i as f64, i as f64 + 1.0), vec![*v])));
        }
        let mut node = node;
        node.buffer = buffer;
        let out = node.compute();
        // slope 1 over a window of [-1, 0, 1]: (−1·0 + 1·2) / (2·1) = 1.
        assert!((out[0] - 1.0).abs() < 1e-6);
    }
}
