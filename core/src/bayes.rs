//! Bayes decision rule over an accumulated stream of feature vectors.
//!
//! Grounded on the reference implementation's `Signal::BayesClassification`,
//! `Signal::AprioriProbability`/`UniformAprioriProbability`, and
//! `Signal::LikelihoodFunction`/`IndependentSequenceLikelihood`. The actual
//! scoring model a real system would plug in (a Gaussian mixture, a neural
//! acoustic model) is out of scope here and stands in as the opaque
//! [`FeatureScorer`] trait, matching the reference's `Mm::FeatureScorer`
//! boundary.

use std::fmt;
use std::sync::Arc;

use crate::node::{AbstractNode, Node, PortId};
use crate::packet::{Ref, Vector};
use crate::param::{ParamInt, ParamString};
use crate::param_expr::StringPacket;
use crate::sliding_window::{MarginCondition, SlidingWindow};
use crate::timestamp::{Timestamp, TOLERANCE};

/// A pluggable source of class-conditional negative log-likelihoods,
/// `-log p(x | k)`, for a single feature vector.
pub trait FeatureScorer: fmt::Debug {
    /// `-log p(feature | class)`.
    fn score(&self, feature: &[f32], class: usize) -> f32;
}

/// A class-conditional density over a sequence of feature vectors.
pub trait LikelihoodFunction: fmt::Debug {
    /// Called whenever the class set changes; resizes internal per-class
    /// accumulators.
    fn set_classes(&mut self, labels: &[String]) -> bool;

    /// Called once the feature dimension is known; a no-op for likelihood
    /// functions that don't need it.
    fn set_dimension(&mut self, dimension: usize) -> bool {
        let _ = dimension;
        true
    }

    /// Drops accumulated scores.
    fn reset(&mut self);

    /// Scores `feature`, weighted by `weight`, both accumulating into this
    /// function's running per-class totals and writing this single
    /// feature's own per-class contribution into `per_class_scores`.
    fn feed(&mut self, feature: &[f32], weight: f32, per_class_scores: &mut Vec<f32>);

    /// The running accumulated score for `class`.
    fn get(&self, class: usize) -> f32;

    /// Sum of weights seen since the last [`Self::reset`].
    fn sum_of_weights(&self) -> f32;
}

/// Assumes feature vectors and classes are independent: sums
/// `weight * -log p(x_t | k)` over the vectors fed so far.
#[derive(Debug)]
pub struct IndependentSequenceLikelihood<S: FeatureScorer> {
    scorer: S,
    scores: Vec<f32>,
    sum_of_weights: f32,
}

impl<S: FeatureScorer> IndependentSequenceLikelihood<S> {
    /// Wraps `scorer`, with no classes set yet.
    pub fn new(scorer: S) -> Self {
        IndependentSequenceLikelihood { scorer, scores: Vec::new(), sum_of_weights: 0.0 }
    }
}

impl<S: FeatureScorer> LikelihoodFunction for IndependentSequenceLikelihood<S> {
    fn set_classes(&mut self, labels: &[String]) -> bool {
        self.scores = vec![0.0; labels.len()];
        true
    }

    fn reset(&mut self) {
        for s in &mut self.scores {
            *s = 0.0;
        }
        self.sum_of_weights = 0.0;
    }

    fn feed(&mut self, feature: &[f32], weight: f32, per_class_scores: &mut Vec<f32>) {
        per_class_scores.clear();
        per_class_scores.reserve(self.scores.len());
        for (class, total) in self.scores.iter_mut().enumerate() {
            let contribution = weight * self.scorer.score(feature, class);
            *total += contribution;
            per_class_scores.push(contribution);
        }
        self.sum_of_weights += weight;
    }

    fn get(&self, class: usize) -> f32 {
        self.scores[class]
    }

    fn sum_of_weights(&self) -> f32 {
        self.sum_of_weights
    }
}

/// A class a-priori probability model, scored as `-log p(k)`.
pub trait AprioriProbability: fmt::Debug {
    /// Called whenever the class set changes.
    fn set_classes(&mut self, labels: &[String]) -> bool;
    /// `-log p(class)`.
    fn score(&self, class: usize) -> f32;
}

/// `-log(1 / K)` for every class.
#[derive(Debug, Default)]
pub struct UniformAprioriProbability {
    log_n_classes: f32,
}

impl AprioriProbability for UniformAprioriProbability {
    fn set_classes(&mut self, labels: &[String]) -> bool {
        self.log_n_classes = (labels.len().max(1) as f32).ln();
        true
    }

    fn score(&self, _class: usize) -> f32 {
        self.log_n_classes
    }
}

/// Accumulates class-conditional scores for a variable-length stream of
/// feature vectors and applies the Bayes decision rule
/// `argmin_k (prior[k] + likelihood[k])`.
///
/// Operates in one of two modes (see [`Self::set_use_sliding_window`]):
/// delayed decision (decide once `delay` frames have arrived, or the stream
/// ends) or sliding window (decide once the window is full and `delay` new
/// frames have arrived since the last decision, over the window's summed
/// per-frame scores).
#[derive(Debug)]
pub struct BayesClassification<A: AprioriProbability, L: LikelihoodFunction> {
    class_labels: Vec<String>,
    apriori: A,
    likelihood: L,
    delay: u32,
    frames_since_emission: u32,
    use_sliding_window: bool,
    score_window: SlidingWindow<Vec<f32>>,
    time_window: SlidingWindow<(f64, f64)>,
    first_start_time: f64,
    last_end_time: f64,
    new_data: bool,
}

impl<A: AprioriProbability, L: LikelihoodFunction> BayesClassification<A, L> {
    /// Builds a classifier with no classes set and delayed-decision mode
    /// with `delay == 0`.
    pub fn new(apriori: A, likelihood: L) -> Self {
        BayesClassification {
            class_labels: Vec::new(),
            apriori,
            likelihood,
            delay: 0,
            frames_since_emission: 0,
            use_sliding_window: false,
            score_window: SlidingWindow::new(1, 0).unwrap_or_default(),
            time_window: SlidingWindow::new(1, 0).unwrap_or_default(),
            first_start_time: f64::INFINITY,
            last_end_time: f64::NEG_INFINITY,
            new_data: false,
        }
    }

    /// Number of classes currently configured.
    pub fn n_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// Sets the class labels, propagating to both collaborators and
    /// clearing all accumulated state.
    pub fn set_class_labels(&mut self, labels: Vec<String>) {
        self.class_labels = labels;
        self.apriori.set_classes(&self.class_labels);
        self.likelihood.set_classes(&self.class_labels);
        self.reset();
    }

    /// Number of feature dimensions expected per vector.
    pub fn set_num_used_features(&mut self, n: usize) {
        self.likelihood.set_dimension(n);
    }

    /// A decision is only made after at least `delay` feature vectors have
    /// been fed since the last decision.
    pub fn set_delay(&mut self, delay: u32) {
        self.delay = delay;
    }

    /// Switches between delayed-decision and sliding-window modes.
    pub fn set_use_sliding_window(&mut self, use_window: bool, window_length: usize, window_right: usize) {
        self.use_sliding_window = use_window;
        if use_window {
            self.score_window = SlidingWindow::new(window_length, window_right)
                .unwrap_or_else(|| crate::abort_invariant!("bayes classification window length {window_length} right {window_right}"));
            self.time_window = SlidingWindow::new(window_length, window_right)
                .unwrap_or_else(|| crate::abort_invariant!("bayes classification window length {window_length} right {window_right}"));
        }
    }

    /// Drops all accumulated scores and timing state.
    pub fn reset(&mut self) {
        self.likelihood.reset();
        self.score_window.clear();
        self.time_window.clear();
        self.frames_since_emission = 0;
        self.new_data = false;
        self.first_start_time = f64::INFINITY;
        self.last_end_time = f64::NEG_INFINITY;
    }

    fn update_times(&mut self, interval: Timestamp) {
        if !self.new_data {
            self.first_start_time = interval.start;
        }
        self.last_end_time = interval.end;
        self.new_data = true;
    }

    /// Accumulates the scores for one feature vector.
    pub fn feed(&mut self, interval: Timestamp, feature: &[f32], weight: f32) {
        self.update_times(interval);
        self.frames_since_emission += 1;
        let mut per_frame = Vec::new();
        self.likelihood.feed(feature, weight, &mut per_frame);
        if self.use_sliding_window {
            self.score_window.add(per_frame);
            self.time_window.add((interval.start, interval.end));
        }
    }

    /// Whether a decision should still wait for more feature vectors.
    /// `force` (end-of-stream) bypasses the delay/window-fullness check.
    pub fn need_more_feature_vectors(&self, force: bool) -> bool {
        if force {
            return false;
        }
        if self.use_sliding_window {
            !MarginCondition::Full.is_satisfied(&self.score_window) || self.frames_since_emission < self.delay
        } else {
            self.frames_since_emission < self.delay
        }
    }

    fn current_interval(&self) -> Timestamp {
        if self.use_sliding_window {
            let mut start = f64::INFINITY;
            let mut end = f64::NEG_INFINITY;
            for rel in -(self.time_window.max_past_size() as i64)..=(self.time_window.max_future_size() as i64) {
                if let Some((s, e)) = self.time_window.get(rel) {
                    start = start.min(*s);
                    end = end.max(*e);
                }
            }
            Timestamp::new(start, end)
        } else {
            Timestamp::new(self.first_start_time, self.last_end_time)
        }
    }

    fn combined_scores(&self) -> Vec<f32> {
        let mut scores = if self.use_sliding_window {
            let mut sums = vec![0.0f32; self.class_labels.len()];
            for rel in -(self.score_window.max_past_size() as i64)..=(self.score_window.max_future_size() as i64) {
                if let Some(v) = self.score_window.get(rel) {
                    for (s, x) in sums.iter_mut().zip(v.iter()) {
                        *s += x;
                    }
                }
            }
            sums
        } else {
            (0..self.class_labels.len()).map(|c| self.likelihood.get(c)).collect()
        };
        for (class, s) in scores.iter_mut().enumerate() {
            *s += self.apriori.score(class);
        }
        scores
    }

    /// Returns the best class and its timestamp span, if a decision can be
    /// made now. `force` makes an end-of-stream decision even if `delay` (or
    /// window fullness) has not been reached, provided some data was fed.
    pub fn classify(&mut self, force: bool) -> Option<(String, Timestamp)> {
        if !self.new_data || self.need_more_feature_vectors(force) {
            return None;
        }
        let scores = self.combined_scores();
        let idx = scores.iter().enumerate().min_by(|a, b| a.1.partial_cmp(b.1).unwrap()).map(|(i, _)| i)?;
        let label = self.class_labels.get(idx)?.clone();
        let interval = self.current_interval();
        self.new_data = false;
        self.frames_since_emission = 0;
        Some((label, interval))
    }

    /// As [`Self::classify`], but returns the per-class combined score
    /// vector instead of the decided label.
    pub fn scores(&mut self, force: bool) -> Option<(Vec<f32>, Timestamp)> {
        if !self.new_data || self.need_more_feature_vectors(force) {
            return None;
        }
        let scores = self.combined_scores();
        let interval = self.current_interval();
        self.new_data = false;
        self.frames_since_emission = 0;
        Some((scores, interval))
    }
}

static PARAM_CLASS_LABELS: ParamString = ParamString::new("class-labels", "comma-separated class labels", "");
static PARAM_DELAY: ParamInt = ParamInt::new("delay", "feature vectors to accumulate before deciding", 1);
static PARAM_NUM_USED_FEATURES: ParamInt = ParamInt::new("num-used-features", "feature dimensions to use, 0 for all", 0);
static PARAM_WINDOW_LENGTH: ParamInt = ParamInt::new("window-length", "sliding-window size in frames, 0 to disable", 0);
static PARAM_WINDOW_RIGHT: ParamInt = ParamInt::new("window-right", "future frames within the sliding window", 0);

fn pull_weight(base: &AbstractNode, weight_port: PortId, feature_interval: Timestamp) -> f32 {
    let handle: Ref<Vector<f32>> = base.get_data(weight_port);
    match handle.get() {
        Some(weight_packet) => {
            let w = weight_packet.interval();
            if w.start > feature_interval.start + TOLERANCE || w.end < feature_interval.end - TOLERANCE {
                crate::abort_invariant!(
                    "feature-score-weight timestamp {w} does not contain feature timestamp {feature_interval}"
                );
            }
            weight_packet.data.first().copied().unwrap_or(1.0)
        }
        None => 1.0,
    }
}

/// Emits the decided class label for each run of accumulated feature
/// vectors. Filter name `signal-bayes-classification`.
#[derive(Debug)]
pub struct BayesClassificationNode<S: FeatureScorer + 'static> {
    base: AbstractNode,
    input: PortId,
    weight_input: PortId,
    output: PortId,
    classifier: BayesClassification<UniformAprioriProbability, IndependentSequenceLikelihood<S>>,
}

impl<S: FeatureScorer + 'static> BayesClassificationNode<S> {
    /// Builds a classification node around `scorer`, with a uniform prior
    /// and no classes set yet.
    pub fn new(scorer: S) -> Self {
        let base = AbstractNode::new("signal-bayes-classification");
        let input = base.add_input_port("in");
        let weight_input = base.add_input_port("feature-score-weight");
        let output = base.add_output_port("out");
        let classifier = BayesClassification::new(
            UniformAprioriProbability::default(),
            IndependentSequenceLikelihood::new(scorer),
        );
        BayesClassificationNode { base, input, weight_input, output, classifier }
    }
}

impl<S: FeatureScorer + 'static> Node for BayesClassificationNode<S> {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        if PARAM_CLASS_LABELS.matches(name) {
            let labels: Vec<String> = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            self.classifier.set_class_labels(labels);
            true
        } else if PARAM_DELAY.matches(name) {
            self.classifier.set_delay(PARAM_DELAY.parse(value).max(0) as u32);
            true
        } else if PARAM_NUM_USED_FEATURES.matches(name) {
            self.classifier.set_num_used_features(PARAM_NUM_USED_FEATURES.parse(value).max(0) as usize);
            true
        } else if PARAM_WINDOW_LENGTH.matches(name) || PARAM_WINDOW_RIGHT.matches(name) {
            false
        } else {
            false
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.base.put_output_attributes(self.output, &attrs);
        self.classifier.reset();
        true
    }

    fn work(&mut self, out_port: PortId) -> bool {
        loop {
            let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
            match handle.get() {
                Some(feature) => {
                    let weight = pull_weight(&self.base, self.weight_input, feature.interval());
                    self.classifier.feed(feature.interval(), &feature.data, weight);
                    if let Some((label, interval)) = self.classifier.classify(false) {
                        self.base.put_data(out_port, Arc::new(StringPacket::new(interval, label)));
                        return true;
                    }
                }
                None => {
                    if let Some((label, interval)) = self.classifier.classify(true) {
                        self.base.put_data(out_port, Arc::new(StringPacket::new(interval, label)));
                        return true;
                    }
                    self.base.put_eos(out_port);
                    return false;
                }
            }
        }
    }
}

/// Emits the combined per-class score vector for each run of accumulated
/// feature vectors, instead of the decided label. Filter name
/// `signal-bayes-classification-score`.
#[derive(Debug)]
pub struct BayesClassificationScoreNode<S: FeatureScorer + 'static> {
    base: AbstractNode,
    input: PortId,
    weight_input: PortId,
    output: PortId,
    classifier: BayesClassification<UniformAprioriProbability, IndependentSequenceLikelihood<S>>,
}

impl<S: FeatureScorer + 'static> BayesClassificationScoreNode<S> {
    /// Builds a score-emitting classification node around `scorer`.
    pub fn new(scorer: S) -> Self {
        let base = AbstractNode::new("signal-bayes-classification-score");
        let input = base.add_input_port("in");
        let weight_input = base.add_input_port("feature-score-weight");
        let output = base.add_output_port("out");
        let classifier = BayesClassification::new(
            UniformAprioriProbability::default(),
            IndependentSequenceLikelihood::new(scorer),
        );
        BayesClassificationScoreNode { base, input, weight_input, output, classifier }
    }
}

impl<S: FeatureScorer + 'static> Node for BayesClassificationScoreNode<S> {
    fn abstract_node(&self) -> &AbstractNode {
        &self.base
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        if PARAM_CLASS_LABELS.matches(name) {
            let labels: Vec<String> = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            self.classifier.set_class_labels(labels);
            true
        } else if PARAM_DELAY.matches(name) {
            self.classifier.set_delay(PARAM_DELAY.parse(value).max(0) as u32);
            true
        } else {
            false
        }
    }

    fn configure(&mut self) -> bool {
        let attrs = self.base.get_input_attributes(self.input);
        self.base.put_output_attributes(self.output, &attrs);
        self.classifier.reset();
        true
    }

    fn work(&mut self, out_port: PortId) -> bool {
        loop {
            let handle: Ref<Vector<f32>> = self.base.get_data(self.input);
            match handle.get() {
                Some(feature) => {
                    let weight = pull_weight(&self.base, self.weight_input, feature.interval());
                    self.classifier.feed(feature.interval(), &feature.data, weight);
                    if let Some((scores, interval)) = self.classifier.scores(false) {
                        let datatype = Arc::clone(feature.datatype());
                        self.base.put_data(out_port, Arc::new(Vector::with_data(datatype, interval, scores)));
                        return true;
                    }
                }
                None => {
                    if let Some((scores, interval)) = self.classifier.scores(true) {
                        let datatype = crate::registry::get_datatype("flow-vector-f32")
                            .unwrap_or_else(|| Arc::new(crate::registry::Datatype::new_internal("flow-vector-f32", || unreachable!())));
                        self.base.put_data(out_port, Arc::new(Vector::with_data(datatype, interval, scores)));
                        return true;
                    }
                    self.base.put_eos(out_port);
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Link, LinkMode};
    use crate::node::NodeHandle;
    use crate::registry::Datatype;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A scorer that reads the per-class score straight out of the feature
    /// vector, so test fixtures can specify `(score_class_0, score_class_1)`
    /// pairs directly.
    #[derive(Debug)]
    struct IdentityScorer;
    impl FeatureScorer for IdentityScorer {
        fn score(&self, feature: &[f32], class: usize) -> f32 {
            feature[class]
        }
    }

    fn labels() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn delayed_decision_sums_per_frame_scores_and_picks_the_minimum() {
        let mut c = BayesClassification::new(UniformAprioriProbability::default(), IndependentSequenceLikelihood::new(IdentityScorer));
        c.set_class_labels(labels());
        c.set_delay(3);

        c.feed(Timestamp::new(0.00, 0.01), &[1.0, 2.0], 1.0);
        assert!(c.classify(false).is_none());
        c.feed(Timestamp::new(0.01, 0.02), &[1.0, 2.0], 1.0);
        assert!(c.classify(false).is_none());
        c.feed(Timestamp::new(0.02, 0.03), &[1.0, 3.0], 1.0);

        let (label, interval) = c.classify(false).unwrap();
        assert_eq!(label, "a");
        assert!(interval.approx_eq(&Timestamp::new(0.00, 0.03)));
    }

    #[test]
    fn end_of_stream_forces_a_decision_before_delay_is_reached() {
        let mut c = BayesClassification::new(UniformAprioriProbability::default(), IndependentSequenceLikelihood::new(IdentityScorer));
        c.set_class_labels(labels());
        c.set_delay(10);
        c.feed(Timestamp::new(0.0, 0.01), &[5.0, 1.0], 1.0);
        assert!(c.classify(false).is_none());
        let (label, _) = c.classify(true).unwrap();
        assert_eq!(label, "b");
    }

    #[test]
    fn sliding_window_decides_over_the_summed_window_once_full() {
        let mut c = BayesClassification::new(UniformAprioriProbability::default(), IndependentSequenceLikelihood::new(IdentityScorer));
        c.set_class_labels(labels());
        c.set_use_sliding_window(true, 2, 0);
        c.set_delay(1);

        c.feed(Timestamp::new(0.00, 0.01), &[1.0, 9.0], 1.0);
        assert!(c.classify(false).is_none(), "window not yet full");
        c.feed(Timestamp::new(0.01, 0.02), &[1.0, 9.0], 1.0);
        let (label, interval) = c.classify(false).unwrap();
        assert_eq!(label, "a");
        assert!(interval.approx_eq(&Timestamp::new(0.00, 0.02)));
    }

    fn test_datatype() -> Arc<Datatype> {
        Arc::new(Datatype::new_internal("test-bayes-f32", || unreachable!()))
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

    #[test]
    fn node_emits_decision_once_delay_is_reached_then_eos() {
        let dt = test_datatype();
        let mut node = BayesClassificationNode::new(IdentityScorer);
        node.set_parameter("class-labels", "a, b");
        node.set_parameter("delay", "2");

        let in_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        in_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.0, 0.01), vec![1.0f32, 5.0])));
        in_link.put(Arc::new(Vector::with_data(dt.clone(), Timestamp::new(0.01, 0.02), vec![1.0f32, 5.0])));
        let weight_link = Rc::new(Link::new(dt.clone(), LinkMode::Fast, 0));
        let out_link = Rc::new(Link::new(dt, LinkMode::Fast, 0));

        node.base.attach_input(node.input, in_link, stub(), 0);
        node.base.attach_input(node.weight_input, weight_link, stub(), 0);
        node.base.attach_output(node.output, Rc::clone(&out_link), None);

        assert!(node.work(0));
        let packet = out_link.get().unwrap();
        let decided = packet.as_any().downcast_ref::<StringPacket>().unwrap();
        assert_eq!(decided.value, "a");

        assert!(!node.work(0));
        assert!(crate::packet::is_eos(&out_link.get().unwrap()));
    }
}
