//! `cadence-flow`: a pull-based dataflow runtime for streaming
//! signal-processing networks.
//!
//! A network is assembled from typed [`node::Node`]s connected by
//! [`link::Link`]s; an external driver pulls packets through one of the
//! network's output ports, recursively triggering upstream `work` calls
//! only as far back as needed to produce the next packet. There is no
//! internal scheduler, task system, or graph optimizer: the pull order
//! *is* the execution order.

pub mod attributes;
pub mod bayes;
pub mod cache;
pub mod dsp;
pub mod error;
pub mod link;
pub mod network;
pub mod node;
pub mod nodes;
pub mod packet;
pub mod param;
pub mod param_expr;
pub mod registry;
pub mod sliding_window;
pub mod synchronization;
pub mod timestamp;
pub mod window;
