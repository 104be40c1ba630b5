//! Signal graph abstraction and the in-process DSP renderer behind it.
//!
//! Effect chains only ever talk to [`SignalGraph`]; the session owns a
//! concrete [`DspGraph`] and feeds it capture blocks from the render thread.

mod analyser;
mod dsp_graph;
mod node;
mod param;

use std::fmt;

use thiserror::Error;

pub use analyser::{Analyser, DEFAULT_FFT_SIZE, MAX_FFT_SIZE, MIN_FFT_SIZE};
pub use dsp_graph::{DspGraph, RENDER_QUANTUM};
pub use param::{AudioParam, AutomationEvent};

/// Handle to a node in a graph arena. Stale handles are detected through
/// the generation counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Automatable parameters. Each node kind exposes a fixed subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Gain,
    Frequency,
    Q,
    DelayTime,
    Pan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    HighPass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node {0} no longer exists")]
    NodeMissing(NodeId),

    #[error("Node {node} has no {param:?} parameter")]
    UnknownParam { node: NodeId, param: ParamKind },

    #[error("Connecting {from} -> {to} would create a feedback loop without a delay")]
    CycleWithoutDelay { from: NodeId, to: NodeId },

    #[error("Node {0} is not a generator")]
    NotAGenerator(NodeId),

    #[error("Invalid connection {from} -> {to}: {reason}")]
    InvalidConnection {
        from: NodeId,
        to: NodeId,
        reason: &'static str,
    },
}

pub type GraphResult<T> = Result<T, GraphError>;

/// The topology operations an effect chain needs from an audio graph.
///
/// Any platform graph can sit behind this; [`DspGraph`] is the in-process one.
pub trait SignalGraph {
    fn sample_rate(&self) -> f32;

    /// Audio clock in seconds.
    fn current_time(&self) -> f64;

    fn create_filter(&mut self, kind: FilterKind, frequency: f32, q: f32) -> NodeId;

    /// `max_seconds` bounds later changes to the delay time parameter.
    fn create_delay(&mut self, seconds: f32, max_seconds: f32) -> NodeId;

    /// Oscillators are created stopped.
    fn create_oscillator(&mut self, waveform: Waveform, frequency: f32) -> NodeId;

    fn create_gain(&mut self, gain: f32) -> NodeId;

    /// Route the output of `from` into the signal input of `to`.
    fn connect(&mut self, from: NodeId, to: NodeId) -> GraphResult<()>;

    /// Route the output of `from` into a parameter of `to` (audio-rate modulation).
    fn connect_param(&mut self, from: NodeId, to: NodeId, param: ParamKind) -> GraphResult<()>;

    /// Drop every outgoing connection of `node`.
    fn disconnect(&mut self, node: NodeId) -> GraphResult<()>;

    /// Remove the node and every connection touching it.
    fn remove(&mut self, node: NodeId) -> GraphResult<()>;

    fn start(&mut self, generator: NodeId) -> GraphResult<()>;

    fn stop(&mut self, generator: NodeId) -> GraphResult<()>;

    fn param_mut(&mut self, node: NodeId, param: ParamKind) -> GraphResult<&mut AudioParam>;
}
