use crate::error::AudioError;
use crate::graph::{FilterKind, GraphError, NodeId, ParamKind, SignalGraph, Waveform};

use super::VoiceEffect;

const PITCH_UP_CUTOFF: f32 = 500.0;
const PITCH_DOWN_CUTOFF: f32 = 700.0;

const ROBOT_CARRIER_HZ: f32 = 30.0;
const ROBOT_DEPTH: f32 = 0.15;

const ECHO_DELAY: f32 = 0.2;
const ECHO_MAX_DELAY: f32 = 0.5;
const ECHO_FEEDBACK: f32 = 0.4;
const ECHO_DAMPING_CUTOFF: f32 = 2500.0;

// (delay seconds, gain) per early reflection
const REVERB_TAPS: [(f32, f32); 3] = [(0.03, 0.3), (0.05, 0.2), (0.07, 0.1)];

const UNDERWATER_CUTOFF: f32 = 300.0;
const UNDERWATER_Q: f32 = 0.5;
const UNDERWATER_LFO_HZ: f32 = 0.5;
// Cutoff swing in Hz around UNDERWATER_CUTOFF.
const UNDERWATER_DEPTH: f32 = 120.0;

/// Nodes owned by one effect between the capture source and the analyser tap.
///
/// The chain is the only record of what it created, so [`EffectChain::teardown`]
/// is exhaustive: every generator is stopped and every node removed.
#[derive(Debug)]
pub struct EffectChain {
    effect: VoiceEffect,
    source: NodeId,
    nodes: Vec<NodeId>,
    generators: Vec<NodeId>,
}

impl EffectChain {
    /// A chain that owns nothing and leaves the source disconnected.
    pub fn detached(source: NodeId) -> Self {
        Self {
            effect: VoiceEffect::None,
            source,
            nodes: Vec::new(),
            generators: Vec::new(),
        }
    }

    pub fn effect(&self) -> VoiceEffect {
        self.effect
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn generators(&self) -> &[NodeId] {
        &self.generators
    }

    /// Disconnect the source from this chain, stop its oscillators and remove
    /// its nodes. Keeps going past individual failures and returns the first.
    pub fn teardown<G: SignalGraph + ?Sized>(self, graph: &mut G) -> Result<(), GraphError> {
        let mut first_err = None;
        let mut note = |r: Result<(), GraphError>| {
            if let Err(e) = r {
                log::warn!("Effect teardown step failed: {}", e);
                first_err.get_or_insert(e);
            }
        };

        note(graph.disconnect(self.source));
        for &osc in &self.generators {
            note(graph.stop(osc));
        }
        for &node in &self.nodes {
            note(graph.remove(node));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds effect chains from a fixed source node into a fixed sink (the
/// analyser tap, so metering sees the processed signal).
#[derive(Clone, Copy, Debug)]
pub struct EffectChainBuilder {
    source: NodeId,
    sink: NodeId,
}

impl EffectChainBuilder {
    pub fn new(source: NodeId, sink: NodeId) -> Self {
        Self { source, sink }
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn sink(&self) -> NodeId {
        self.sink
    }

    /// Wire `effect` between source and sink. On failure every node created
    /// so far is removed again before the error is returned.
    pub fn build<G: SignalGraph + ?Sized>(
        &self,
        graph: &mut G,
        effect: VoiceEffect,
    ) -> Result<EffectChain, AudioError> {
        let mut scope = ChainScope {
            graph,
            nodes: Vec::new(),
            generators: Vec::new(),
        };

        match scope.wire(effect, self.source, self.sink) {
            Ok(()) => Ok(scope.finish(effect, self.source)),
            Err(e) => {
                scope.abandon(self.source);
                Err(AudioError::ChainBuildError(e))
            }
        }
    }

    /// Replace `previous` with a chain for `effect`. The old chain is fully
    /// torn down first. If the new chain cannot be built, the passthrough
    /// chain is installed instead and the build error is handed back.
    pub fn switch<G: SignalGraph + ?Sized>(
        &self,
        graph: &mut G,
        previous: EffectChain,
        effect: VoiceEffect,
    ) -> (EffectChain, Option<AudioError>) {
        let from = previous.effect();
        if let Err(e) = previous.teardown(graph) {
            log::warn!("Tearing down '{}' chain left errors: {}", from, e);
        }

        match self.build(graph, effect) {
            Ok(chain) => {
                log::debug!("Effect chain '{}' -> '{}' ({} nodes)", from, effect, chain.nodes.len());
                (chain, None)
            }
            Err(e) => {
                log::warn!("Building '{}' failed, falling back to passthrough: {}", effect, e);
                let chain = self.build(graph, VoiceEffect::None).unwrap_or_else(|fallback| {
                    log::error!("Passthrough chain failed too: {}", fallback);
                    EffectChain::detached(self.source)
                });
                (chain, Some(e))
            }
        }
    }
}

/// Registers every node it creates so a half-built chain can be unwound.
struct ChainScope<'g, G: SignalGraph + ?Sized> {
    graph: &'g mut G,
    nodes: Vec<NodeId>,
    generators: Vec<NodeId>,
}

impl<G: SignalGraph + ?Sized> ChainScope<'_, G> {
    fn filter(&mut self, kind: FilterKind, frequency: f32, q: f32) -> NodeId {
        let id = self.graph.create_filter(kind, frequency, q);
        self.nodes.push(id);
        id
    }

    fn delay(&mut self, seconds: f32, max_seconds: f32) -> NodeId {
        let id = self.graph.create_delay(seconds, max_seconds);
        self.nodes.push(id);
        id
    }

    fn gain(&mut self, gain: f32) -> NodeId {
        let id = self.graph.create_gain(gain);
        self.nodes.push(id);
        id
    }

    /// Created stopped; started by `finish` once the chain is wired.
    fn oscillator(&mut self, waveform: Waveform, frequency: f32) -> NodeId {
        let id = self.graph.create_oscillator(waveform, frequency);
        self.nodes.push(id);
        self.generators.push(id);
        id
    }

    fn chain(&mut self, path: &[NodeId]) -> Result<(), GraphError> {
        for pair in path.windows(2) {
            self.graph.connect(pair[0], pair[1])?;
        }
        Ok(())
    }

    fn wire(&mut self, effect: VoiceEffect, source: NodeId, sink: NodeId) -> Result<(), GraphError> {
        match effect {
            VoiceEffect::None => self.chain(&[source, sink]),
            VoiceEffect::PitchUp => {
                let hp = self.filter(FilterKind::HighPass, PITCH_UP_CUTOFF, 1.0);
                self.chain(&[source, hp, sink])
            }
            VoiceEffect::PitchDown => {
                let lp = self.filter(FilterKind::LowPass, PITCH_DOWN_CUTOFF, 1.0);
                self.chain(&[source, lp, sink])
            }
            VoiceEffect::Robot => {
                let carrier = self.oscillator(Waveform::Square, ROBOT_CARRIER_HZ);
                let depth = self.gain(ROBOT_DEPTH);
                let modulated = self.gain(1.0);
                self.chain(&[carrier, depth])?;
                self.graph.connect_param(depth, modulated, ParamKind::Gain)?;
                self.chain(&[source, modulated, sink])
            }
            VoiceEffect::Echo => {
                let delay = self.delay(ECHO_DELAY, ECHO_MAX_DELAY);
                let damping = self.filter(FilterKind::LowPass, ECHO_DAMPING_CUTOFF, 1.0);
                let feedback = self.gain(ECHO_FEEDBACK);
                self.chain(&[source, delay, damping, feedback, delay])?;
                self.chain(&[delay, sink])?;
                self.chain(&[source, sink])
            }
            VoiceEffect::Reverb => {
                for (seconds, level) in REVERB_TAPS {
                    let tap = self.delay(seconds, seconds * 2.0);
                    let tap_gain = self.gain(level);
                    self.chain(&[source, tap, tap_gain, sink])?;
                }
                self.chain(&[source, sink])
            }
            VoiceEffect::Underwater => {
                let lp = self.filter(FilterKind::LowPass, UNDERWATER_CUTOFF, UNDERWATER_Q);
                let lfo = self.oscillator(Waveform::Sine, UNDERWATER_LFO_HZ);
                let depth = self.gain(UNDERWATER_DEPTH);
                self.chain(&[lfo, depth])?;
                self.graph.connect_param(depth, lp, ParamKind::Frequency)?;
                self.chain(&[source, lp, sink])
            }
        }
    }

    fn finish(mut self, effect: VoiceEffect, source: NodeId) -> EffectChain {
        let mut chain = EffectChain {
            effect,
            source,
            nodes: self.nodes,
            generators: Vec::with_capacity(self.generators.len()),
        };
        for osc in self.generators {
            match self.graph.start(osc) {
                Ok(()) => chain.generators.push(osc),
                Err(e) => log::warn!("Failed to start oscillator {}: {}", osc, e),
            }
        }
        chain
    }

    fn abandon(self, source: NodeId) {
        let partial = EffectChain {
            effect: VoiceEffect::None,
            source,
            nodes: self.nodes,
            generators: self.generators,
        };
        if let Err(e) = partial.teardown(self.graph) {
            log::warn!("Cleanup of partial chain incomplete: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DspGraph;

    struct Rig {
        graph: DspGraph,
        builder: EffectChainBuilder,
    }

    fn rig() -> Rig {
        let mut graph = DspGraph::new(48_000);
        let source = graph.create_source();
        let tap = graph.create_analyser(256, 0.8);
        let out = graph.create_destination();
        graph.connect(tap, out).unwrap();
        Rig {
            graph,
            builder: EffectChainBuilder::new(source, tap),
        }
    }

    #[test]
    fn passthrough_connects_source_straight_to_sink() {
        let mut r = rig();
        let chain = r.builder.build(&mut r.graph, VoiceEffect::None).unwrap();
        assert!(chain.nodes().is_empty());
        assert!(r.graph.is_connected(r.builder.source(), r.builder.sink()));
    }

    #[test]
    fn every_effect_tears_down_to_baseline() {
        let mut r = rig();
        let chain = r.builder.build(&mut r.graph, VoiceEffect::None).unwrap();
        let baseline = (r.graph.node_count(), r.graph.connection_count());

        let mut chain = chain;
        for effect in VoiceEffect::ALL {
            let (next, err) = r.builder.switch(&mut r.graph, chain, effect);
            assert!(err.is_none(), "{effect}: {err:?}");
            assert_eq!(next.effect(), effect);
            let (back, err) = r.builder.switch(&mut r.graph, next, VoiceEffect::None);
            assert!(err.is_none());
            assert_eq!(
                (r.graph.node_count(), r.graph.connection_count()),
                baseline,
                "leftovers after {effect}"
            );
            assert_eq!(r.graph.oscillator_count(), 0);
            chain = back;
        }
    }

    #[test]
    fn modulation_effects_start_their_oscillator() {
        let mut r = rig();
        for effect in [VoiceEffect::Robot, VoiceEffect::Underwater] {
            let chain = r.builder.build(&mut r.graph, effect).unwrap();
            assert_eq!(chain.generators().len(), 1);
            assert_eq!(r.graph.running_oscillator_count(), 1);
            chain.teardown(&mut r.graph).unwrap();
            assert_eq!(r.graph.running_oscillator_count(), 0);
        }
    }

    #[test]
    fn echo_repeats_are_audible_after_the_delay() {
        let mut r = rig();
        let _chain = r.builder.build(&mut r.graph, VoiceEffect::Echo).unwrap();

        let mut input = vec![0.0f32; 48_000];
        input[0] = 1.0;
        let mut output = vec![0.0f32; input.len() * 2];
        r.graph.render(&input, &mut output);

        // Direct impulse, then a damped repeat 200 ms later.
        assert!((output[0] - 1.0).abs() < 1e-6);
        let repeat: f32 = output[9_600 * 2..9_700 * 2].iter().map(|s| s.abs()).sum();
        assert!(repeat > 0.01, "repeat energy {repeat}");
        let quiet: f32 = output[4_000 * 2..9_000 * 2].iter().map(|s| s.abs()).sum();
        assert!(quiet < 1e-3, "leak between repeats {quiet}");
    }

    #[test]
    fn failed_build_cleans_up_partial_nodes() {
        let mut r = rig();
        let gone = r.graph.create_gain(1.0);
        r.graph.remove(gone).unwrap();
        let broken = EffectChainBuilder::new(r.builder.source(), gone);
        let before = r.graph.node_count();

        let err = broken.build(&mut r.graph, VoiceEffect::Robot).unwrap_err();
        assert!(matches!(err, AudioError::ChainBuildError(GraphError::NodeMissing(_))));
        assert_eq!(r.graph.node_count(), before);
        assert_eq!(r.graph.oscillator_count(), 0);
    }

    #[test]
    fn switch_falls_back_to_passthrough() {
        let mut r = rig();
        let chain = r.builder.build(&mut r.graph, VoiceEffect::Robot).unwrap();
        // Break the sink so nothing can be wired into it.
        let gone = r.graph.create_gain(1.0);
        r.graph.remove(gone).unwrap();
        let broken = EffectChainBuilder::new(r.builder.source(), gone);

        let (chain, err) = broken.switch(&mut r.graph, chain, VoiceEffect::Echo);
        assert!(err.is_some());
        assert_eq!(chain.effect(), VoiceEffect::None);
        assert_eq!(r.graph.oscillator_count(), 0);
    }
}
