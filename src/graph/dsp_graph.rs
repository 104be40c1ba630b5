//! In-process block renderer implementing [`SignalGraph`].
//!
//! Rendering runs in quanta of [`RENDER_QUANTUM`] frames. Delay nodes emit
//! their buffered signal at the start of a quantum and absorb their input at
//! the end, which is what makes delay-broken feedback loops (echo) legal.
//! Every other node runs in topological order.

use std::fmt;

use super::analyser::Analyser;
use super::node::{
    BiquadNode, DelayNode, GainNode, Node, NodeKind, OscillatorNode, PannerNode, Quantum,
};
use super::param::AudioParam;
use super::{FilterKind, GraphError, GraphResult, NodeId, ParamKind, SignalGraph, Waveform};

pub const RENDER_QUANTUM: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Input,
    Param(ParamKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Edge {
    from: NodeId,
    to: NodeId,
    target: Target,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Processing order derived from the current topology.
struct Schedule {
    order: Vec<usize>,
    delays: Vec<usize>,
    incoming: Vec<Vec<(usize, Target)>>,
}

pub struct DspGraph {
    sample_rate: f32,
    frames_rendered: u64,
    slots: Vec<Slot>,
    free: Vec<usize>,
    edges: Vec<Edge>,
    schedule: Option<Schedule>,
    mix: Vec<f32>,
    aux: Vec<f32>,
    modulation: Vec<f32>,
}

impl DspGraph {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f32,
            frames_rendered: 0,
            slots: Vec::new(),
            free: Vec::new(),
            edges: Vec::new(),
            schedule: None,
            mix: vec![0.0; RENDER_QUANTUM],
            aux: vec![0.0; RENDER_QUANTUM],
            modulation: vec![0.0; RENDER_QUANTUM],
        }
    }

    /// Node fed with capture samples on every [`DspGraph::render`] call.
    pub fn create_source(&mut self) -> NodeId {
        self.insert(NodeKind::Source)
    }

    /// Stereo sink whose signal becomes the render output.
    pub fn create_destination(&mut self) -> NodeId {
        self.insert(NodeKind::Destination)
    }

    pub fn create_analyser(&mut self, fft_size: usize, smoothing: f32) -> NodeId {
        self.insert(NodeKind::Analyser(Box::new(Analyser::new(fft_size, smoothing))))
    }

    pub fn create_panner(&mut self) -> NodeId {
        self.insert(NodeKind::Panner(PannerNode::new(RENDER_QUANTUM)))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn connection_count(&self) -> usize {
        self.edges.len()
    }

    /// Oscillator nodes still present in the graph, running or not.
    pub fn oscillator_count(&self) -> usize {
        self.live_nodes()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Oscillator(_)))
            .count()
    }

    pub fn running_oscillator_count(&self) -> usize {
        self.live_nodes()
            .filter(|(_, n)| matches!(&n.kind, NodeKind::Oscillator(o) if o.is_running()))
            .count()
    }

    /// Whether `from` feeds the signal input of `to`.
    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.target == Target::Input)
    }

    pub fn param(&self, node: NodeId, param: ParamKind) -> GraphResult<&AudioParam> {
        self.node(node)?
            .param(param)
            .ok_or(GraphError::UnknownParam { node, param })
    }

    /// Bins an analyser produces per snapshot.
    pub fn frequency_bin_count(&self, analyser: NodeId) -> GraphResult<usize> {
        match &self.node(analyser)?.kind {
            NodeKind::Analyser(a) => Ok(a.bin_count()),
            _ => Err(not_an_analyser(analyser)),
        }
    }

    /// Snapshot the analyser's byte spectrum into `out`. Returns bins written.
    pub fn byte_frequency_data(&mut self, analyser: NodeId, out: &mut [u8]) -> GraphResult<usize> {
        match &mut self.node_mut(analyser)?.kind {
            NodeKind::Analyser(a) => Ok(a.byte_frequency_data(out)),
            _ => Err(not_an_analyser(analyser)),
        }
    }

    /// Render `input` (mono) through the graph into `output` (interleaved
    /// stereo, twice the length of `input`). Extra output is zeroed.
    pub fn render(&mut self, input: &[f32], output: &mut [f32]) {
        let frames = input.len().min(output.len() / 2);
        output[frames * 2..].fill(0.0);

        if self.schedule.is_none() {
            match self.build_schedule() {
                Ok(schedule) => self.schedule = Some(schedule),
                Err(e) => {
                    // connect() rejects such topologies, so this is unreachable in practice
                    log::error!("Graph schedule failed: {}", e);
                    output[..frames * 2].fill(0.0);
                    self.frames_rendered += frames as u64;
                    return;
                }
            }
        }

        let mut offset = 0;
        while offset < frames {
            let n = (frames - offset).min(RENDER_QUANTUM);
            self.render_quantum(&input[offset..offset + n], &mut output[offset * 2..(offset + n) * 2]);
            offset += n;
        }
    }

    fn render_quantum(&mut self, input: &[f32], output: &mut [f32]) {
        let n = input.len();
        let q = Quantum {
            time: self.current_time(),
            sample_rate: self.sample_rate,
            frames: n,
        };

        let Self {
            slots,
            schedule,
            mix,
            aux,
            modulation,
            ..
        } = self;
        let Some(schedule) = schedule.as_ref() else {
            return;
        };
        let mix = &mut mix[..n];
        let aux = &mut aux[..n];
        let modulation = &mut modulation[..n];

        for &i in &schedule.delays {
            if let Some(Node {
                kind: NodeKind::Delay(delay),
                out,
                ..
            }) = slots[i].node.as_mut()
            {
                delay.emit(q, out);
            }
        }

        output.fill(0.0);
        for &i in &schedule.order {
            let incoming = &schedule.incoming[i];
            let is_destination = matches!(
                slots[i].node.as_ref().map(|n| &n.kind),
                Some(NodeKind::Destination)
            );

            if is_destination {
                gather_stereo(slots, incoming, mix, aux);
            } else {
                gather(slots, incoming, mix, modulation);
            }

            let Some(node) = slots[i].node.as_mut() else {
                continue;
            };
            let Node {
                kind,
                out,
                left,
                right,
            } = node;
            let out = &mut out[..n];
            match kind {
                NodeKind::Source => out.copy_from_slice(input),
                NodeKind::Gain(g) => g.process(q, mix, modulation, out),
                NodeKind::Filter(f) => f.process(q, mix, modulation, out),
                NodeKind::Oscillator(o) => o.process(q, modulation, out),
                NodeKind::Panner(p) => {
                    p.process(q, mix, modulation, &mut left[..n], &mut right[..n], out)
                }
                NodeKind::Analyser(a) => {
                    out.copy_from_slice(mix);
                    a.push(mix);
                }
                NodeKind::Destination => {
                    left[..n].copy_from_slice(mix);
                    right[..n].copy_from_slice(aux);
                    for f in 0..n {
                        output[f * 2] += mix[f];
                        output[f * 2 + 1] += aux[f];
                    }
                }
                NodeKind::Delay(_) => {}
            }
        }

        for &i in &schedule.delays {
            gather(slots, &schedule.incoming[i], mix, modulation);
            if let Some(Node {
                kind: NodeKind::Delay(delay),
                ..
            }) = slots[i].node.as_mut()
            {
                delay.absorb(mix);
            }
        }

        self.frames_rendered += n as u64;
        let now = self.current_time();
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                node.prune_params(now);
            }
        }
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let node = Node::new(kind, RENDER_QUANTUM);
        self.schedule = None;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.node = Some(node);
                NodeId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId::new(self.slots.len() - 1, 0)
            }
        }
    }

    fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.node.as_ref())
            .ok_or(GraphError::NodeMissing(id))
    }

    fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.node.as_mut())
            .ok_or(GraphError::NodeMissing(id))
    }

    fn live_nodes(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.node.as_ref().map(|n| (i, n)))
    }

    fn add_edge(&mut self, edge: Edge) -> GraphResult<()> {
        if self.edges.contains(&edge) {
            return Ok(());
        }
        self.edges.push(edge);
        match self.build_schedule() {
            Ok(schedule) => {
                self.schedule = Some(schedule);
                Ok(())
            }
            Err(e) => {
                self.edges.pop();
                self.schedule = None;
                Err(e)
            }
        }
    }

    /// Kahn's algorithm over non-delay nodes. Delay outputs are available at
    /// the start of a quantum, so edges touching a delay impose no ordering.
    fn build_schedule(&self) -> GraphResult<Schedule> {
        let len = self.slots.len();
        let mut incoming: Vec<Vec<(usize, Target)>> = vec![Vec::new(); len];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
        let mut in_degree = vec![0usize; len];

        for edge in &self.edges {
            let (from, to) = (edge.from.index(), edge.to.index());
            incoming[to].push((from, edge.target));
            let ordered = !self.is_delay(from) && !self.is_delay(to);
            if ordered {
                dependents[from].push(to);
                in_degree[to] += 1;
            }
        }

        let delays: Vec<usize> = self
            .live_nodes()
            .filter(|(_, n)| n.is_delay())
            .map(|(i, _)| i)
            .collect();
        let mut ready: Vec<usize> = self
            .live_nodes()
            .filter(|(i, n)| !n.is_delay() && in_degree[*i] == 0)
            .map(|(i, _)| i)
            .collect();
        ready.reverse();

        let expected = self.node_count() - delays.len();
        let mut order = Vec::with_capacity(expected);
        while let Some(i) = ready.pop() {
            order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push(d);
                }
            }
        }

        if order.len() != expected {
            let edge = self.edges.last().copied();
            let (from, to) = edge.map(|e| (e.from, e.to)).unwrap_or((
                NodeId::new(0, 0),
                NodeId::new(0, 0),
            ));
            return Err(GraphError::CycleWithoutDelay { from, to });
        }

        Ok(Schedule {
            order,
            delays,
            incoming,
        })
    }

    fn is_delay(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .and_then(|s| s.node.as_ref())
            .is_some_and(Node::is_delay)
    }
}

fn not_an_analyser(node: NodeId) -> GraphError {
    GraphError::InvalidConnection {
        from: node,
        to: node,
        reason: "not an analyser",
    }
}

fn gather(slots: &[Slot], incoming: &[(usize, Target)], mix: &mut [f32], modulation: &mut [f32]) {
    mix.fill(0.0);
    modulation.fill(0.0);
    for &(from, target) in incoming {
        let Some(src) = slots[from].node.as_ref() else {
            continue;
        };
        let dst = match target {
            Target::Input => &mut *mix,
            Target::Param(_) => &mut *modulation,
        };
        for (d, s) in dst.iter_mut().zip(&src.out) {
            *d += *s;
        }
    }
}

fn gather_stereo(slots: &[Slot], incoming: &[(usize, Target)], left: &mut [f32], right: &mut [f32]) {
    left.fill(0.0);
    right.fill(0.0);
    for &(from, target) in incoming {
        if target != Target::Input {
            continue;
        }
        let Some(src) = slots[from].node.as_ref() else {
            continue;
        };
        let (l, r) = if src.is_stereo() {
            (&src.left, &src.right)
        } else {
            (&src.out, &src.out)
        };
        for i in 0..left.len() {
            left[i] += l[i];
            right[i] += r[i];
        }
    }
}

impl SignalGraph for DspGraph {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    fn create_filter(&mut self, kind: FilterKind, frequency: f32, q: f32) -> NodeId {
        let node = BiquadNode::new(kind, frequency, q, self.sample_rate);
        self.insert(NodeKind::Filter(node))
    }

    fn create_delay(&mut self, seconds: f32, max_seconds: f32) -> NodeId {
        let min_seconds = RENDER_QUANTUM as f32 / self.sample_rate;
        let node = DelayNode::new(seconds, max_seconds, min_seconds, self.sample_rate, RENDER_QUANTUM);
        self.insert(NodeKind::Delay(node))
    }

    fn create_oscillator(&mut self, waveform: Waveform, frequency: f32) -> NodeId {
        let node = OscillatorNode::new(waveform, frequency, self.sample_rate);
        self.insert(NodeKind::Oscillator(node))
    }

    fn create_gain(&mut self, gain: f32) -> NodeId {
        self.insert(NodeKind::Gain(GainNode::new(gain, RENDER_QUANTUM)))
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> GraphResult<()> {
        if !self.node(from)?.produces_output() {
            return Err(GraphError::InvalidConnection {
                from,
                to,
                reason: "source node has no output",
            });
        }
        if !self.node(to)?.accepts_input() {
            return Err(GraphError::InvalidConnection {
                from,
                to,
                reason: "target node has no input",
            });
        }
        self.add_edge(Edge {
            from,
            to,
            target: Target::Input,
        })
    }

    fn connect_param(&mut self, from: NodeId, to: NodeId, param: ParamKind) -> GraphResult<()> {
        if !self.node(from)?.produces_output() {
            return Err(GraphError::InvalidConnection {
                from,
                to,
                reason: "source node has no output",
            });
        }
        if self.node(to)?.modulation_target() != Some(param) {
            return Err(GraphError::UnknownParam { node: to, param });
        }
        self.add_edge(Edge {
            from,
            to,
            target: Target::Param(param),
        })
    }

    fn disconnect(&mut self, node: NodeId) -> GraphResult<()> {
        self.node(node)?;
        self.edges.retain(|e| e.from != node);
        self.schedule = None;
        Ok(())
    }

    fn remove(&mut self, node: NodeId) -> GraphResult<()> {
        self.node(node)?;
        self.edges.retain(|e| e.from != node && e.to != node);
        let slot = &mut self.slots[node.index()];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(node.index());
        self.schedule = None;
        Ok(())
    }

    fn start(&mut self, generator: NodeId) -> GraphResult<()> {
        match &mut self.node_mut(generator)?.kind {
            NodeKind::Oscillator(o) => {
                o.started = true;
                Ok(())
            }
            _ => Err(GraphError::NotAGenerator(generator)),
        }
    }

    fn stop(&mut self, generator: NodeId) -> GraphResult<()> {
        match &mut self.node_mut(generator)?.kind {
            NodeKind::Oscillator(o) => {
                o.stopped = true;
                Ok(())
            }
            _ => Err(GraphError::NotAGenerator(generator)),
        }
    }

    fn param_mut(&mut self, node: NodeId, param: ParamKind) -> GraphResult<&mut AudioParam> {
        self.node_mut(node)?
            .param_mut(param)
            .ok_or(GraphError::UnknownParam { node, param })
    }
}

impl fmt::Debug for DspGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self
            .live_nodes()
            .map(|(i, n)| format!("{}#{}", n.label(), i))
            .collect();
        f.debug_struct("DspGraph")
            .field("sample_rate", &self.sample_rate)
            .field("time", &self.current_time())
            .field("nodes", &nodes)
            .field("connections", &self.edges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> (DspGraph, NodeId, NodeId) {
        let mut g = DspGraph::new(48_000);
        let src = g.create_source();
        let dst = g.create_destination();
        (g, src, dst)
    }

    #[test]
    fn passthrough_copies_mono_to_both_channels() {
        let (mut g, src, dst) = graph();
        g.connect(src, dst).unwrap();
        let input = [0.25f32; 300];
        let mut out = [0.0f32; 600];
        g.render(&input, &mut out);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!((g.current_time() - 300.0 / 48_000.0).abs() < 1e-9);
    }

    #[test]
    fn gain_scales_signal() {
        let (mut g, src, dst) = graph();
        let gain = g.create_gain(0.5);
        g.connect(src, gain).unwrap();
        g.connect(gain, dst).unwrap();
        let mut out = [0.0f32; 256];
        g.render(&[1.0; 128], &mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn cycle_without_delay_is_rejected() {
        let (mut g, src, _) = graph();
        let a = g.create_gain(1.0);
        let b = g.create_gain(1.0);
        g.connect(src, a).unwrap();
        g.connect(a, b).unwrap();
        let err = g.connect(b, a).unwrap_err();
        assert!(matches!(err, GraphError::CycleWithoutDelay { .. }));
        assert_eq!(g.connection_count(), 2);
    }

    #[test]
    fn feedback_through_delay_is_allowed_and_decays() {
        let (mut g, src, dst) = graph();
        let delay = g.create_delay(0.01, 0.5);
        let fb = g.create_gain(0.5);
        g.connect(src, delay).unwrap();
        g.connect(delay, fb).unwrap();
        g.connect(fb, delay).unwrap();
        g.connect(delay, dst).unwrap();

        let mut impulse = vec![0.0f32; 4800];
        impulse[0] = 1.0;
        let mut out = vec![0.0f32; 9600];
        g.render(&impulse, &mut out);
        // first echo at 480 frames, second at 960 with half amplitude
        assert!((out[480 * 2] - 1.0).abs() < 1e-6);
        assert!((out[960 * 2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn removed_nodes_invalidate_their_ids() {
        let (mut g, src, dst) = graph();
        let gain = g.create_gain(1.0);
        g.connect(src, gain).unwrap();
        g.connect(gain, dst).unwrap();
        g.remove(gain).unwrap();
        assert_eq!(g.connection_count(), 0);
        assert_eq!(g.connect(src, gain), Err(GraphError::NodeMissing(gain)));

        let reused = g.create_gain(1.0);
        assert_eq!(reused.index(), gain.index());
        assert_ne!(reused, gain);
    }

    #[test]
    fn oscillator_can_modulate_gain() {
        let (mut g, src, dst) = graph();
        let osc = g.create_oscillator(Waveform::Square, 30.0);
        let depth = g.create_gain(0.5);
        let vca = g.create_gain(1.0);
        g.connect(osc, depth).unwrap();
        g.connect_param(depth, vca, ParamKind::Gain).unwrap();
        g.connect(src, vca).unwrap();
        g.connect(vca, dst).unwrap();
        g.start(osc).unwrap();

        let mut out = [0.0f32; 256];
        g.render(&[1.0; 128], &mut out);
        assert!((out[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn param_connection_must_target_modulatable_param() {
        let (mut g, src, _) = graph();
        let filter = g.create_filter(FilterKind::LowPass, 300.0, 1.0);
        let err = g.connect_param(src, filter, ParamKind::Q).unwrap_err();
        assert!(matches!(err, GraphError::UnknownParam { .. }));
    }

    #[test]
    fn gain_ramp_follows_audio_clock() {
        let (mut g, src, dst) = graph();
        let gain = g.create_gain(1.0);
        g.connect(src, gain).unwrap();
        g.connect(gain, dst).unwrap();
        {
            let p = g.param_mut(gain, ParamKind::Gain).unwrap();
            p.set_value_at_time(1.0, 0.0);
            p.linear_ramp_to_value_at_time(0.0, 0.02);
        }
        let mut out = vec![0.0f32; 4800 * 2];
        g.render(&[1.0; 4800], &mut out);
        // 0.02 s = 960 frames
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert!((out[480 * 2] - 0.5).abs() < 1e-2);
        assert_eq!(out[2000 * 2], 0.0);
        assert!(!g.param(gain, ParamKind::Gain).unwrap().has_automation());
    }
}
