//! Optional stereo placement stage between the master gain and the output.

use serde::{Deserialize, Serialize};

use crate::graph::{DspGraph, GraphResult, NodeId, ParamKind, SignalGraph};

/// Listener-relative position. Only `x` is used, as stereo pan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialPosition {
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl SpatialPosition {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// `x` clamped to `[-1, 1]`; non-finite input centres.
    pub fn pan(&self) -> f32 {
        if self.x.is_finite() { self.x.clamp(-1.0, 1.0) } else { 0.0 }
    }
}

/// Inserts a panner between `upstream` and `output` the first time a
/// position is applied; until then `upstream` feeds `output` directly.
#[derive(Debug)]
pub struct SpatialStage {
    upstream: NodeId,
    output: NodeId,
    panner: Option<NodeId>,
}

impl SpatialStage {
    pub fn new(upstream: NodeId, output: NodeId) -> Self {
        Self {
            upstream,
            output,
            panner: None,
        }
    }

    pub fn panner(&self) -> Option<NodeId> {
        self.panner
    }

    pub fn apply(&mut self, graph: &mut DspGraph, position: SpatialPosition) -> GraphResult<()> {
        let panner = match self.panner {
            Some(p) => p,
            None => self.insert(graph)?,
        };
        graph.param_mut(panner, ParamKind::Pan)?.set_value(position.pan());
        Ok(())
    }

    fn insert(&mut self, graph: &mut DspGraph) -> GraphResult<NodeId> {
        let panner = graph.create_panner();
        let rewired = graph
            .disconnect(self.upstream)
            .and_then(|_| graph.connect(self.upstream, panner))
            .and_then(|_| graph.connect(panner, self.output));
        if let Err(e) = rewired {
            if let Err(undo) = graph.remove(panner) {
                log::warn!("Unused panner {} not removed: {}", panner, undo);
            }
            if let Err(undo) = graph.connect(self.upstream, self.output) {
                log::warn!(
                    "{} -> {} not restored after failed panner insert: {}",
                    self.upstream,
                    self.output,
                    undo
                );
            }
            return Err(e);
        }
        log::debug!("Spatial panner {} inserted", panner);
        self.panner = Some(panner);
        Ok(panner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pan_is_clamped() {
        assert_eq!(SpatialPosition::new(3.0, 0.0, 0.0).pan(), 1.0);
        assert_eq!(SpatialPosition::new(-0.25, 9.0, 9.0).pan(), -0.25);
        assert_eq!(SpatialPosition::new(f32::NAN, 0.0, 0.0).pan(), 0.0);
    }

    #[test]
    fn panner_is_inserted_once_and_moves_signal() {
        let mut graph = DspGraph::new(48_000);
        let src = graph.create_source();
        let out = graph.create_destination();
        graph.connect(src, out).unwrap();
        let mut stage = SpatialStage::new(src, out);

        stage.apply(&mut graph, SpatialPosition::new(1.0, 0.0, 0.0)).unwrap();
        let panner = stage.panner().unwrap();
        stage.apply(&mut graph, SpatialPosition::new(1.0, 0.0, 0.0)).unwrap();
        assert_eq!(stage.panner(), Some(panner));
        assert!(!graph.is_connected(src, out));
        assert!(graph.is_connected(src, panner));

        let input = [0.5f32; 128];
        let mut output = [0.0f32; 256];
        graph.render(&input, &mut output);
        assert!(output[0].abs() < 1e-6, "left {}", output[0]);
        assert!((output[1] - 0.5).abs() < 1e-4, "right {}", output[1]);
    }

    #[test]
    fn failed_insert_rolls_back_the_panner() {
        let mut graph = DspGraph::new(48_000);
        let src = graph.create_source();
        let out = graph.create_destination();
        graph.connect(src, out).unwrap();
        let gone = graph.create_gain(1.0);
        graph.remove(gone).unwrap();
        let nodes = graph.node_count();

        let mut broken = SpatialStage::new(src, gone);
        assert!(broken.apply(&mut graph, SpatialPosition::new(0.5, 0.0, 0.0)).is_err());
        assert_eq!(broken.panner(), None);
        assert_eq!(graph.node_count(), nodes);
        // The restore edge targets the missing node, so nothing is left wired.
        assert_eq!(graph.connection_count(), 0);
    }
}
