//! Click-free mute: a gain ramp on the audio clock combined with the capture
//! track's enable flag.

use std::time::Duration;

use crate::audio::MediaTrack;
use crate::graph::{GraphResult, NodeId, ParamKind, SignalGraph};

pub const MIN_RAMP: Duration = Duration::from_millis(20);
pub const MAX_RAMP: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct GainController {
    node: NodeId,
    ramp: f64,
}

impl GainController {
    /// `ramp` is clamped to 20..=50 ms.
    pub fn new(node: NodeId, ramp: Duration) -> Self {
        Self {
            node,
            ramp: ramp.clamp(MIN_RAMP, MAX_RAMP).as_secs_f64(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn ramp(&self) -> Duration {
        Duration::from_secs_f64(self.ramp)
    }

    pub fn target_gain(muted: bool) -> f32 {
        if muted { 0.0 } else { 1.0 }
    }

    /// Ramp from wherever the gain currently is towards the target, dropping
    /// any ramp still in flight, then flip the track's enable flag to match.
    pub fn set_muted<G: SignalGraph + ?Sized>(
        &self,
        graph: &mut G,
        track: &MediaTrack,
        muted: bool,
    ) -> GraphResult<()> {
        let now = graph.current_time();
        let end = now + self.ramp;
        let param = graph.param_mut(self.node, ParamKind::Gain)?;
        let current = param.value_at(now);
        param.cancel_scheduled_values(now);
        param.set_value_at_time(current, now);
        param.linear_ramp_to_value_at_time(Self::target_gain(muted), end);

        track.set_enabled(!muted);
        log::debug!(
            "Gain {:.2} -> {:.0} over {:.0} ms, track {}",
            current,
            Self::target_gain(muted),
            self.ramp * 1000.0,
            if muted { "disabled" } else { "enabled" }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DspGraph;
    use proptest::prelude::*;

    fn setup() -> (DspGraph, GainController, MediaTrack) {
        let mut graph = DspGraph::new(48_000);
        let node = graph.create_gain(1.0);
        let ctl = GainController::new(node, Duration::from_millis(20));
        (graph, ctl, MediaTrack::new("test"))
    }

    fn advance(graph: &mut DspGraph, frames: usize) {
        let input = vec![0.0; frames];
        let mut out = vec![0.0; frames * 2];
        graph.render(&input, &mut out);
    }

    fn settled_gain(graph: &DspGraph, ctl: &GainController) -> f32 {
        graph
            .param(ctl.node(), ParamKind::Gain)
            .unwrap()
            .value_at(graph.current_time() + 1.0)
    }

    #[test]
    fn ramp_length_is_clamped() {
        let (_, ctl, _) = setup();
        assert_eq!(ctl.ramp(), MIN_RAMP);
        let long = GainController::new(ctl.node(), Duration::from_secs(2));
        assert_eq!(long.ramp(), MAX_RAMP);
    }

    #[test]
    fn mute_ramps_instead_of_jumping() {
        let (mut graph, ctl, track) = setup();
        advance(&mut graph, 256);
        ctl.set_muted(&mut graph, &track, true).unwrap();
        assert!(!track.is_enabled());

        let now = graph.current_time();
        let param = graph.param(ctl.node(), ParamKind::Gain).unwrap();
        assert_eq!(param.value_at(now), 1.0);
        assert!((param.value_at(now + 0.01) - 0.5).abs() < 1e-3);
        assert_eq!(param.value_at(now + 0.02), 0.0);
    }

    #[test]
    fn mute_then_unmute_ends_open() {
        let (mut graph, ctl, track) = setup();
        ctl.set_muted(&mut graph, &track, true).unwrap();
        ctl.set_muted(&mut graph, &track, false).unwrap();
        assert!(track.is_enabled());
        assert_eq!(settled_gain(&graph, &ctl), 1.0);
    }

    #[test]
    fn unmute_mid_ramp_starts_from_current_gain() {
        let (mut graph, ctl, track) = setup();
        ctl.set_muted(&mut graph, &track, true).unwrap();
        advance(&mut graph, 480);
        ctl.set_muted(&mut graph, &track, false).unwrap();

        let now = graph.current_time();
        let param = graph.param(ctl.node(), ParamKind::Gain).unwrap();
        assert!((param.value_at(now) - 0.5).abs() < 1e-3);
    }

    proptest! {
        #[test]
        fn last_request_wins(steps in proptest::collection::vec((any::<bool>(), 0usize..2_000), 1..12)) {
            let (mut graph, ctl, track) = setup();
            for &(muted, frames) in &steps {
                ctl.set_muted(&mut graph, &track, muted).unwrap();
                advance(&mut graph, frames);
            }
            let last = steps[steps.len() - 1].0;
            prop_assert_eq!(track.is_enabled(), !last);
            prop_assert_eq!(settled_gain(&graph, &ctl), GainController::target_gain(last));
        }
    }
}
