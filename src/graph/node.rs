//! Per-node DSP state for [`super::DspGraph`].

use std::f32::consts::{FRAC_PI_2, TAU};

use super::analyser::Analyser;
use super::param::AudioParam;
use super::{FilterKind, ParamKind, Waveform};

const NYQUIST_MARGIN: f32 = 0.49;

pub(crate) struct Node {
    pub kind: NodeKind,
    /// Mono output of the last processed quantum (mixdown for stereo nodes).
    pub out: Vec<f32>,
    /// Left/right outputs, only used by the panner and the destination.
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

pub(crate) enum NodeKind {
    Source,
    Gain(GainNode),
    Filter(BiquadNode),
    Delay(DelayNode),
    Oscillator(OscillatorNode),
    Panner(PannerNode),
    Analyser(Box<Analyser>),
    Destination,
}

impl Node {
    pub fn new(kind: NodeKind, quantum: usize) -> Self {
        let stereo = matches!(kind, NodeKind::Panner(_) | NodeKind::Destination);
        let stereo_len = if stereo { quantum } else { 0 };
        Self {
            kind,
            out: vec![0.0; quantum],
            left: vec![0.0; stereo_len],
            right: vec![0.0; stereo_len],
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self.kind, NodeKind::Panner(_) | NodeKind::Destination)
    }

    pub fn is_delay(&self) -> bool {
        matches!(self.kind, NodeKind::Delay(_))
    }

    pub fn accepts_input(&self) -> bool {
        !matches!(self.kind, NodeKind::Source | NodeKind::Oscillator(_))
    }

    pub fn produces_output(&self) -> bool {
        !matches!(self.kind, NodeKind::Destination)
    }

    /// The parameter that accepts audio-rate modulation from other nodes.
    pub fn modulation_target(&self) -> Option<ParamKind> {
        match self.kind {
            NodeKind::Gain(_) => Some(ParamKind::Gain),
            NodeKind::Filter(_) | NodeKind::Oscillator(_) => Some(ParamKind::Frequency),
            NodeKind::Panner(_) => Some(ParamKind::Pan),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            NodeKind::Source => "source",
            NodeKind::Gain(_) => "gain",
            NodeKind::Filter(_) => "filter",
            NodeKind::Delay(_) => "delay",
            NodeKind::Oscillator(_) => "oscillator",
            NodeKind::Panner(_) => "panner",
            NodeKind::Analyser(_) => "analyser",
            NodeKind::Destination => "destination",
        }
    }

    pub fn param(&self, kind: ParamKind) -> Option<&AudioParam> {
        match (&self.kind, kind) {
            (NodeKind::Gain(n), ParamKind::Gain) => Some(&n.gain),
            (NodeKind::Filter(n), ParamKind::Frequency) => Some(&n.frequency),
            (NodeKind::Filter(n), ParamKind::Q) => Some(&n.q),
            (NodeKind::Delay(n), ParamKind::DelayTime) => Some(&n.delay_time),
            (NodeKind::Oscillator(n), ParamKind::Frequency) => Some(&n.frequency),
            (NodeKind::Panner(n), ParamKind::Pan) => Some(&n.pan),
            _ => None,
        }
    }

    pub fn param_mut(&mut self, kind: ParamKind) -> Option<&mut AudioParam> {
        match (&mut self.kind, kind) {
            (NodeKind::Gain(n), ParamKind::Gain) => Some(&mut n.gain),
            (NodeKind::Filter(n), ParamKind::Frequency) => Some(&mut n.frequency),
            (NodeKind::Filter(n), ParamKind::Q) => Some(&mut n.q),
            (NodeKind::Delay(n), ParamKind::DelayTime) => Some(&mut n.delay_time),
            (NodeKind::Oscillator(n), ParamKind::Frequency) => Some(&mut n.frequency),
            (NodeKind::Panner(n), ParamKind::Pan) => Some(&mut n.pan),
            _ => None,
        }
    }

    pub fn prune_params(&mut self, now: f64) {
        match &mut self.kind {
            NodeKind::Gain(n) => n.gain.prune(now),
            NodeKind::Filter(n) => {
                n.frequency.prune(now);
                n.q.prune(now);
            }
            NodeKind::Delay(n) => n.delay_time.prune(now),
            NodeKind::Oscillator(n) => n.frequency.prune(now),
            NodeKind::Panner(n) => n.pan.prune(now),
            _ => {}
        }
    }
}

/// Timing for one render quantum.
#[derive(Clone, Copy)]
pub(crate) struct Quantum {
    pub time: f64,
    pub sample_rate: f32,
    pub frames: usize,
}

impl Quantum {
    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate as f64
    }
}

// ======================== Gain ========================

pub(crate) struct GainNode {
    pub gain: AudioParam,
    values: Vec<f32>,
}

impl GainNode {
    pub fn new(gain: f32, quantum: usize) -> Self {
        Self {
            gain: AudioParam::new(gain, -1000.0, 1000.0),
            values: vec![0.0; quantum],
        }
    }

    pub fn process(&mut self, q: Quantum, input: &[f32], modulation: &[f32], out: &mut [f32]) {
        let values = &mut self.values[..q.frames];
        self.gain.fill(q.time, q.dt(), values);
        for i in 0..q.frames {
            let g = self.gain.clamp(values[i] + modulation[i]);
            out[i] = input[i] * g;
        }
    }
}

// ======================== Biquad ========================

pub(crate) struct BiquadNode {
    pub kind: FilterKind,
    pub frequency: AudioParam,
    pub q: AudioParam,
    coeffs: [f32; 5],
    coeff_key: (f32, f32, f32),
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadNode {
    pub fn new(kind: FilterKind, frequency: f32, q: f32, sample_rate: f32) -> Self {
        let nyquist = sample_rate * 0.5;
        Self {
            kind,
            frequency: AudioParam::new(frequency, 10.0, nyquist),
            q: AudioParam::new(q, 0.0001, 1000.0),
            coeffs: [1.0, 0.0, 0.0, 0.0, 0.0],
            coeff_key: (f32::NAN, f32::NAN, f32::NAN),
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Cutoff and Q are evaluated once per quantum (k-rate); modulation is
    /// taken from the first frame of the quantum.
    pub fn process(&mut self, q: Quantum, input: &[f32], modulation: &[f32], out: &mut [f32]) {
        let freq = self
            .frequency
            .clamp(self.frequency.value_at(q.time) + modulation.first().copied().unwrap_or(0.0));
        let res = self.q.value_at(q.time);
        self.update_coefficients(freq, res, q.sample_rate);

        let [b0, b1, b2, a1, a2] = self.coeffs;
        for i in 0..q.frames {
            let x = input[i];
            let mut y = b0 * x + b1 * self.x1 + b2 * self.x2 - a1 * self.y1 - a2 * self.y2;
            if !y.is_finite() {
                y = 0.0;
                self.y1 = 0.0;
                self.y2 = 0.0;
            }
            self.x2 = self.x1;
            self.x1 = x;
            self.y2 = self.y1;
            self.y1 = y;
            out[i] = y;
        }
    }

    fn update_coefficients(&mut self, freq: f32, q: f32, sample_rate: f32) {
        let key = (freq, q, sample_rate);
        if key == self.coeff_key {
            return;
        }
        self.coeff_key = key;

        // RBJ cookbook
        let f = freq.min(sample_rate * NYQUIST_MARGIN);
        let w0 = TAU * f / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let a0 = 1.0 + alpha;
        let (b0, b1, b2) = match self.kind {
            FilterKind::LowPass => ((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0),
            FilterKind::HighPass => ((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0),
        };
        self.coeffs = [
            b0 / a0,
            b1 / a0,
            b2 / a0,
            (-2.0 * cos) / a0,
            (1.0 - alpha) / a0,
        ];
    }
}

// ======================== Delay ========================

pub(crate) struct DelayNode {
    pub delay_time: AudioParam,
    ring: Vec<f32>,
    write_pos: usize,
}

impl DelayNode {
    /// `min_seconds` keeps feedback loops at least one quantum long.
    pub fn new(seconds: f32, max_seconds: f32, min_seconds: f32, sample_rate: f32, quantum: usize) -> Self {
        let max_seconds = max_seconds.max(seconds).max(min_seconds);
        let capacity = (max_seconds * sample_rate).ceil() as usize + quantum + 1;
        Self {
            delay_time: AudioParam::new(seconds, min_seconds, max_seconds),
            ring: vec![0.0; capacity],
            write_pos: 0,
        }
    }

    /// Read the delayed signal for the coming quantum before any input is absorbed.
    pub fn emit(&mut self, q: Quantum, out: &mut [f32]) {
        let delay = (self.delay_time.value_at(q.time) * q.sample_rate).round() as usize;
        let len = self.ring.len();
        let delay = delay.clamp(q.frames, len - 1);
        let mut read = (self.write_pos + len - delay) % len;
        for sample in out.iter_mut().take(q.frames) {
            *sample = self.ring[read];
            read = (read + 1) % len;
        }
    }

    pub fn absorb(&mut self, input: &[f32]) {
        let len = self.ring.len();
        for &s in input {
            self.ring[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % len;
        }
    }
}

// ======================== Oscillator ========================

pub(crate) struct OscillatorNode {
    pub waveform: Waveform,
    pub frequency: AudioParam,
    pub started: bool,
    pub stopped: bool,
    phase: f32,
}

impl OscillatorNode {
    pub fn new(waveform: Waveform, frequency: f32, sample_rate: f32) -> Self {
        let nyquist = sample_rate * 0.5;
        Self {
            waveform,
            frequency: AudioParam::new(frequency, -nyquist, nyquist),
            started: false,
            stopped: false,
            phase: 0.0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    pub fn process(&mut self, q: Quantum, modulation: &[f32], out: &mut [f32]) {
        if !self.is_running() {
            out[..q.frames].fill(0.0);
            return;
        }
        let base = self.frequency.value_at(q.time);
        for i in 0..q.frames {
            let freq = self.frequency.clamp(base + modulation[i]);
            out[i] = waveform_sample(self.waveform, self.phase);
            self.phase = (self.phase + freq / q.sample_rate).rem_euclid(1.0);
        }
    }
}

fn waveform_sample(waveform: Waveform, phase: f32) -> f32 {
    match waveform {
        Waveform::Sine => (TAU * phase).sin(),
        Waveform::Square => {
            if phase < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        Waveform::Sawtooth => 2.0 * phase - 1.0,
        Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
    }
}

// ======================== Stereo panner ========================

pub(crate) struct PannerNode {
    pub pan: AudioParam,
    values: Vec<f32>,
}

impl PannerNode {
    pub fn new(quantum: usize) -> Self {
        Self {
            pan: AudioParam::new(0.0, -1.0, 1.0),
            values: vec![0.0; quantum],
        }
    }

    /// Equal-power pan of a mono input.
    pub fn process(
        &mut self,
        q: Quantum,
        input: &[f32],
        modulation: &[f32],
        left: &mut [f32],
        right: &mut [f32],
        mono: &mut [f32],
    ) {
        let values = &mut self.values[..q.frames];
        self.pan.fill(q.time, q.dt(), values);
        for i in 0..q.frames {
            let pan = self.pan.clamp(values[i] + modulation[i]);
            let x = (pan + 1.0) * 0.5 * FRAC_PI_2;
            left[i] = input[i] * x.cos();
            right[i] = input[i] * x.sin();
            mono[i] = 0.5 * (left[i] + right[i]);
        }
    }
}
