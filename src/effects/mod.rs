//! Voice effects and the chains that realise them on a [`SignalGraph`](crate::graph::SignalGraph).

mod chain;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use chain::{EffectChain, EffectChainBuilder};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceEffect {
    #[default]
    None,
    /// High-pass timbre shift; not a true pitch shifter.
    PitchUp,
    /// Low-pass timbre shift; not a true pitch shifter.
    PitchDown,
    Robot,
    Echo,
    Reverb,
    Underwater,
}

impl VoiceEffect {
    pub const ALL: [VoiceEffect; 7] = [
        VoiceEffect::None,
        VoiceEffect::PitchUp,
        VoiceEffect::PitchDown,
        VoiceEffect::Robot,
        VoiceEffect::Echo,
        VoiceEffect::Reverb,
        VoiceEffect::Underwater,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VoiceEffect::None => "none",
            VoiceEffect::PitchUp => "pitch-up",
            VoiceEffect::PitchDown => "pitch-down",
            VoiceEffect::Robot => "robot",
            VoiceEffect::Echo => "echo",
            VoiceEffect::Reverb => "reverb",
            VoiceEffect::Underwater => "underwater",
        }
    }
}

impl fmt::Display for VoiceEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEffect(pub String);

impl fmt::Display for UnknownEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown voice effect '{}'", self.0)
    }
}

impl std::error::Error for UnknownEffect {}

impl FromStr for VoiceEffect {
    type Err = UnknownEffect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        VoiceEffect::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownEffect(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for effect in VoiceEffect::ALL {
            assert_eq!(effect.to_string().parse::<VoiceEffect>(), Ok(effect));
        }
        assert!("chipmunk".parse::<VoiceEffect>().is_err());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&VoiceEffect::PitchUp).unwrap();
        assert_eq!(json, "\"pitch-up\"");
        let back: VoiceEffect = serde_json::from_str("\"underwater\"").unwrap();
        assert_eq!(back, VoiceEffect::Underwater);
    }
}
