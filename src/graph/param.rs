//! Automatable node parameters.

/// A scheduled change on an [`AudioParam`] timeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AutomationEvent {
    SetValue { time: f64, value: f32 },
    LinearRamp { time: f64, value: f32 },
}

impl AutomationEvent {
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. } | AutomationEvent::LinearRamp { time, .. } => time,
        }
    }

    pub fn value(&self) -> f32 {
        match *self {
            AutomationEvent::SetValue { value, .. } | AutomationEvent::LinearRamp { value, .. } => {
                value
            }
        }
    }
}

/// Parameter with an intrinsic value, an automation timeline and a clamp range.
///
/// Values requested for a time are resolved against the timeline first; the
/// intrinsic value applies before the first event. Modulation from connected
/// nodes is added on top by the graph and clamped afterwards.
#[derive(Clone, Debug)]
pub struct AudioParam {
    value: f32,
    min: f32,
    max: f32,
    events: Vec<AutomationEvent>,
}

impl AudioParam {
    pub fn new(value: f32, min: f32, max: f32) -> Self {
        Self {
            value: value.clamp(min, max),
            min,
            max,
            events: Vec::new(),
        }
    }

    /// Set the intrinsic value. Scheduled events still take precedence.
    pub fn set_value(&mut self, value: f32) {
        self.value = self.clamp(value);
    }

    /// The intrinsic value, ignoring automation.
    pub fn intrinsic(&self) -> f32 {
        self.value
    }

    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    pub fn has_automation(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn set_value_at_time(&mut self, value: f32, time: f64) {
        let value = self.clamp(value);
        self.insert(AutomationEvent::SetValue { time, value });
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f32, time: f64) {
        let value = self.clamp(value);
        self.insert(AutomationEvent::LinearRamp { time, value });
    }

    /// Drop every event scheduled at or after `time`.
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    /// Value once every scheduled event has played out.
    pub fn settled_value(&self) -> f32 {
        self.events.last().map_or(self.value, AutomationEvent::value)
    }

    /// Resolved value at `time`, without modulation.
    pub fn value_at(&self, time: f64) -> f32 {
        // Index of the first event strictly after `time`.
        let next = self.events.partition_point(|e| e.time() <= time);

        let (start_time, start_value) = match next.checked_sub(1) {
            Some(i) => (self.events[i].time(), self.events[i].value()),
            None => (0.0, self.value),
        };

        match self.events.get(next) {
            Some(&AutomationEvent::LinearRamp { time: end, value }) if end > start_time => {
                let t = ((time - start_time) / (end - start_time)).clamp(0.0, 1.0) as f32;
                start_value + (value - start_value) * t
            }
            _ => start_value,
        }
    }

    /// Fill `out` with per-sample values starting at `start`, spaced `dt` apart.
    pub fn fill(&self, start: f64, dt: f64, out: &mut [f32]) {
        if self.events.is_empty() {
            out.fill(self.value);
            return;
        }
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.value_at(start + dt * i as f64);
        }
    }

    /// Fold events that lie entirely in the past into the intrinsic value.
    pub fn prune(&mut self, now: f64) {
        while self.events.len() >= 2 && self.events[1].time() <= now {
            self.events.remove(0);
        }
        if self.events.len() == 1 && self.events[0].time() <= now {
            self.value = self.events[0].value();
            self.events.clear();
        }
    }

    pub(crate) fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.value;
        }
        value.clamp(self.min, self.max)
    }

    fn insert(&mut self, event: AutomationEvent) {
        // Events at the same time keep insertion order.
        let at = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_value_applies_without_events() {
        let p = AudioParam::new(0.5, 0.0, 1.0);
        assert_eq!(p.value_at(10.0), 0.5);
    }

    #[test]
    fn linear_ramp_interpolates_from_previous_event() {
        let mut p = AudioParam::new(1.0, 0.0, 1.0);
        p.set_value_at_time(1.0, 1.0);
        p.linear_ramp_to_value_at_time(0.0, 1.02);
        assert_eq!(p.value_at(0.5), 1.0);
        assert!((p.value_at(1.01) - 0.5).abs() < 1e-3);
        assert_eq!(p.value_at(1.02), 0.0);
        assert_eq!(p.value_at(5.0), 0.0);
        assert_eq!(p.settled_value(), 0.0);
    }

    #[test]
    fn cancel_drops_future_events_only() {
        let mut p = AudioParam::new(1.0, 0.0, 1.0);
        p.set_value_at_time(0.2, 1.0);
        p.set_value_at_time(0.8, 2.0);
        p.cancel_scheduled_values(1.5);
        assert_eq!(p.events().len(), 1);
        assert_eq!(p.value_at(3.0), 0.2);
    }

    #[test]
    fn prune_folds_finished_ramp_into_intrinsic() {
        let mut p = AudioParam::new(1.0, 0.0, 1.0);
        p.set_value_at_time(1.0, 0.0);
        p.linear_ramp_to_value_at_time(0.0, 0.02);
        p.prune(0.01);
        assert!(p.has_automation());
        p.prune(0.05);
        assert!(!p.has_automation());
        assert_eq!(p.intrinsic(), 0.0);
    }

    #[test]
    fn values_are_clamped_to_range() {
        let mut p = AudioParam::new(0.0, -1.0, 1.0);
        p.set_value(4.0);
        assert_eq!(p.intrinsic(), 1.0);
        p.set_value(f32::NAN);
        assert_eq!(p.intrinsic(), 1.0);
    }
}
