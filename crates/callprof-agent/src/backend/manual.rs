use super::{SampleSink, SamplingBackend};
use crate::args::{EventType, Mode};

/// Backend with no trigger of its own.
///
/// It accepts every mode and event and arms nothing; samples arrive only when
/// the host calls `Coordinator::record_sample` itself, e.g. from its own
/// event loop or when replaying captured stacks.
#[derive(Debug, Default)]
pub struct ManualBackend {
    armed: bool,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl SamplingBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn supports(&self, _mode: Mode, _event: EventType) -> bool {
        true
    }

    fn start(&mut self, interval: u64, _event: EventType, _sink: &'static dyn SampleSink) -> bool {
        if interval == 0 {
            return false;
        }
        self.armed = true;
        true
    }

    fn stop(&mut self) {
        self.armed = false;
    }
}
