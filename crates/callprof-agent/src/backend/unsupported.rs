//! Stand-in for platforms without a native sampling mechanism.

use super::{SampleSink, SamplingBackend};
use crate::args::{EventType, Mode};

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl SamplingBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn supports(&self, _mode: Mode, _event: EventType) -> bool {
        false
    }

    fn start(&mut self, _interval: u64, _event: EventType, _sink: &'static dyn SampleSink) -> bool {
        false
    }

    fn stop(&mut self) {}
}
