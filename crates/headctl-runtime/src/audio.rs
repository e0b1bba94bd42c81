//! Audio cue seam.
//!
//! Decoding and output belong to an external player. The control loop only
//! tells it when a bundle's segment starts (and from which offset) and when
//! it must stop.

use headctl_bundle::AudioSegment;
use tracing::info;

pub trait AudioSink: Send {
    fn start(&mut self, bundle_id: &str, segment: &AudioSegment, offset_ms: u32);
    fn stop(&mut self);
}

/// Default sink: logs each cue.
#[derive(Debug, Default)]
pub struct LogAudioSink {
    playing: Option<String>,
}

impl AudioSink for LogAudioSink {
    fn start(&mut self, bundle_id: &str, segment: &AudioSegment, offset_ms: u32) {
        if segment.is_silent() {
            return;
        }
        info!(
            bundle = bundle_id,
            encoding = ?segment.encoding,
            offset_ms,
            bytes = segment.data.len(),
            "audio cue: start"
        );
        self.playing = Some(bundle_id.to_string());
    }

    fn stop(&mut self) {
        if let Some(bundle) = self.playing.take() {
            info!(bundle = %bundle, "audio cue: stop");
        }
    }
}
