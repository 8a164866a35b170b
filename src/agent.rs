//! Stub agents shipped with the runner.
//!
//! They exist to exercise the pipeline end to end, not to play well.

use tracing::trace;

use crate::game_interface::Agent;

/// Kicks on every frame.
#[derive(Debug, Default, Clone)]
pub struct KickAgent;

impl KickAgent {
    /// Command sent on every frame.
    pub const ACTION: &'static str = "B";
}

impl Agent for KickAgent {
    fn name(&self) -> String {
        "KickAI".to_owned()
    }

    fn act(&mut self, _state: &str) -> String {
        Self::ACTION.to_owned()
    }
}

/// Watches the frames go by and never presses anything.
#[derive(Debug, Default, Clone)]
pub struct DisplayInfoAgent {
    frames_seen: u64,
}

impl DisplayInfoAgent {
    /// Number of frames received so far.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl Agent for DisplayInfoAgent {
    fn name(&self) -> String {
        "DisplayInfo".to_owned()
    }

    fn act(&mut self, state: &str) -> String {
        self.frames_seen += 1;
        trace!(frame = self.frames_seen, bytes = state.len(), "frame received");
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_always_kicks() {
        let mut agent = KickAgent;
        assert_eq!(agent.act("frame 1"), "B");
        assert_eq!(agent.act(""), "B");
        assert_eq!(agent.name(), "KickAI");
    }

    #[test]
    fn display_info_counts_frames() {
        let mut agent = DisplayInfoAgent::default();
        assert_eq!(agent.act("frame 1"), "");
        assert_eq!(agent.act("frame 2"), "");
        assert_eq!(agent.frames_seen(), 2);
        assert_eq!(agent.name(), "DisplayInfo");
    }
}
