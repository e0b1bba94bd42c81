//! The per-robot topic namespace.
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `robot/{id}/status` | out, retained | `{online, state, current_animation}` |
//! | `robot/{id}/animation/play` | in | `{file, delay_ms?, loop?, resume_auto?}` |
//! | `robot/{id}/animation/stop` | in | `{}` |
//! | `robot/{id}/system` | in | `{command: shutdown\|reboot}` |

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Play,
    Stop,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub status: String,
    pub play: String,
    pub stop: String,
    pub system: String,
}

impl TopicSet {
    pub fn new(robot_id: &str) -> Self {
        let base = format!("robot/{robot_id}");
        Self {
            status: format!("{base}/status"),
            play: format!("{base}/animation/play"),
            stop: format!("{base}/animation/stop"),
            system: format!("{base}/system"),
        }
    }

    /// Topics the daemon subscribes to.
    pub fn inbound(&self) -> [&str; 3] {
        [&self.play, &self.stop, &self.system]
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        if topic == self.play {
            Some(InboundTopic::Play)
        } else if topic == self.stop {
            Some(InboundTopic::Stop)
        } else if topic == self.system {
            Some(InboundTopic::System)
        } else {
            None
        }
    }
}
