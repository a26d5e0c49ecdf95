use serde::{Deserialize, Serialize};

/// Reason why a channel's playback task ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Every buffer came back empty and the sound was not looping.
    Eof,
    /// The owner asked the task to stop.
    Stopped,
    /// The task could not be started or died unexpectedly.
    Error,
}

/// Lifecycle of a playback task.
///
/// `Idle -> Running -> (Stopping | Finished)`; a restart goes back through `Idle`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Stopping,
    Finished,
}

impl TaskState {
    /// Decode a state previously stored with [`TaskState::as_u8`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Finished,
            _ => Self::Idle,
        }
    }

    /// Compact encoding for atomics shared with the task thread.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Finished => 3,
        }
    }
}

/// Point-in-time view of one sound instance.
///
/// Inert sounds (no channel could be assigned) report `channel: None` and stay `Idle`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoundStatus {
    /// Path the sound was opened from, relative to the storage root.
    pub source_path: String,
    /// Hardware channel index owned by the sound.
    pub channel: Option<usize>,
    /// Current task state.
    pub state: TaskState,
    /// Decode position in milliseconds, updated by the playback task.
    pub elapsed_ms: u64,
    /// Total stream length in milliseconds.
    pub total_length_ms: u64,
    /// Whether the sound restarts from zero at end of stream.
    pub looping: bool,
    /// Stream sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Stream channel count.
    pub channels: Option<u16>,
    /// Why the last playback run ended, if it has.
    pub end_reason: Option<PlaybackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_u8() {
        for state in [
            TaskState::Idle,
            TaskState::Running,
            TaskState::Stopping,
            TaskState::Finished,
        ] {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
        assert_eq!(TaskState::from_u8(200), TaskState::Idle);
    }

    #[test]
    fn status_serializes_snake_case() {
        let status = SoundStatus {
            source_path: "music/theme.ogg".to_string(),
            channel: Some(3),
            state: TaskState::Finished,
            end_reason: Some(PlaybackEndReason::Eof),
            ..SoundStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "finished");
        assert_eq!(json["end_reason"], "eof");
        assert_eq!(json["channel"], 3);
    }
}
