//! Events exchanged with peer brokers.
//!
//! Transport is somebody else's job: the manager publishes on an outbound
//! channel and consumes an inbound one.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEventKind {
    SubmitJob,
    WorkComplete,
    WorkData,
}

impl fmt::Display for ClusterEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEventKind::SubmitJob => write!(f, "SUBMIT_JOB"),
            ClusterEventKind::WorkComplete => write!(f, "WORK_COMPLETE"),
            ClusterEventKind::WorkData => write!(f, "WORK_DATA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub unique_id: String,
    pub function_name: String,
    pub kind: ClusterEventKind,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl ClusterEvent {
    pub fn new(
        kind: ClusterEventKind,
        function_name: impl Into<String>,
        unique_id: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            function_name: function_name.into(),
            kind,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let event = ClusterEvent::new(ClusterEventKind::WorkComplete, "resize", "u1", b"ok".to_vec());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "WORK_COMPLETE");
        assert_eq!(json["function_name"], "resize");

        let back: ClusterEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
