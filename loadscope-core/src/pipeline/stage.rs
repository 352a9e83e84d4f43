use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline states in the order they are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Idle,
    TitleTime,
    RenderTime,
    InteractiveTime,
    Ttfb,
    SocketAnalysis,
    AuditAnalysis,
    HeapSeries,
    Complete,
    Error,
}

impl Stage {
    /// Measurement stages, in execution order.
    pub const PROBES: [Stage; 7] = [
        Stage::TitleTime,
        Stage::RenderTime,
        Stage::InteractiveTime,
        Stage::Ttfb,
        Stage::SocketAnalysis,
        Stage::AuditAnalysis,
        Stage::HeapSeries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::TitleTime => "titleTime",
            Stage::RenderTime => "renderTime",
            Stage::InteractiveTime => "interactiveTime",
            Stage::Ttfb => "ttfb",
            Stage::SocketAnalysis => "socketAnalysis",
            Stage::AuditAnalysis => "auditAnalysis",
            Stage::HeapSeries => "heapSeries",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::TitleTime),
            Stage::TitleTime => Some(Stage::RenderTime),
            Stage::RenderTime => Some(Stage::InteractiveTime),
            Stage::InteractiveTime => Some(Stage::Ttfb),
            Stage::Ttfb => Some(Stage::SocketAnalysis),
            Stage::SocketAnalysis => Some(Stage::AuditAnalysis),
            Stage::AuditAnalysis => Some(Stage::HeapSeries),
            Stage::HeapSeries => Some(Stage::Complete),
            Stage::Complete | Stage::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walking_next_visits_probe_stages_in_order() {
        let mut visited = Vec::new();
        let mut stage = Stage::Idle;
        while let Some(next) = stage.next() {
            if !next.is_terminal() {
                visited.push(next);
            }
            stage = next;
        }
        assert_eq!(visited, Stage::PROBES.to_vec());
        assert_eq!(stage, Stage::Complete);
    }

    #[test]
    fn display_matches_wire_name() {
        for stage in Stage::PROBES {
            let wire = serde_json::to_value(stage).unwrap();
            assert_eq!(wire, stage.to_string());
        }
    }
}
