//! Weighted threat scoring
//!
//! Maps triggered behavioral indicators to a bounded score and classifies
//! the result:
//!
//! ```text
//!     0-30   Normal      escalation 0
//!    31-50   Suspicious  escalation 1
//!    51-70   Likely      escalation 2
//!    71-85   Critical    escalation 3
//!    86-100  Critical    escalation 4
//! ```
//!
//! Indicator weights intentionally sum to 120 so that a combination of
//! several strong signals crosses the action threshold comfortably; the
//! final score is clamped to 100.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::detectors::Detection;

/// Confidence classification of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    /// Normal activity
    Normal,
    /// Suspicious, monitor closely
    Suspicious,
    /// Likely threat, prepare response
    Likely,
    /// Critical threat, immediate action
    Critical,
}

impl ThreatLevel {
    /// Classify a clamped score into a level. Bands are closed on both ends.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=30 => ThreatLevel::Normal,
            31..=50 => ThreatLevel::Suspicious,
            51..=70 => ThreatLevel::Likely,
            _ => ThreatLevel::Critical,
        }
    }

    /// Stable string form for the database and alert payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::Normal => "normal",
            ThreatLevel::Suspicious => "suspicious",
            ThreatLevel::Likely => "likely",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl std::str::FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(ThreatLevel::Normal),
            "suspicious" => Ok(ThreatLevel::Suspicious),
            "likely" => Ok(ThreatLevel::Likely),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(format!("unknown threat level: {other}")),
        }
    }
}

/// Map a clamped score to a response escalation level (0-4).
pub fn escalation_for(score: u8) -> u8 {
    match score {
        0..=30 => 0,
        31..=50 => 1,
        51..=70 => 2,
        71..=85 => 3,
        _ => 4,
    }
}

/// Evidence attached to a triggered indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    /// Plain occurrence count (mass modification, traversal, deletions)
    Count { count: usize },
    /// Entropy spikes: how many files and the largest delta seen
    Delta { count: usize, max_delta: f64 },
    /// Offending paths (extension manipulation, suspicious executable)
    Paths { paths: Vec<PathBuf> },
}

/// One action attempted by the response engine, with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionRecord {
    pub fn ok(action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            success: true,
            detail: None,
        }
    }

    pub fn failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            success: false,
            detail: Some(reason.into()),
        }
    }

    pub fn with_detail(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            success: true,
            detail: Some(detail.into()),
        }
    }
}

/// Immutable record of one threshold crossing for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    /// Store rowid; 0 until persisted.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub process_name: String,
    pub process_exe: Option<PathBuf>,
    pub score: u8,
    pub level: ThreatLevel,
    pub escalation: u8,
    /// Indicator name -> evidence, sorted for stable serialization.
    pub indicators: BTreeMap<String, Evidence>,
    /// Filled in by the response engine as it acts.
    pub actions_taken: Vec<ActionRecord>,
    /// Level-4 incident report, attached after response completes.
    pub incident_report: Option<serde_json::Value>,
}

/// Combine detector outputs into a scored result.
///
/// Stateless: the same detections always produce the same score.
pub fn score(detections: &[Detection]) -> (u8, ThreatLevel, u8) {
    let raw: u32 = detections
        .iter()
        .filter(|d| d.triggered)
        .map(|d| u32::from(d.weight))
        .sum();
    let score = raw.min(100) as u8;
    (score, ThreatLevel::from_score(score), escalation_for(score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::detectors::Detection;

    fn triggered(weight: u8) -> Detection {
        Detection {
            indicator: "test",
            triggered: true,
            weight,
            evidence: Some(Evidence::Count { count: 1 }),
        }
    }

    #[test]
    fn test_level_band_boundaries() {
        assert_eq!(ThreatLevel::from_score(0), ThreatLevel::Normal);
        assert_eq!(ThreatLevel::from_score(30), ThreatLevel::Normal);
        assert_eq!(ThreatLevel::from_score(31), ThreatLevel::Suspicious);
        assert_eq!(ThreatLevel::from_score(50), ThreatLevel::Suspicious);
        assert_eq!(ThreatLevel::from_score(51), ThreatLevel::Likely);
        assert_eq!(ThreatLevel::from_score(70), ThreatLevel::Likely);
        assert_eq!(ThreatLevel::from_score(71), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_score(100), ThreatLevel::Critical);
    }

    #[test]
    fn test_escalation_boundaries() {
        assert_eq!(escalation_for(30), 0);
        assert_eq!(escalation_for(31), 1);
        assert_eq!(escalation_for(50), 1);
        assert_eq!(escalation_for(51), 2);
        assert_eq!(escalation_for(70), 2);
        assert_eq!(escalation_for(71), 3);
        assert_eq!(escalation_for(85), 3);
        assert_eq!(escalation_for(86), 4);
        assert_eq!(escalation_for(100), 4);
    }

    #[test]
    fn test_score_sums_triggered_weights() {
        let detections = vec![
            triggered(25),
            triggered(30),
            Detection {
                indicator: "quiet",
                triggered: false,
                weight: 25,
                evidence: None,
            },
        ];
        let (s, level, esc) = score(&detections);
        assert_eq!(s, 55);
        assert_eq!(level, ThreatLevel::Likely);
        assert_eq!(esc, 2);
    }

    #[test]
    fn test_score_clamped_to_100() {
        // All six weights sum to 120
        let detections = vec![
            triggered(25),
            triggered(30),
            triggered(25),
            triggered(10),
            triggered(10),
            triggered(20),
        ];
        let (s, level, esc) = score(&detections);
        assert_eq!(s, 100);
        assert_eq!(level, ThreatLevel::Critical);
        assert_eq!(esc, 4);
    }

    #[test]
    fn test_no_detections_is_normal() {
        let (s, level, esc) = score(&[]);
        assert_eq!(s, 0);
        assert_eq!(level, ThreatLevel::Normal);
        assert_eq!(esc, 0);
    }

    #[test]
    fn test_level_round_trip() {
        for level in [
            ThreatLevel::Normal,
            ThreatLevel::Suspicious,
            ThreatLevel::Likely,
            ThreatLevel::Critical,
        ] {
            assert_eq!(level.as_str().parse::<ThreatLevel>().unwrap(), level);
        }
    }
}
