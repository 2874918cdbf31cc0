//! Training run records and the run selection policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Terminal or in-progress state of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

/// A training run as reported by the tracking service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier, used as the version's source run reference
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Location of the exported model artifact
    pub artifact_location: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunRecord {
    /// Completion time, falling back to start time for runs without an end stamp
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.ended_at.unwrap_or(self.started_at)
    }
}

/// Policy picking which run to promote out of a candidate set
pub type RunSelector = fn(&[RunRecord]) -> Option<&RunRecord>;

/// Latest finished run by completion time, ties broken by the greatest run id.
///
/// Independent of the order the tracking service returned the runs in.
pub fn select_latest_run(runs: &[RunRecord]) -> Option<&RunRecord> {
    runs.iter()
        .filter(|r| r.status == RunStatus::Finished)
        .max_by(|a, b| match a.completed_at().cmp(&b.completed_at()) {
            Ordering::Equal => a.run_id.cmp(&b.run_id),
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run(id: &str, status: RunStatus, ended_min: u32) -> RunRecord {
        RunRecord {
            run_id: id.to_string(),
            status,
            started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ended_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 1, ended_min, 0).unwrap()),
            artifact_location: format!("runs/{}/model.json", id),
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_picks_latest_finished() {
        let runs = vec![
            run("a", RunStatus::Finished, 10),
            run("b", RunStatus::Failed, 50),
            run("c", RunStatus::Finished, 30),
            run("d", RunStatus::Running, 40),
        ];
        assert_eq!(select_latest_run(&runs).unwrap().run_id, "c");
    }

    #[test]
    fn test_tie_broken_by_run_id() {
        let runs = vec![
            run("run-b", RunStatus::Finished, 10),
            run("run-c", RunStatus::Finished, 10),
            run("run-a", RunStatus::Finished, 10),
        ];
        assert_eq!(select_latest_run(&runs).unwrap().run_id, "run-c");

        let mut reversed = runs.clone();
        reversed.reverse();
        assert_eq!(select_latest_run(&reversed).unwrap().run_id, "run-c");
    }

    #[test]
    fn test_no_finished_runs() {
        let runs = vec![run("a", RunStatus::Killed, 1)];
        assert!(select_latest_run(&runs).is_none());
        assert!(select_latest_run(&[]).is_none());
    }
}
