//! Cluster status subdocument: phase, member readiness, condition log.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::backup::BackupServiceStatus;

/// The condition log keeps the most recent transitions only.
const MAX_CONDITIONS: usize = 10;

/// Lifecycle phase of a managed cluster.
///
/// Only the reconcile engine mutates the phase. The persisted strings are
/// part of the API: "Creating", "Running", "Failed" (and "None" before the
/// first transition).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ClusterPhase {
    #[default]
    None,
    Creating,
    Running,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// True while reconciliation is paused by the spec
    #[serde(default)]
    pub control_paused: bool,

    /// Actual number of members the controller accounts for
    #[serde(default)]
    pub size: i32,

    /// Version the running members converged to
    #[serde(default)]
    pub current_version: String,

    /// Member readiness as of the last health sweep
    #[serde(default)]
    pub members: MembersStatus,

    /// Human-readable cause of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Ordered log of recent transitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    /// Mirror of the backup sidecar's reported status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_service_status: Option<BackupServiceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MembersStatus {
    /// Members answering their health endpoint
    #[serde(default)]
    pub ready: Vec<String>,

    /// Members that exist but fail the health probe
    #[serde(default)]
    pub unready: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionType {
    Ready,
    RemovingDeadMember,
    ScalingUp,
    ScalingDown,
    Upgrading,
    Recovering,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub reason: String,

    /// RFC 3339 timestamp of the transition
    pub transition_time: String,
}

impl ClusterStatus {
    pub fn set_phase(&mut self, phase: ClusterPhase) {
        self.phase = phase;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn set_current_version(&mut self, version: impl Into<String>) {
        self.current_version = version.into();
    }

    /// Records the paused condition once; repeated ticks while paused do
    /// not grow the log.
    pub fn pause_control(&mut self) {
        if self.control_paused {
            return;
        }
        self.control_paused = true;
        self.append_condition(ConditionType::Paused, "spec.paused is true");
    }

    pub fn resume_control(&mut self) {
        self.control_paused = false;
    }

    pub fn append_removing_dead_member(&mut self, name: &str) {
        self.append_condition(
            ConditionType::RemovingDeadMember,
            format!("removing dead member {}", name),
        );
    }

    pub fn append_scaling_up_condition(&mut self, from: i32, to: i32) {
        self.append_condition(
            ConditionType::ScalingUp,
            format!("scaling up from {} to {}", from, to),
        );
    }

    pub fn append_scaling_down_condition(&mut self, from: i32, to: i32) {
        self.append_condition(
            ConditionType::ScalingDown,
            format!("scaling down from {} to {}", from, to),
        );
    }

    pub fn append_upgrading_condition(&mut self, to_version: &str, member: &str) {
        self.append_condition(
            ConditionType::Upgrading,
            format!("upgrading member {} to {}", member, to_version),
        );
    }

    pub fn append_recovering_condition(&mut self) {
        self.append_condition(
            ConditionType::Recovering,
            "disaster recovery from backup",
        );
    }

    fn append_condition(&mut self, condition_type: ConditionType, reason: impl Into<String>) {
        self.conditions.push(ClusterCondition {
            condition_type,
            reason: reason.into(),
            transition_time: chrono::Utc::now().to_rfc3339(),
        });
        if self.conditions.len() > MAX_CONDITIONS {
            let drop = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wire_strings_are_exact() {
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Creating).unwrap(),
            "\"Creating\""
        );
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Running).unwrap(),
            "\"Running\""
        );
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Failed).unwrap(),
            "\"Failed\""
        );
        let p: ClusterPhase = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(p, ClusterPhase::Running);
    }

    #[test]
    fn pause_condition_is_recorded_once() {
        let mut status = ClusterStatus::default();
        status.pause_control();
        status.pause_control();
        assert!(status.control_paused);
        assert_eq!(status.conditions.len(), 1);

        status.resume_control();
        assert!(!status.control_paused);
        status.pause_control();
        assert_eq!(status.conditions.len(), 2);
    }

    #[test]
    fn condition_log_is_bounded() {
        let mut status = ClusterStatus::default();
        for i in 0..25 {
            status.append_scaling_up_condition(i, i + 1);
        }
        assert_eq!(status.conditions.len(), MAX_CONDITIONS);
        // oldest entries were dropped
        assert!(status.conditions[0].reason.contains("15"));
    }

    #[test]
    fn members_status_serializes_camel_case() {
        let status = ClusterStatus {
            members: MembersStatus {
                ready: vec!["c-0000".into()],
                unready: vec!["c-0001".into()],
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["members"]["ready"][0], "c-0000");
        assert_eq!(json["members"]["unready"][0], "c-0001");
    }
}
