use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use super::server::{Locator, Server};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unstarted" => Some(Self::Unstarted),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the phase lifecycle a failure happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Remote check or pre-check failed; the phase never touched its target.
    Precondition,
    /// The phase effect was partially or fully applied.
    Execution,
    /// The agent stream ended without a terminal message or was malformed.
    Protocol,
    /// Compensation for a prior execution failed.
    Rollback,
    /// Agent cleanup after an abort failed.
    Abort,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::Execution => "execution",
            Self::Protocol => "protocol",
            Self::Rollback => "rollback",
            Self::Abort => "abort",
        }
    }

    /// Whether a failure of this kind may have left effects on the target.
    pub fn has_effect(&self) -> bool {
        matches!(self, Self::Execution | Self::Protocol)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub kind: FailureKind,
    pub message: String,
}

impl PhaseError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Locator>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    /// Phase kind tag used to pick the executor.
    pub executor: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: PhaseData,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
}

impl Phase {
    pub fn new(id: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executor: executor.into(),
            description: String::new(),
            data: PhaseData::default(),
            requires: Vec::new(),
            state: PhaseState::default(),
            error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_server(mut self, server: Server) -> Self {
        self.data.server = Some(server);
        self
    }

    pub fn with_package(mut self, package: Locator) -> Self {
        self.data.package = Some(package);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.labels.insert(key.into(), value.into());
        self
    }

    pub fn requires(mut self, id: impl Into<String>) -> Self {
        self.requires.push(id.into());
        self
    }

    pub fn with_state(mut self, state: PhaseState) -> Self {
        self.state = state;
        self
    }
}

/// Identity of the operation a plan belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub cluster_name: String,
    pub operation_id: String,
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_name, self.operation_id)
    }
}

/// One entry of the plan audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChange {
    pub seq: u64,
    pub phase_id: String,
    pub new_state: PhaseState,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub operation_id: String,
    pub cluster_name: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub changelog: Vec<PlanChange>,
}

impl Plan {
    pub fn new(operation_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            cluster_name: cluster_name.into(),
            phases: Vec::new(),
            changelog: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            cluster_name: self.cluster_name.clone(),
            operation_id: self.operation_id.clone(),
        }
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<PhaseState> {
        self.phase(id).map(|phase| phase.state)
    }

    /// Checks that phase ids are unique, every prerequisite exists and the
    /// prerequisite graph has no cycles.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(CoreError::DuplicatePhase(phase.id.clone()));
            }
        }

        for phase in &self.phases {
            for requires in &phase.requires {
                if !seen.contains(requires.as_str()) {
                    return Err(CoreError::UnknownPrerequisite {
                        phase: phase.id.clone(),
                        requires: requires.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm: anything left over sits on a cycle.
        let mut pending: HashMap<&str, usize> = self
            .phases
            .iter()
            .map(|phase| (phase.id.as_str(), phase.requires.len()))
            .collect();
        let mut ready: Vec<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = ready.pop() {
            pending.remove(id);
            for phase in &self.phases {
                let edges = phase.requires.iter().filter(|r| *r == id).count();
                if edges == 0 {
                    continue;
                }
                if let Some(count) = pending.get_mut(phase.id.as_str()) {
                    *count -= edges;
                    if *count == 0 {
                        ready.push(phase.id.as_str());
                    }
                }
            }
        }

        match self
            .phases
            .iter()
            .find(|phase| pending.contains_key(phase.id.as_str()))
        {
            Some(phase) => Err(CoreError::DependencyCycle(phase.id.clone())),
            None => Ok(()),
        }
    }

    /// Phases that are unstarted and whose prerequisites have all completed,
    /// in plan order.
    pub fn runnable(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|phase| phase.state == PhaseState::Unstarted)
            .filter(|phase| {
                phase
                    .requires
                    .iter()
                    .all(|id| self.state_of(id) == Some(PhaseState::Completed))
            })
            .map(|phase| phase.id.clone())
            .collect()
    }

    /// Transitive prerequisites of a phase, not including the phase itself.
    pub fn prerequisites_of(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(phase) = self.phase(&current) {
                for requires in &phase.requires {
                    if found.insert(requires.clone()) {
                        stack.push(requires.clone());
                    }
                }
            }
        }
        found
    }

    /// Transitive dependents of a phase, not including the phase itself.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for phase in &self.phases {
                if phase.requires.iter().any(|r| *r == current) && found.insert(phase.id.clone())
                {
                    stack.push(phase.id.clone());
                }
            }
        }
        found
    }

    /// Sets the state of a phase and appends the change to the changelog.
    ///
    /// Transition legality is checked by the caller; this only records.
    pub fn record_transition(
        &mut self,
        id: &str,
        new_state: PhaseState,
        error: Option<PhaseError>,
    ) -> Result<PlanChange> {
        let phase = self
            .phases
            .iter_mut()
            .find(|phase| phase.id == id)
            .ok_or_else(|| CoreError::PhaseNotFound(id.to_string()))?;

        phase.state = new_state;
        if new_state == PhaseState::Running {
            phase.error = None;
        }
        if let Some(ref error) = error {
            phase.error = Some(error.clone());
        }

        let change = PlanChange {
            seq: self.changelog.last().map(|c| c.seq + 1).unwrap_or(1),
            phase_id: id.to_string(),
            new_state,
            created: Utc::now(),
            error: error.map(|e| e.message),
        };
        self.changelog.push(change.clone());
        Ok(change)
    }

    /// Sequence number of the latest change that moved `id` into one of
    /// `states`.
    pub fn last_change(&self, id: &str, states: &[PhaseState]) -> Option<u64> {
        self.changelog
            .iter()
            .rev()
            .find(|change| change.phase_id == id && states.contains(&change.new_state))
            .map(|change| change.seq)
    }

    pub fn is_finished(&self) -> bool {
        self.phases
            .iter()
            .all(|phase| phase.state == PhaseState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Plan {
        Plan::new("op-1", "example.com")
            .with_phase(Phase::new("/checks", "checks"))
            .with_phase(Phase::new("/system", "system").requires("/checks"))
            .with_phase(Phase::new("/start", "system").requires("/system"))
    }

    #[test]
    fn test_phase_state_parsing() {
        assert_eq!(PhaseState::parse("rolled_back"), Some(PhaseState::RolledBack));
        assert_eq!(PhaseState::parse("invalid"), None);
        assert_eq!(PhaseState::Running.as_str(), "running");
        assert_eq!(PhaseState::default(), PhaseState::Unstarted);
    }

    #[test]
    fn test_validate_ok() {
        chain().validate().unwrap();
    }

    #[test]
    fn test_validate_duplicate() {
        let plan = chain().with_phase(Phase::new("/checks", "checks"));
        assert!(matches!(
            plan.validate(),
            Err(CoreError::DuplicatePhase(id)) if id == "/checks"
        ));
    }

    #[test]
    fn test_validate_unknown_prerequisite() {
        let plan = chain().with_phase(Phase::new("/join", "agent").requires("/missing"));
        assert!(matches!(
            plan.validate(),
            Err(CoreError::UnknownPrerequisite { .. })
        ));
    }

    #[test]
    fn test_validate_cycle() {
        let plan = Plan::new("op", "c")
            .with_phase(Phase::new("/a", "checks").requires("/b"))
            .with_phase(Phase::new("/b", "checks").requires("/a"));
        assert!(matches!(
            plan.validate(),
            Err(CoreError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_runnable_respects_prerequisites() {
        let mut plan = chain();
        assert_eq!(plan.runnable(), vec!["/checks".to_string()]);

        plan.record_transition("/checks", PhaseState::Running, None)
            .unwrap();
        assert!(plan.runnable().is_empty());

        plan.record_transition("/checks", PhaseState::Completed, None)
            .unwrap();
        assert_eq!(plan.runnable(), vec!["/system".to_string()]);
    }

    #[test]
    fn test_closures() {
        let plan = chain();
        let prereqs = plan.prerequisites_of("/start");
        assert!(prereqs.contains("/system"));
        assert!(prereqs.contains("/checks"));
        assert!(!prereqs.contains("/start"));

        let dependents = plan.dependents_of("/checks");
        assert_eq!(dependents.len(), 2);
        assert!(plan.dependents_of("/start").is_empty());
    }

    #[test]
    fn test_record_transition_appends_changelog() {
        let mut plan = chain();
        let first = plan
            .record_transition("/checks", PhaseState::Running, None)
            .unwrap();
        let second = plan
            .record_transition(
                "/checks",
                PhaseState::Failed,
                Some(PhaseError::new(FailureKind::Precondition, "unreachable")),
            )
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.error.as_deref(), Some("unreachable"));
        assert_eq!(plan.state_of("/checks"), Some(PhaseState::Failed));
        assert_eq!(
            plan.phase("/checks").unwrap().error.as_ref().unwrap().kind,
            FailureKind::Precondition
        );
        assert_eq!(plan.last_change("/checks", &[PhaseState::Failed]), Some(2));
        assert!(plan.record_transition("/nope", PhaseState::Running, None).is_err());
    }

    #[test]
    fn test_plan_json_round_trip() {
        let plan = Plan::new("op-2", "cluster")
            .with_phase(
                Phase::new("/system/node-1", "system")
                    .with_server(Server::new("10.0.0.1", "node-1"))
                    .with_package(Locator::new("repo", "planet", "1.0.0"))
                    .with_label("role", "master"),
            );
        let json = plan.to_json().unwrap();
        assert!(json.contains("repo/planet:1.0.0"));

        let back = Plan::from_json(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_failure_kind_effect() {
        assert!(!FailureKind::Precondition.has_effect());
        assert!(FailureKind::Execution.has_effect());
        assert!(FailureKind::Protocol.has_effect());
    }
}
