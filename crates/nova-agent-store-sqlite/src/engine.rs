//! Suggestion engine: turns detector and extractor proposals into stored
//! suggestions under the workspace autonomy policy.

use anyhow::{anyhow, Context, Result};
use nova_agent_core::{
    now_utc, AuditRecord, AutonomyConfig, AutonomyMode, Detector, Disposition, Meeting,
    NewMeeting, NewSuggestion, OperationFailure, Proposal, Suggestion, SuggestionId, SuggestionKind, Workspace,
    WorkspaceId,
};
use nova_agent_extract::{
    auto_map_transcript, DependencyEdge, Extractor, FallbackReason, MappedTask, TaskCandidate,
};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use time::OffsetDateTime;

use crate::suggestions::{insert_suggestion, pending_for_target};
use crate::{list_tasks, list_users, load_workspace, SqliteAgentStore};

/// What happened to one proposal.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Suppressed {
        kind: SuggestionKind,
        reason_code: String,
    },
    Duplicate {
        kind: SuggestionKind,
        existing: SuggestionId,
    },
    Pending {
        suggestion: Suggestion,
        reason_code: String,
    },
    AutoApplied {
        suggestion: Suggestion,
        audit: AuditRecord,
    },
    /// Stored, but the autonomous apply was refused; the suggestion stays
    /// pending.
    AutoApplyFailed {
        suggestion_id: SuggestionId,
        failure: OperationFailure,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProposalCounts {
    pub pending: usize,
    pub auto_applied: usize,
    pub duplicates: usize,
    pub suppressed: usize,
    pub auto_apply_failed: usize,
}

impl ProposalCounts {
    fn record(&mut self, outcome: &ProposalOutcome) {
        match outcome {
            ProposalOutcome::Suppressed { .. } => self.suppressed += 1,
            ProposalOutcome::Duplicate { .. } => self.duplicates += 1,
            ProposalOutcome::Pending { .. } => self.pending += 1,
            ProposalOutcome::AutoApplied { .. } => self.auto_applied += 1,
            ProposalOutcome::AutoApplyFailed { .. } => self.auto_apply_failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DetectorSummary {
    pub detector: Detector,
    pub proposals: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanReport {
    pub workspace_id: WorkspaceId,
    pub mode: AutonomyMode,
    pub scanned_tasks: usize,
    pub counts: ProposalCounts,
    pub detectors: Vec<DetectorSummary>,
    pub outcomes: Vec<ProposalOutcome>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeetingReport {
    pub meeting: Meeting,
    pub summary: String,
    /// `parsed` or `fallback`.
    pub extraction: &'static str,
    pub fallback_reason: Option<FallbackReason>,
    pub candidates: Vec<TaskCandidate>,
    pub dependencies: Vec<DependencyEdge>,
    pub counts: ProposalCounts,
    pub outcomes: Vec<ProposalOutcome>,
    /// Candidates dropped because they did not form a valid suggestion.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AutoMapReport {
    pub workspace_id: WorkspaceId,
    pub mapped: Vec<MappedTask>,
    pub counts: ProposalCounts,
    pub outcomes: Vec<ProposalOutcome>,
    pub skipped: usize,
}

impl SqliteAgentStore {
    /// Routes a single proposal through the workspace's autonomy policy.
    pub fn propose(
        &mut self,
        workspace_id: WorkspaceId,
        proposal: Proposal,
    ) -> Result<ProposalOutcome> {
        let workspace = self.require_workspace(workspace_id)?;
        self.propose_with(&workspace.autonomy, workspace_id, proposal)
    }

    /// Runs every detector over the workspace's tasks as of `now`.
    pub fn scan(&mut self, workspace_id: WorkspaceId, now: OffsetDateTime) -> Result<ScanReport> {
        let workspace = self.require_workspace(workspace_id)?;
        let tasks = list_tasks(&self.conn, workspace_id)?;
        let mut report = ScanReport {
            workspace_id,
            mode: workspace.autonomy.mode,
            scanned_tasks: tasks.len(),
            counts: ProposalCounts::default(),
            detectors: Vec::new(),
            outcomes: Vec::new(),
        };

        if !workspace.autonomy.generates_suggestions() {
            tracing::info!(workspace_id = %workspace_id, "autonomy off; scan skipped");
            return Ok(report);
        }

        for detector in Detector::ALL {
            let proposals = detector.detect(&tasks, now);
            report.detectors.push(DetectorSummary {
                detector,
                proposals: proposals.len(),
            });
            for proposal in proposals {
                let outcome = self.propose_with(&workspace.autonomy, workspace_id, proposal)?;
                report.counts.record(&outcome);
                report.outcomes.push(outcome);
            }
        }

        tracing::info!(
            workspace_id = %workspace_id,
            scanned_tasks = report.scanned_tasks,
            pending = report.counts.pending,
            auto_applied = report.counts.auto_applied,
            duplicates = report.counts.duplicates,
            "scan complete"
        );
        Ok(report)
    }

    /// Stores the meeting, extracts task candidates and proposes one
    /// `create_task` per candidate.
    pub fn ingest_meeting(
        &mut self,
        extractor: &Extractor,
        input: &NewMeeting,
    ) -> Result<MeetingReport> {
        let workspace = self.require_workspace(input.workspace_id)?;
        let meeting = self.insert_meeting(input)?;

        let summary = extractor.summarize(&meeting.transcript);
        let extraction = extractor.extract_tasks(&meeting.transcript);
        let dependencies = extractor
            .detect_dependencies(&meeting.transcript)
            .into_payload()
            .dependencies;

        let label = if extraction.is_fallback() {
            "fallback"
        } else {
            "parsed"
        };
        let fallback_reason = extraction.fallback_reason().cloned();
        let candidates = extraction.into_payload();

        let mut counts = ProposalCounts::default();
        let mut outcomes = Vec::with_capacity(candidates.len());
        let mut skipped = 0;
        for candidate in &candidates {
            let Some(proposal) =
                usable_proposal(workspace.workspace_id, candidate.clone().into_proposal())
            else {
                skipped += 1;
                continue;
            };
            let outcome =
                self.propose_with(&workspace.autonomy, workspace.workspace_id, proposal)?;
            counts.record(&outcome);
            outcomes.push(outcome);
        }

        tracing::info!(
            meeting_id = %meeting.meeting_id,
            extraction = label,
            candidates = candidates.len(),
            skipped,
            "meeting processed"
        );
        Ok(MeetingReport {
            meeting,
            summary,
            extraction: label,
            fallback_reason,
            candidates,
            dependencies,
            counts,
            outcomes,
            skipped,
        })
    }

    /// Proposes `auto_mapped_task` suggestions from the rule-based mapper.
    pub fn auto_map_meeting(
        &mut self,
        workspace_id: WorkspaceId,
        transcript: &str,
        now: OffsetDateTime,
    ) -> Result<AutoMapReport> {
        let workspace = self.require_workspace(workspace_id)?;
        let users = list_users(&self.conn)?;
        let mapped = auto_map_transcript(transcript, &users, now);

        let mut counts = ProposalCounts::default();
        let mut outcomes = Vec::with_capacity(mapped.len());
        let mut skipped = 0;
        for task in &mapped {
            let Some(proposal) = usable_proposal(workspace_id, task.clone().into_proposal()) else {
                skipped += 1;
                continue;
            };
            let outcome = self.propose_with(&workspace.autonomy, workspace_id, proposal)?;
            counts.record(&outcome);
            outcomes.push(outcome);
        }

        Ok(AutoMapReport {
            workspace_id,
            mapped,
            counts,
            outcomes,
            skipped,
        })
    }

    fn require_workspace(&self, workspace_id: WorkspaceId) -> Result<Workspace> {
        load_workspace(&self.conn, workspace_id)?
            .ok_or_else(|| anyhow!("workspace {workspace_id} not found"))
    }

    fn propose_with(
        &mut self,
        config: &AutonomyConfig,
        workspace_id: WorkspaceId,
        proposal: Proposal,
    ) -> Result<ProposalOutcome> {
        let kind = proposal.payload.kind();
        let decision = config.decide(kind, proposal.confidence);
        if decision.disposition == Disposition::Suppressed {
            return Ok(ProposalOutcome::Suppressed {
                kind,
                reason_code: decision.reason_code,
            });
        }

        let input = proposal.into_new_suggestion(workspace_id);
        input
            .validate()
            .map_err(|err| anyhow!("invalid {} proposal: {err}", kind.as_str()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start propose transaction")?;
        if let Some(task_id) = input.payload.target_task() {
            if let Some(existing) = pending_for_target(&tx, workspace_id, kind, task_id)? {
                tracing::debug!(
                    kind = kind.as_str(),
                    task_id = %task_id,
                    existing = %existing,
                    "pending suggestion already targets task"
                );
                return Ok(ProposalOutcome::Duplicate { kind, existing });
            }
        }
        let mut suggestion = insert_suggestion(&tx, &input, now_utc())?;
        tx.commit().context("failed to commit propose transaction")?;

        if decision.disposition == Disposition::Pending {
            return Ok(ProposalOutcome::Pending {
                suggestion,
                reason_code: decision.reason_code,
            });
        }

        tracing::info!(
            suggestion_id = %suggestion.suggestion_id,
            kind = kind.as_str(),
            confidence = suggestion.confidence,
            reason_code = decision.reason_code.as_str(),
            "auto-applying suggestion"
        );
        match self.apply_suggestion(suggestion.suggestion_id, None)? {
            Ok(audit) => {
                suggestion.applied = true;
                Ok(ProposalOutcome::AutoApplied { suggestion, audit })
            }
            Err(failure) => {
                tracing::warn!(
                    suggestion_id = %suggestion.suggestion_id,
                    code = failure.code(),
                    "auto-apply refused; suggestion left pending"
                );
                Ok(ProposalOutcome::AutoApplyFailed {
                    suggestion_id: suggestion.suggestion_id,
                    failure,
                })
            }
        }
    }
}

/// Extracted proposals come from untrusted text; one that fails validation
/// is dropped so the rest of the batch still lands.
fn usable_proposal(workspace_id: WorkspaceId, proposal: Proposal) -> Option<Proposal> {
    let input = NewSuggestion::new(workspace_id, proposal.payload.clone(), proposal.confidence);
    match input.validate() {
        Ok(()) => Some(proposal),
        Err(err) => {
            tracing::warn!(
                workspace_id = %workspace_id,
                kind = proposal.payload.kind().as_str(),
                error = %err,
                "skipping invalid extracted proposal"
            );
            None
        }
    }
}
