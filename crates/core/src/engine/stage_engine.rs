//! The stage engine: every state change of a match goes through here.
//!
//! Each mutation of a stage happens while holding that stage's lease, after
//! re-reading the match. User actions that find the lease held fail with
//! [`EngineError::Busy`]; reconciliation passes report
//! [`ReconcileOutcome::Locked`] and move on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::lease::LeaseStore;
use crate::matches::{
    lease_key, CreateMatchRequest, FailureKind, Match, MatchStore, PlayerAssignment, SourceRef,
    StageFailure, StageName, StageStatus,
};
use crate::metrics;
use crate::notify::{NotificationEvent, NotificationSink};
use crate::stage::{
    apply_failure, apply_poll, apply_resubmission, apply_submission, consume_retry,
    read_time_correction, Correction, PolicyVerdict, PollEffect, PollOutcome, StagePolicies,
};
use crate::stage_client::{JobStatusPayload, StageClientError, SubmittedJob};

use super::error::EngineError;
use super::types::{AppliedCorrection, ReconcileOutcome, StageResult, StageServices, WebhookOutcome};

/// Drives matches through ingestion, detection and analysis.
pub struct StageEngine {
    matches: Arc<dyn MatchStore>,
    leases: Arc<dyn LeaseStore>,
    services: StageServices,
    policies: StagePolicies,
    notifier: Arc<dyn NotificationSink>,
    lease_ttl: Duration,
}

impl StageEngine {
    pub fn new(
        matches: Arc<dyn MatchStore>,
        leases: Arc<dyn LeaseStore>,
        services: StageServices,
        policies: StagePolicies,
        notifier: Arc<dyn NotificationSink>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            matches,
            leases,
            services,
            policies,
            notifier,
            lease_ttl,
        }
    }

    pub fn matches(&self) -> &Arc<dyn MatchStore> {
        &self.matches
    }

    pub fn leases(&self) -> &Arc<dyn LeaseStore> {
        &self.leases
    }

    pub fn services(&self) -> &StageServices {
        &self.services
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    // =========================================================================
    // User actions
    // =========================================================================

    /// Persist a new match and, if it names a source video, start ingestion.
    ///
    /// A failed ingestion submission does not fail creation: the stage stays
    /// `not_started` with the error recorded, and can be submitted again.
    pub async fn create_match(&self, request: CreateMatchRequest) -> Result<Match, EngineError> {
        if request.owner_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("owner_id is required".to_string()));
        }

        let created = self.matches.create(request)?;
        info!(
            "Created match {} for owner {}",
            created.id, created.owner_id
        );

        let Some(source) = created.ingestion.source.as_ref() else {
            return Ok(created);
        };
        debug!("Match {} has source {}", created.id, source.describe());

        match self.submit(&created.id, StageName::Ingestion).await {
            Ok(submitted) => Ok(submitted),
            Err(EngineError::Submission { source, .. }) => {
                warn!(
                    "Ingestion submission for new match {} failed: {}",
                    created.id, source
                );
                self.record_submission_error(&created.id, StageName::Ingestion, &source)
            }
            Err(e @ EngineError::ServiceUnavailable(_)) => {
                warn!("Match {} created without ingestion: {}", created.id, e);
                Ok(created)
            }
            Err(e) => Err(e),
        }
    }

    /// Attach a remote link to a match and start its ingestion.
    pub async fn submit_link(&self, match_id: &str, url: &str) -> Result<Match, EngineError> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EngineError::InvalidRequest(format!(
                "link must be an http(s) URL, got '{}'",
                url
            )));
        }

        self.with_user_lease(StageName::Ingestion, match_id, || async {
            let mut m = self.load(match_id)?;
            let status = m.ingestion.progress.status;
            if status != StageStatus::NotStarted {
                return Err(EngineError::InvalidState {
                    stage: StageName::Ingestion,
                    expected: StageStatus::NotStarted.to_string(),
                    actual: status,
                });
            }

            m.ingestion.source = Some(SourceRef::Link {
                url: url.to_string(),
            });
            let m = self.persist(StageName::Ingestion, &m)?;
            info!("Match {} ingests link {}", match_id, url);

            self.submit_locked(m, StageName::Ingestion).await
        })
        .await
    }

    /// Submit a stage whose inputs are ready.
    ///
    /// Fails with [`EngineError::MissingInput`] before any remote call when
    /// the previous stage has not produced what this one needs.
    pub async fn submit(&self, match_id: &str, stage: StageName) -> Result<Match, EngineError> {
        self.with_user_lease(stage, match_id, || async {
            let m = self.load(match_id)?;
            self.submit_locked(m, stage).await
        })
        .await
    }

    /// Store the user's player assignments and start analysis if possible.
    ///
    /// Before detection completes the stage waits as `pending` and the
    /// reconciler submits it later.
    pub async fn request_analysis(
        &self,
        match_id: &str,
        assignments: Vec<PlayerAssignment>,
    ) -> Result<Match, EngineError> {
        if assignments.is_empty() {
            return Err(EngineError::InvalidRequest(
                "at least one player assignment is required".to_string(),
            ));
        }
        if let Some(bad) = assignments
            .iter()
            .find(|a| a.player_id.trim().is_empty() || a.team.trim().is_empty())
        {
            return Err(EngineError::InvalidRequest(format!(
                "assignment for player '{}' needs a player id and a team",
                bad.player_id
            )));
        }

        let stage = StageName::Analysis;
        self.with_user_lease(stage, match_id, || async {
            let mut m = self.load(match_id)?;
            let status = m.analysis.progress.status;
            if !matches!(status, StageStatus::NotStarted | StageStatus::Pending) {
                return Err(EngineError::InvalidState {
                    stage,
                    expected: "not_started or pending".to_string(),
                    actual: status,
                });
            }

            m.analysis.assignments = Some(assignments);
            m.analysis.progress.status = StageStatus::Pending;
            let m = self.persist(stage, &m)?;

            if !m.stage_input_available(stage) {
                info!(
                    "Analysis of match {} is pending until detection completes",
                    match_id
                );
                metrics::STAGE_TRANSITIONS
                    .with_label_values(&[stage.as_str(), StageStatus::Pending.as_str()])
                    .inc();
                self.notify(
                    &m,
                    NotificationEvent::StagePending {
                        match_id: m.id.clone(),
                        stage,
                    },
                )
                .await;
                return Ok(m);
            }

            // Stays pending on failure, so the reconciler picks it up.
            self.submit_locked(m, stage).await
        })
        .await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Advance one stage of one match by a single step.
    pub async fn reconcile(
        &self,
        match_id: &str,
        stage: StageName,
    ) -> Result<ReconcileOutcome, EngineError> {
        if !self.try_lease(stage, match_id)? {
            return Ok(ReconcileOutcome::Locked);
        }

        let result = self.reconcile_locked(match_id, stage).await;
        self.release_lease(stage, match_id);
        result
    }

    async fn reconcile_locked(
        &self,
        match_id: &str,
        stage: StageName,
    ) -> Result<ReconcileOutcome, EngineError> {
        let m = self.load(match_id)?;
        let status = m.progress(stage).status;

        match (stage, status) {
            (_, StageStatus::Processing) => self.advance_processing(m, stage).await,
            (StageName::Detection, StageStatus::NotStarted)
            | (StageName::Analysis, StageStatus::Pending)
                if m.stage_input_available(stage) =>
            {
                let submitted = self.submit_locked(m, stage).await?;
                Ok(ReconcileOutcome::Submitted {
                    job_id: submitted.progress(stage).job_id.clone().unwrap_or_default(),
                })
            }
            _ => Ok(ReconcileOutcome::Idle),
        }
    }

    /// One policy step for a `processing` stage.
    async fn advance_processing(
        &self,
        mut m: Match,
        stage: StageName,
    ) -> Result<ReconcileOutcome, EngineError> {
        let now = Utc::now();
        let policy = self.policies.for_stage(stage);

        match policy.evaluate(m.progress(stage), now) {
            PolicyVerdict::Fail { kind, reason } => {
                self.fail_stage(m, stage, StageFailure::new(kind, reason, now))
                    .await?;
                Ok(ReconcileOutcome::Failed { kind })
            }
            PolicyVerdict::Resubmit => {
                *m.progress_mut(stage) = consume_retry(m.progress(stage));
                match self.submit_remote(&m, stage).await {
                    Ok(job) => {
                        *m.progress_mut(stage) = apply_resubmission(m.progress(stage), &job.job_id);
                        let m = self.persist(stage, &m)?;
                        info!(
                            "Resubmitted {} of match {} as job {}",
                            stage, m.id, job.job_id
                        );
                        self.notify(
                            &m,
                            NotificationEvent::StageStarted {
                                match_id: m.id.clone(),
                                stage,
                                job_id: job.job_id.clone(),
                            },
                        )
                        .await;
                        Ok(ReconcileOutcome::Resubmitted { job_id: job.job_id })
                    }
                    Err(e) => {
                        self.persist(stage, &m)?;
                        Err(e)
                    }
                }
            }
            PolicyVerdict::Poll => {
                *m.progress_mut(stage) = consume_retry(m.progress(stage));
                let job_id = m.progress(stage).job_id.clone().unwrap_or_default();

                let outcome = match self.poll_remote(stage, &job_id).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // The attempt still counts against the budget.
                        self.persist(stage, &m)?;
                        return Err(e);
                    }
                };
                debug!(
                    "Polled {} job {} of match {}: {}",
                    stage,
                    job_id,
                    m.id,
                    outcome.label()
                );
                self.apply_outcome(m, stage, outcome, now).await
            }
        }
    }

    /// Fold a remote outcome into the stage and persist it.
    async fn apply_outcome(
        &self,
        mut m: Match,
        stage: StageName,
        outcome: PollOutcome<StageResult>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let transition = apply_poll(m.progress(stage), outcome, now);
        *m.progress_mut(stage) = transition.progress;

        match transition.effect {
            PollEffect::Unchanged => {
                self.persist(stage, &m)?;
                Ok(ReconcileOutcome::StillProcessing)
            }
            PollEffect::Completed(result) => {
                result.store_on(&mut m);
                let m = self.persist(stage, &m)?;
                info!("{} of match {} completed", stage, m.id);
                metrics::STAGE_TRANSITIONS
                    .with_label_values(&[stage.as_str(), StageStatus::Completed.as_str()])
                    .inc();
                self.notify(
                    &m,
                    NotificationEvent::StageCompleted {
                        match_id: m.id.clone(),
                        stage,
                    },
                )
                .await;
                self.chain_after(&m, stage).await;
                Ok(ReconcileOutcome::Completed)
            }
            PollEffect::Failed(failure) => {
                let kind = failure.kind;
                self.persist(stage, &m)?;
                self.announce_failure(&m, stage, &failure).await;
                Ok(ReconcileOutcome::Failed { kind })
            }
        }
    }

    async fn fail_stage(
        &self,
        mut m: Match,
        stage: StageName,
        failure: StageFailure,
    ) -> Result<Match, EngineError> {
        *m.progress_mut(stage) = apply_failure(m.progress(stage), failure.clone());
        let m = self.persist(stage, &m)?;
        self.announce_failure(&m, stage, &failure).await;
        Ok(m)
    }

    async fn announce_failure(&self, m: &Match, stage: StageName, failure: &StageFailure) {
        warn!(
            "{} of match {} failed ({}): {}",
            stage,
            m.id,
            failure.kind.as_str(),
            failure.message
        );
        metrics::STAGE_TRANSITIONS
            .with_label_values(&[stage.as_str(), StageStatus::Failed.as_str()])
            .inc();
        metrics::STAGE_FAILURES
            .with_label_values(&[stage.as_str(), failure.kind.as_str()])
            .inc();
        self.notify(
            m,
            NotificationEvent::StageFailed {
                match_id: m.id.clone(),
                stage,
                kind: failure.kind,
                reason: failure.message.clone(),
            },
        )
        .await;
    }

    /// Submit whatever the completed stage unblocked.
    ///
    /// Chained submissions are best-effort: when they fail or the next lease
    /// is held, the next reconciliation pass submits instead.
    async fn chain_after(&self, m: &Match, completed: StageName) {
        let next = match completed {
            StageName::Ingestion => StageName::Detection,
            StageName::Detection if m.analysis.has_assignments() => StageName::Analysis,
            _ => return,
        };
        if !self.services.is_configured(next) {
            debug!("Not chaining {} of match {}: service not configured", next, m.id);
            return;
        }

        let acquired = match self.try_lease(next, &m.id) {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Could not take {} lease for match {}: {}", next, m.id, e);
                return;
            }
        };
        if !acquired {
            debug!("Not chaining {} of match {}: lease held", next, m.id);
            return;
        }

        let result = self.chain_locked(&m.id, next).await;
        self.release_lease(next, &m.id);

        match result {
            Ok(Some(_)) => {}
            Ok(None) => debug!("{} of match {} was not due", next, m.id),
            Err(e) => warn!("Chained {} submission for match {} failed: {}", next, m.id, e),
        }
    }

    async fn chain_locked(
        &self,
        match_id: &str,
        next: StageName,
    ) -> Result<Option<Match>, EngineError> {
        let m = self.load(match_id)?;
        let status = m.progress(next).status;
        let due = match next {
            StageName::Analysis => {
                matches!(status, StageStatus::NotStarted | StageStatus::Pending)
            }
            _ => status == StageStatus::NotStarted,
        };
        if !due || !m.stage_input_available(next) {
            return Ok(None);
        }
        self.submit_locked(m, next).await.map(Some)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Fold an ingestion status pushed by the service into its match.
    ///
    /// Safe to deliver more than once: a stage that is already terminal is
    /// left alone, so detection is submitted at most once.
    pub async fn handle_ingestion_webhook(
        &self,
        payload: JobStatusPayload,
    ) -> Result<WebhookOutcome, EngineError> {
        let job_id = payload
            .job_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| EngineError::InvalidRequest("webhook has no job id".to_string()))?;

        let Some(found) = self.matches.find_by_ingestion_job(&job_id)? else {
            warn!("Ingestion webhook for unknown job {}", job_id);
            return Ok(WebhookOutcome::UnknownJob { job_id });
        };
        let match_id = found.id;

        if !self.try_lease(StageName::Ingestion, &match_id)? {
            info!(
                "Deferring ingestion webhook for match {}: lease held",
                match_id
            );
            return Ok(WebhookOutcome::Deferred { match_id });
        }

        let result = self.apply_webhook_locked(&match_id, &job_id, payload).await;
        self.release_lease(StageName::Ingestion, &match_id);
        result
    }

    async fn apply_webhook_locked(
        &self,
        match_id: &str,
        job_id: &str,
        payload: JobStatusPayload,
    ) -> Result<WebhookOutcome, EngineError> {
        let m = self.load(match_id)?;
        let progress = &m.ingestion.progress;
        let match_id = m.id.clone();

        if progress.status.is_terminal() {
            debug!(
                "Ignoring duplicate ingestion webhook for match {} ({})",
                match_id, progress.status
            );
            return Ok(WebhookOutcome::Duplicate { match_id });
        }
        if progress.status != StageStatus::Processing || progress.job_id.as_deref() != Some(job_id) {
            debug!(
                "Ignoring stale ingestion webhook for match {} (job {})",
                match_id, job_id
            );
            return Ok(WebhookOutcome::Stale { match_id });
        }

        let outcome = payload
            .into_ingestion_outcome()
            .map(StageResult::VideoLocation);
        let status = match self
            .apply_outcome(m, StageName::Ingestion, outcome, Utc::now())
            .await?
        {
            ReconcileOutcome::Completed => StageStatus::Completed,
            ReconcileOutcome::Failed { .. } => StageStatus::Failed,
            _ => StageStatus::Processing,
        };
        Ok(WebhookOutcome::Applied { match_id, status })
    }

    // =========================================================================
    // Read-time correction
    // =========================================================================

    /// Load a match for display, repairing stages the loop gave up on.
    pub async fn visit(&self, match_id: &str) -> Result<Match, EngineError> {
        self.visit_with_corrections(match_id)
            .await
            .map(|(m, _)| m)
    }

    /// Like [`visit`](Self::visit), also reporting what was corrected.
    ///
    /// Runs without leases: it only touches stages no pass is advancing.
    pub async fn visit_with_corrections(
        &self,
        match_id: &str,
    ) -> Result<(Match, Vec<AppliedCorrection>), EngineError> {
        let mut m = self.load(match_id)?;
        let now = Utc::now();
        let mut applied = Vec::new();

        for stage in StageName::ALL {
            let policy = self.policies.for_stage(stage);
            let Some((next, correction)) = read_time_correction(
                m.progress(stage),
                policy,
                m.stage_input_available(stage),
                now,
            ) else {
                continue;
            };

            *m.progress_mut(stage) = next;
            m = self.persist(stage, &m)?;
            info!(
                "Corrected {} of match {}: {}",
                stage,
                m.id,
                correction.as_str()
            );
            metrics::STAGE_RESETS
                .with_label_values(&[stage.as_str(), correction.as_str()])
                .inc();

            if correction == Correction::FailedStageReset {
                self.notify(
                    &m,
                    NotificationEvent::StageReset {
                        match_id: m.id.clone(),
                        stage,
                    },
                )
                .await;
            }
            applied.push(AppliedCorrection { stage, correction });
        }

        Ok((m, applied))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Submit `stage` and mark it processing. Caller holds the stage lease.
    async fn submit_locked(&self, mut m: Match, stage: StageName) -> Result<Match, EngineError> {
        let status = m.progress(stage).status;
        let allowed = match stage {
            StageName::Analysis => {
                matches!(status, StageStatus::NotStarted | StageStatus::Pending)
            }
            _ => status == StageStatus::NotStarted,
        };
        if !allowed {
            let expected = match stage {
                StageName::Analysis => "not_started or pending".to_string(),
                _ => StageStatus::NotStarted.to_string(),
            };
            return Err(EngineError::InvalidState {
                stage,
                expected,
                actual: status,
            });
        }

        let job = self.submit_remote(&m, stage).await?;

        *m.progress_mut(stage) = apply_submission(&job.job_id, Utc::now());
        let m = self.persist(stage, &m)?;
        info!("Submitted {} of match {} as job {}", stage, m.id, job.job_id);
        metrics::STAGE_TRANSITIONS
            .with_label_values(&[stage.as_str(), StageStatus::Processing.as_str()])
            .inc();
        self.notify(
            &m,
            NotificationEvent::StageStarted {
                match_id: m.id.clone(),
                stage,
                job_id: job.job_id,
            },
        )
        .await;
        Ok(m)
    }

    /// Check the stage's inputs, then hand it to its service.
    async fn submit_remote(&self, m: &Match, stage: StageName) -> Result<SubmittedJob, EngineError> {
        let submission_failed = |source| EngineError::Submission { stage, source };
        let missing = |reason: String| EngineError::MissingInput { stage, reason };

        match stage {
            StageName::Ingestion => {
                let source = m
                    .ingestion
                    .source
                    .as_ref()
                    .ok_or_else(|| missing("no source video".to_string()))?;
                let client = self
                    .services
                    .ingestion
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client
                    .submit(&m.id, source)
                    .await
                    .map_err(submission_failed)
            }
            StageName::Detection => {
                let location = m.video_location().ok_or_else(|| {
                    missing(format!(
                        "ingestion is {} without a video location",
                        m.ingestion.progress.status
                    ))
                })?;
                let client = self
                    .services
                    .detection
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client
                    .submit(&m.id, location)
                    .await
                    .map_err(submission_failed)
            }
            StageName::Analysis => {
                if m.detection.progress.status != StageStatus::Completed {
                    return Err(missing(format!(
                        "player detection is {}",
                        m.detection.progress.status
                    )));
                }
                let location = m
                    .video_location()
                    .ok_or_else(|| missing("no video location".to_string()))?;
                let assignments = m
                    .analysis
                    .assignments
                    .as_deref()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| missing("no player assignments".to_string()))?;
                let client = self
                    .services
                    .analysis
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client
                    .submit(&m.id, location, assignments)
                    .await
                    .map_err(submission_failed)
            }
        }
    }

    /// Poll the stage's remote job. Not-found is an outcome, not an error.
    async fn poll_remote(
        &self,
        stage: StageName,
        job_id: &str,
    ) -> Result<PollOutcome<StageResult>, EngineError> {
        let polled = match stage {
            StageName::Ingestion => {
                let client = self
                    .services
                    .ingestion
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client
                    .poll(job_id)
                    .await
                    .map(|o| o.map(StageResult::VideoLocation))
            }
            StageName::Detection => {
                let client = self
                    .services
                    .detection
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client.poll(job_id).await.map(|o| o.map(StageResult::Players))
            }
            StageName::Analysis => {
                let client = self
                    .services
                    .analysis
                    .as_ref()
                    .ok_or(EngineError::ServiceUnavailable(stage))?;
                client.poll(job_id).await.map(|o| o.map(StageResult::Artifact))
            }
        };

        match polled {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_not_found() => Ok(PollOutcome::NotFound),
            Err(source) => Err(EngineError::Poll { stage, source }),
        }
    }

    /// Keep a not-started stage as is, with the submission error recorded.
    fn record_submission_error(
        &self,
        match_id: &str,
        stage: StageName,
        error: &StageClientError,
    ) -> Result<Match, EngineError> {
        let mut m = self.load(match_id)?;
        let kind = match error {
            StageClientError::Rejected(_) => FailureKind::Rejected,
            _ => FailureKind::Remote,
        };
        m.progress_mut(stage).last_error =
            Some(StageFailure::new(kind, error.to_string(), Utc::now()));
        self.persist(stage, &m)
    }

    /// Write one stage of `m` back, leaving the other stages untouched.
    fn persist(&self, stage: StageName, m: &Match) -> Result<Match, EngineError> {
        let updated = match stage {
            StageName::Ingestion => self.matches.update_ingestion(&m.id, &m.ingestion)?,
            StageName::Detection => self.matches.update_detection(&m.id, &m.detection)?,
            StageName::Analysis => self.matches.update_analysis(&m.id, &m.analysis)?,
        };
        Ok(updated)
    }

    fn load(&self, match_id: &str) -> Result<Match, EngineError> {
        self.matches
            .get(match_id)?
            .ok_or_else(|| EngineError::MatchNotFound(match_id.to_string()))
    }

    async fn notify(&self, m: &Match, event: NotificationEvent) {
        self.notifier.emit(&m.owner_id, event).await;
    }

    fn try_lease(&self, stage: StageName, match_id: &str) -> Result<bool, EngineError> {
        let key = lease_key(stage, match_id);
        let acquired = self.leases.acquire(&key, self.lease_ttl)?;
        if !acquired {
            metrics::LEASE_CONTENDED
                .with_label_values(&[stage.as_str()])
                .inc();
            debug!("Lease {} is held elsewhere", key);
        }
        Ok(acquired)
    }

    fn release_lease(&self, stage: StageName, match_id: &str) {
        let key = lease_key(stage, match_id);
        if let Err(e) = self.leases.release(&key) {
            // Expires on its own after the TTL.
            warn!("Failed to release lease {}: {}", key, e);
        }
    }

    /// Run a user action under the stage lease, failing fast when it is held.
    async fn with_user_lease<F, Fut>(
        &self,
        stage: StageName,
        match_id: &str,
        action: F,
    ) -> Result<Match, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Match, EngineError>>,
    {
        if !self.try_lease(stage, match_id)? {
            return Err(EngineError::Busy {
                stage,
                match_id: match_id.to_string(),
            });
        }

        let result = action().await;
        self.release_lease(stage, match_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::{DetectedPlayer, MatchStore};
    use crate::stage::RetryPolicy;
    use crate::testing::fixtures::{assignments, link_source, players, upload_source};
    use crate::testing::EngineHarness;

    fn harness() -> EngineHarness {
        EngineHarness::new().unwrap()
    }

    fn upload_request(owner: &str) -> CreateMatchRequest {
        CreateMatchRequest {
            owner_id: owner.to_string(),
            source: Some(upload_source("uploads/m.mp4")),
        }
    }

    #[tokio::test]
    async fn test_create_with_upload_submits_ingestion() {
        let h = harness();

        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        assert_eq!(m.ingestion.progress.status, StageStatus::Processing);
        assert_eq!(
            m.ingestion.progress.job_id.as_deref(),
            Some("ingestion-job-1")
        );
        assert_eq!(m.ingestion.progress.retry_count, 0);
        assert!(m.ingestion.progress.started_at.is_some());
        assert_eq!(h.ingestion.submission_count().await, 1);
        assert_eq!(
            h.notifications.event_types().await,
            vec!["ingestion_started"]
        );
        assert!(h
            .leases
            .get(&lease_key(StageName::Ingestion, &m.id))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_without_source_waits_for_link() {
        let h = harness();

        let m = h
            .engine
            .create_match(CreateMatchRequest {
                owner_id: "owner-1".to_string(),
                source: None,
            })
            .await
            .unwrap();

        assert_eq!(m.ingestion.progress.status, StageStatus::NotStarted);
        assert_eq!(h.ingestion.submission_count().await, 0);

        let m = h
            .engine
            .submit_link(&m.id, "https://videos.example.com/final.mp4")
            .await
            .unwrap();
        assert_eq!(m.ingestion.progress.status, StageStatus::Processing);
        assert_eq!(
            h.ingestion.submissions().await[0].input,
            link_source("https://videos.example.com/final.mp4")
        );
    }

    #[tokio::test]
    async fn test_create_keeps_match_when_submission_fails() {
        let h = harness();
        h.ingestion
            .set_next_submit_error(StageClientError::ConnectionFailed("refused".into()))
            .await;

        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        assert_eq!(m.ingestion.progress.status, StageStatus::NotStarted);
        let error = m.ingestion.progress.last_error.unwrap();
        assert_eq!(error.kind, FailureKind::Remote);
        assert!(h.notifications.event_types().await.is_empty());

        // A later explicit submission goes through.
        let m = h.engine.submit(&m.id, StageName::Ingestion).await.unwrap();
        assert_eq!(m.ingestion.progress.status, StageStatus::Processing);
        assert!(m.ingestion.progress.last_error.is_none());
    }

    #[tokio::test]
    async fn test_submit_link_rejects_started_ingestion() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        let err = h
            .engine
            .submit_link(&m.id, "https://videos.example.com/other.mp4")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::InvalidState {
                actual: StageStatus::Processing,
                ..
            }
        ));
        assert_eq!(h.ingestion.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_submit_link_requires_http_url() {
        let h = harness();
        let err = h.engine.submit_link("m-1", "ftp://x/y.mp4").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_detection_submit_requires_completed_ingestion() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        let err = h
            .engine
            .submit(&m.id, StageName::Detection)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::MissingInput {
                stage: StageName::Detection,
                ..
            }
        ));
        assert!(err.is_client_error());
        assert_eq!(h.detection.submission_count().await, 0);
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.detection.progress.status, StageStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_submit_fails_fast_when_lease_held() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        h.leases
            .acquire(&lease_key(StageName::Detection, &m.id), Duration::from_secs(60))
            .unwrap();

        let err = h
            .engine
            .submit(&m.id, StageName::Detection)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Busy { .. }));
        assert_eq!(h.detection.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_submission_error_leaves_stage_unchanged() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        h.detection
            .set_next_submit_error(StageClientError::ApiError {
                status: 503,
                message: "busy".into(),
            })
            .await;

        let err = h
            .engine
            .submit(&m.id, StageName::Detection)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Submission { .. }));
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.detection.progress.status, StageStatus::NotStarted);
        assert!(stored.detection.progress.job_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_service_is_unavailable() {
        let h = EngineHarness::builder().without(StageName::Detection).build().unwrap();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();

        let err = h
            .engine
            .submit(&m.id, StageName::Detection)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ServiceUnavailable(StageName::Detection)
        ));
    }

    #[tokio::test]
    async fn test_request_analysis_before_detection_is_pending() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();

        let m = h
            .engine
            .request_analysis(&m.id, assignments(&["p1", "p2"]))
            .await
            .unwrap();

        assert_eq!(m.analysis.progress.status, StageStatus::Pending);
        assert_eq!(m.analysis.assignments.as_ref().unwrap().len(), 2);
        assert_eq!(h.analysis.submission_count().await, 0);
        assert_eq!(h.notifications.event_types().await, vec!["analysis_pending"]);
    }

    #[tokio::test]
    async fn test_request_analysis_after_detection_submits() {
        let h = harness();
        let m = h.detected_match("owner-1", players(3)).unwrap();

        let m = h
            .engine
            .request_analysis(&m.id, assignments(&["p1"]))
            .await
            .unwrap();

        assert_eq!(m.analysis.progress.status, StageStatus::Processing);
        let submitted = h.analysis.submissions().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].input.assignments[0].player_id, "p1");
    }

    #[tokio::test]
    async fn test_request_analysis_rejects_empty_assignments() {
        let h = harness();
        let m = h.detected_match("owner-1", players(1)).unwrap();

        let err = h.engine.request_analysis(&m.id, vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_request_analysis_twice_is_invalid() {
        let h = harness();
        let m = h.detected_match("owner-1", players(1)).unwrap();
        h.engine
            .request_analysis(&m.id, assignments(&["p1"]))
            .await
            .unwrap();

        let err = h
            .engine
            .request_analysis(&m.id, assignments(&["p1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(h.analysis.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_submits_detection_exactly_once() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();

        let first = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();
        let second = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();

        assert_eq!(
            first,
            ReconcileOutcome::Submitted {
                job_id: "detection-job-1".to_string()
            }
        );
        assert_eq!(second, ReconcileOutcome::StillProcessing);
        assert_eq!(h.detection.submission_count().await, 1);
        assert_eq!(h.notifications.count("detection_started").await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_locked_does_nothing() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        h.leases
            .acquire(&lease_key(StageName::Detection, &m.id), Duration::from_secs(60))
            .unwrap();

        let outcome = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Locked);
        assert_eq!(h.detection.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_poll_consumes_retry() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();
        h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.retry_count, 2);
        assert_eq!(stored.ingestion.progress.status, StageStatus::Processing);
    }

    #[tokio::test]
    async fn test_transient_poll_error_keeps_consumed_retry() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        h.ingestion
            .set_next_poll_error(StageClientError::Timeout)
            .await;

        let err = h
            .engine
            .reconcile(&m.id, StageName::Ingestion)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Poll { .. }));
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.retry_count, 1);
        assert_eq!(stored.ingestion.progress.status, StageStatus::Processing);
        // The lease was released despite the error.
        assert!(h
            .leases
            .get(&lease_key(StageName::Ingestion, &m.id))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ingestion_completion_chains_detection() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        h.ingestion
            .set_poll_outcome(
                "ingestion-job-1",
                PollOutcome::Completed("s3://videos/resolved.mp4".to_string()),
            )
            .await;

        let outcome = h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.status, StageStatus::Completed);
        assert_eq!(stored.ingestion.progress.retry_count, 0);
        assert_eq!(
            stored.ingestion.video_location.as_deref(),
            Some("s3://videos/resolved.mp4")
        );
        assert_eq!(stored.detection.progress.status, StageStatus::Processing);
        assert_eq!(
            h.detection.submissions().await[0].input,
            "s3://videos/resolved.mp4"
        );
        assert_eq!(
            h.notifications.event_types().await,
            vec!["ingestion_started", "ingestion_completed", "detection_started"]
        );
    }

    #[tokio::test]
    async fn test_completion_without_location_fails() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        h.ingestion
            .set_default_outcome(PollOutcome::Completed(String::new()))
            .await;

        let outcome = h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::MissingOutput
            }
        );
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.detection.progress.status, StageStatus::NotStarted);
        assert_eq!(h.detection.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_detection_completion_chains_analysis_with_assignments() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();
        h.engine
            .request_analysis(&m.id, assignments(&["p1"]))
            .await
            .unwrap();
        h.detection
            .set_poll_outcome("detection-job-1", PollOutcome::Completed(players(2)))
            .await;

        let outcome = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.detection.players.len(), 2);
        assert_eq!(stored.analysis.progress.status, StageStatus::Processing);
        assert_eq!(h.analysis.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_detection_result_completes() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();
        h.detection
            .set_default_outcome(PollOutcome::Completed(Vec::<DetectedPlayer>::new()))
            .await;

        let outcome = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(h.analysis.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_not_found_fails_stage() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        h.ingestion
            .set_next_poll_error(StageClientError::NotFound("ingestion-job-1".into()))
            .await;

        let outcome = h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::NotFound
            }
        );
        assert_eq!(h.notifications.count("ingestion_failed").await, 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_without_polling() {
        let h = EngineHarness::builder()
            .policies(StagePolicies {
                ingestion: RetryPolicy::new(Duration::from_secs(3600), 100),
                ..StagePolicies::default()
            })
            .build()
            .unwrap();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        let mut stale = h.matches.get(&m.id).unwrap().unwrap();
        stale.ingestion.progress.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        h.matches.update_ingestion(&m.id, &stale.ingestion).unwrap();

        let outcome = h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::TimedOut
            }
        );
        assert!(h.ingestion.polled_jobs().await.is_empty());
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.status, StageStatus::Failed);
        assert_eq!(
            stored.ingestion.progress.last_error.unwrap().kind,
            FailureKind::TimedOut
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let h = EngineHarness::builder()
            .policies(StagePolicies {
                ingestion: RetryPolicy::new(Duration::from_secs(3600), 2),
                ..StagePolicies::default()
            })
            .build()
            .unwrap();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();

        h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();
        h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();
        let outcome = h.engine.reconcile(&m.id, StageName::Ingestion).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                kind: FailureKind::RetriesExhausted
            }
        );
        assert_eq!(h.ingestion.polled_jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_processing_without_job_is_resubmitted() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        let mut broken = h.matches.get(&m.id).unwrap().unwrap();
        broken.detection.progress.status = StageStatus::Processing;
        broken.detection.progress.started_at = Some(Utc::now());
        h.matches.update_detection(&m.id, &broken.detection).unwrap();

        let outcome = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Resubmitted {
                job_id: "detection-job-1".to_string()
            }
        );
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.detection.progress.retry_count, 1);
        assert_eq!(
            stored.detection.progress.job_id.as_deref(),
            Some("detection-job-1")
        );
    }

    #[tokio::test]
    async fn test_webhook_completion_is_idempotent() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        let payload: JobStatusPayload = serde_json::from_value(serde_json::json!({
            "job_id": "ingestion-job-1",
            "status": "completed",
            "video_url": "s3://videos/resolved.mp4",
        }))
        .unwrap();

        let first = h
            .engine
            .handle_ingestion_webhook(payload.clone())
            .await
            .unwrap();
        let second = h.engine.handle_ingestion_webhook(payload).await.unwrap();

        assert_eq!(
            first,
            WebhookOutcome::Applied {
                match_id: m.id.clone(),
                status: StageStatus::Completed
            }
        );
        assert_eq!(second, WebhookOutcome::Duplicate { match_id: m.id.clone() });
        assert_eq!(h.detection.submission_count().await, 1);
        assert_eq!(h.notifications.count("detection_started").await, 1);

        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.retry_count, 0);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_job() {
        let h = harness();
        let payload: JobStatusPayload =
            serde_json::from_value(serde_json::json!({"job_id": "nope", "status": "completed"}))
                .unwrap();

        let outcome = h.engine.handle_ingestion_webhook(payload).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::UnknownJob {
                job_id: "nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_webhook_without_job_id_is_invalid() {
        let h = harness();
        let payload: JobStatusPayload =
            serde_json::from_value(serde_json::json!({"status": "completed"})).unwrap();

        let err = h.engine.handle_ingestion_webhook(payload).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_webhook_deferred_while_lease_held() {
        let h = harness();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        h.leases
            .acquire(&lease_key(StageName::Ingestion, &m.id), Duration::from_secs(60))
            .unwrap();
        let payload: JobStatusPayload = serde_json::from_value(serde_json::json!({
            "job_id": "ingestion-job-1",
            "status": "completed",
            "location": "s3://videos/resolved.mp4",
        }))
        .unwrap();

        let outcome = h.engine.handle_ingestion_webhook(payload).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Deferred { match_id: m.id.clone() });
        let stored = h.matches.get(&m.id).unwrap().unwrap();
        assert_eq!(stored.ingestion.progress.status, StageStatus::Processing);
    }

    #[tokio::test]
    async fn test_visit_resets_failed_stage() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        let mut failed = h.matches.get(&m.id).unwrap().unwrap();
        failed.detection.progress.status = StageStatus::Failed;
        failed.detection.progress.job_id = Some("old-job".to_string());
        failed.detection.progress.retry_count = 120;
        failed.detection.progress.last_error = Some(StageFailure::new(
            FailureKind::RetriesExhausted,
            "gave up",
            Utc::now(),
        ));
        h.matches.update_detection(&m.id, &failed.detection).unwrap();

        let (visited, corrections) = h.engine.visit_with_corrections(&m.id).await.unwrap();

        assert_eq!(
            corrections,
            vec![AppliedCorrection {
                stage: StageName::Detection,
                correction: Correction::FailedStageReset
            }]
        );
        let progress = &visited.detection.progress;
        assert_eq!(progress.status, StageStatus::Processing);
        assert_eq!(progress.retry_count, 0);
        assert!(progress.job_id.is_none());
        assert!(progress.last_error.is_none());
        assert_eq!(h.notifications.event_types().await, vec!["detection_reset"]);

        // The next pass submits a fresh job.
        let outcome = h.engine.reconcile(&m.id, StageName::Detection).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Resubmitted { .. }));
    }

    #[tokio::test]
    async fn test_visit_keeps_rejected_stage_failed() {
        let h = harness();
        let m = h.ingested_match("owner-1", "s3://videos/m.mp4").unwrap();
        let mut failed = h.matches.get(&m.id).unwrap().unwrap();
        failed.detection.progress.status = StageStatus::Failed;
        failed.detection.progress.last_error = Some(StageFailure::new(
            FailureKind::Rejected,
            "unsupported codec",
            Utc::now(),
        ));
        h.matches.update_detection(&m.id, &failed.detection).unwrap();

        let visited = h.engine.visit(&m.id).await.unwrap();

        assert_eq!(visited.detection.progress.status, StageStatus::Failed);
        assert!(h.notifications.event_types().await.is_empty());
    }

    #[tokio::test]
    async fn test_visit_restores_exhausted_budget() {
        let h = EngineHarness::builder()
            .policies(StagePolicies {
                ingestion: RetryPolicy::new(Duration::from_secs(3600), 3),
                ..StagePolicies::default()
            })
            .build()
            .unwrap();
        let m = h.engine.create_match(upload_request("owner-1")).await.unwrap();
        let mut stuck = h.matches.get(&m.id).unwrap().unwrap();
        stuck.ingestion.progress.retry_count = 3;
        h.matches.update_ingestion(&m.id, &stuck.ingestion).unwrap();

        let visited = h.engine.visit(&m.id).await.unwrap();

        assert_eq!(visited.ingestion.progress.status, StageStatus::Processing);
        assert_eq!(visited.ingestion.progress.retry_count, 0);
        assert_eq!(
            visited.ingestion.progress.job_id.as_deref(),
            Some("ingestion-job-1")
        );
    }
}
