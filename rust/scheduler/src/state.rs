//! Shared scheduling state for the control server.

use tokio::sync::Mutex;

use arbiter_core::{CompletionPolicy, ControlMessage, SchedulerConfig};

use crate::arbitration::{ArbitrationEngine, Grant, JobSession, Outbox};

/// Every session and the active-sender slot, behind a single lock.
///
/// Each public method is one dispatch step: it takes the lock once, mutates,
/// re-runs arbitration and returns. Grants are queued on outboxes, so no
/// socket I/O ever happens while the lock is held.
pub struct SchedulerState {
    engine: Mutex<ArbitrationEngine>,
    beta: f64,
    completion_policy: CompletionPolicy,
    evict_on_disconnect: bool,
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            engine: Mutex::new(ArbitrationEngine::new()),
            beta: config.beta,
            completion_policy: config.completion_policy,
            evict_on_disconnect: config.evict_on_disconnect,
        }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        self.completion_policy
    }

    /// Apply one decoded control message received on the connection that
    /// owns `outbox`.
    pub async fn dispatch(&self, message: ControlMessage, outbox: &Outbox) -> Option<Grant> {
        match message {
            ControlMessage::SendRequest {
                job_id,
                compute_time,
                payload_size,
            } => {
                self.request_send(&job_id, compute_time, payload_size, outbox.clone())
                    .await
            }
            ControlMessage::Completion { job_id, comm_time } => {
                self.complete_send(&job_id, comm_time).await
            }
            other => {
                match other.job_id() {
                    Some(job_id) => self.observe(job_id).await,
                    None => tracing::debug!("Ignoring control record without a job id"),
                }
                None
            }
        }
    }

    /// Record a send request and arbitrate.
    pub async fn request_send(
        &self,
        job_id: &str,
        compute_time: f64,
        payload_size: u64,
        outbox: Outbox,
    ) -> Option<Grant> {
        let mut engine = self.engine.lock().await;

        let session = engine.session_entry(job_id);
        session.attach(outbox);
        session.record_send_request(compute_time, payload_size, self.beta);
        tracing::debug!(
            "Job {} requests link: compute {:.4}s, payload {} bytes, priority {:.4}",
            job_id,
            compute_time,
            payload_size,
            session.priority
        );

        arbitrate(&mut engine)
    }

    /// Record a completion, free the slot per the completion policy, and
    /// arbitrate.
    pub async fn complete_send(&self, job_id: &str, comm_time: f64) -> Option<Grant> {
        let mut engine = self.engine.lock().await;

        let session = engine.session_entry(job_id);
        session.record_completion(comm_time);
        tracing::debug!(
            "Job {} finished round {} in {:.4}s ({:.0} B/s)",
            job_id,
            session.rounds_completed,
            comm_time,
            session.current_throughput
        );

        let holder = engine.active_sender().map(str::to_owned);
        match (self.completion_policy, holder.as_deref()) {
            (_, Some(holder)) if holder == job_id => {
                engine.release();
            }
            (CompletionPolicy::Lenient, Some(holder)) => {
                tracing::warn!(
                    "Job {} reported completion while {} holds the link; releasing anyway",
                    job_id,
                    holder
                );
                engine.release();
            }
            (CompletionPolicy::Strict, Some(holder)) => {
                tracing::warn!(
                    "Rejecting completion from {}: link is held by {}",
                    job_id,
                    holder
                );
            }
            (_, None) => {
                tracing::debug!("Completion from {} with the link already free", job_id);
            }
        }

        arbitrate(&mut engine)
    }

    /// Note a job that sent a record the scheduler does not act on.
    pub async fn observe(&self, job_id: &str) {
        self.engine.lock().await.session_entry(job_id);
    }

    /// Forget the connection behind `outbox` for each job it spoke for.
    ///
    /// Sessions stay in the table unless eviction is enabled, in which case
    /// they are removed and a slot held by one of them is freed.
    pub async fn disconnect(&self, job_ids: &[String], outbox: &Outbox) -> Option<Grant> {
        let mut engine = self.engine.lock().await;

        for job_id in job_ids {
            let owned = engine
                .session_mut(job_id)
                .is_some_and(|session| session.detach(outbox));
            if !self.evict_on_disconnect || !owned {
                continue;
            }

            engine.remove(job_id);
            tracing::info!("Evicted job {}", job_id);
            if engine.active_sender() == Some(job_id.as_str()) {
                engine.release();
                tracing::warn!("Job {} disconnected while holding the link", job_id);
            }
        }

        arbitrate(&mut engine)
    }

    pub async fn active_sender(&self) -> Option<String> {
        self.engine.lock().await.active_sender().map(str::to_owned)
    }

    pub async fn session(&self, job_id: &str) -> Option<JobSession> {
        self.engine.lock().await.session(job_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.engine.lock().await.sessions().count()
    }

    pub async fn grants_issued(&self) -> u64 {
        self.engine.lock().await.grants_issued()
    }
}

fn arbitrate(engine: &mut ArbitrationEngine) -> Option<Grant> {
    let grant = engine.arbitrate()?;
    tracing::info!(
        "Granted link to job {} (priority {:.4}, grant #{})",
        grant.job_id,
        grant.priority,
        engine.grants_issued()
    );
    Some(grant)
}
