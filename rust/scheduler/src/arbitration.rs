//! Job sessions and the arbitration engine.
//!
//! The engine owns every [`JobSession`] and the single active-sender slot.
//! It is only ever reached through [`crate::state::SchedulerState`], which
//! holds it behind one lock, so `arbitrate` runs select-and-occupy atomically.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use arbiter_core::ControlMessage;

/// Floor for the communication time used as the intensity denominator.
pub const COMM_TIME_EPSILON: f64 = 1e-6;

/// Baseline throughput until a calibration phase exists.
pub const ISOLATED_THROUGHPUT_PLACEHOLDER: f64 = 1.0;

/// Messages queued for one control connection's writer task.
pub type Outbox = mpsc::UnboundedSender<ControlMessage>;

/// Scheduler-side state for one job.
#[derive(Debug, Clone)]
pub struct JobSession {
    pub job_id: String,
    pub isolated_throughput: f64,
    /// Bytes per second over the last full round; not used for ranking.
    pub current_throughput: f64,
    pub intensity: f64,
    /// Reserved fairness term, always zero.
    pub deficit: f64,
    pub priority: f64,
    pub waiting: bool,
    pub last_compute_duration: f64,
    pub last_payload_size: u64,
    pub last_comm_duration: f64,
    pub rounds_completed: u64,
    outbox: Option<Outbox>,
}

impl JobSession {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            isolated_throughput: ISOLATED_THROUGHPUT_PLACEHOLDER,
            current_throughput: 0.0,
            intensity: 0.0,
            deficit: 0.0,
            priority: 0.0,
            waiting: false,
            last_compute_duration: 0.0,
            last_payload_size: 0,
            last_comm_duration: COMM_TIME_EPSILON,
            rounds_completed: 0,
            outbox: None,
        }
    }

    /// Apply a send request: recompute intensity and priority from this
    /// job's own measurements and start waiting.
    pub fn record_send_request(&mut self, compute_time: f64, payload_size: u64, beta: f64) {
        self.last_compute_duration = compute_time;
        self.last_payload_size = payload_size;
        self.intensity = compute_time / self.last_comm_duration.max(COMM_TIME_EPSILON);
        self.priority = beta * self.intensity + (1.0 - beta) * self.deficit;
        self.waiting = true;
    }

    /// Apply a completion report.
    pub fn record_completion(&mut self, comm_time: f64) {
        self.last_comm_duration = comm_time;
        self.rounds_completed += 1;

        let round_time = self.last_compute_duration + comm_time;
        if round_time > 0.0 {
            self.current_throughput = self.last_payload_size as f64 / round_time;
        }
    }

    /// Route future grants to `outbox`.
    pub fn attach(&mut self, outbox: Outbox) {
        self.outbox = Some(outbox);
    }

    /// Forget the outbox if it is `outbox`. Returns whether it was.
    pub fn detach(&mut self, outbox: &Outbox) -> bool {
        match &self.outbox {
            Some(current) if current.same_channel(outbox) => {
                self.outbox = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a grant could be delivered right now.
    pub fn is_connected(&self) -> bool {
        self.outbox.as_ref().is_some_and(|outbox| !outbox.is_closed())
    }

    fn is_candidate(&self) -> bool {
        self.waiting && self.is_connected()
    }

    fn deliver_grant(&mut self) -> bool {
        let delivered = self
            .outbox
            .as_ref()
            .is_some_and(|outbox| outbox.send(ControlMessage::Grant).is_ok());
        if !delivered {
            self.outbox = None;
        }
        delivered
    }
}

/// A grant issued by [`ArbitrationEngine::arbitrate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub job_id: String,
    pub priority: f64,
}

/// Session table plus the active-sender slot.
#[derive(Debug, Default)]
pub struct ArbitrationEngine {
    sessions: BTreeMap<String, JobSession>,
    active_sender: Option<String>,
    grants_issued: u64,
}

impl ArbitrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `job_id`, created on first sight.
    pub fn session_entry(&mut self, job_id: &str) -> &mut JobSession {
        self.sessions
            .entry(job_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Created session for job {}", job_id);
                JobSession::new(job_id)
            })
    }

    pub fn session(&self, job_id: &str) -> Option<&JobSession> {
        self.sessions.get(job_id)
    }

    pub fn session_mut(&mut self, job_id: &str) -> Option<&mut JobSession> {
        self.sessions.get_mut(job_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &JobSession> {
        self.sessions.values()
    }

    pub fn remove(&mut self, job_id: &str) -> Option<JobSession> {
        self.sessions.remove(job_id)
    }

    pub fn active_sender(&self) -> Option<&str> {
        self.active_sender.as_deref()
    }

    pub fn grants_issued(&self) -> u64 {
        self.grants_issued
    }

    /// Free the slot, returning whoever held it.
    pub fn release(&mut self) -> Option<String> {
        self.active_sender.take()
    }

    /// Grant the link to the highest-priority waiting job if it is free.
    ///
    /// No-op if the slot is occupied or nobody is waiting. Ties go to the
    /// smallest job id. A job whose connection is gone keeps waiting but is
    /// skipped until it attaches a new outbox.
    pub fn arbitrate(&mut self) -> Option<Grant> {
        if self.active_sender.is_some() {
            return None;
        }

        loop {
            let mut winner: Option<&mut JobSession> = None;
            for session in self.sessions.values_mut().filter(|s| s.is_candidate()) {
                let better = winner
                    .as_ref()
                    .map_or(true, |best| session.priority.total_cmp(&best.priority).is_gt());
                if better {
                    winner = Some(session);
                }
            }
            let session = winner?;

            if !session.deliver_grant() {
                tracing::warn!(
                    "Job {} disconnected before its grant could be delivered",
                    session.job_id
                );
                continue;
            }

            session.waiting = false;
            let grant = Grant {
                job_id: session.job_id.clone(),
                priority: session.priority,
            };
            self.active_sender = Some(grant.job_id.clone());
            self.grants_issued += 1;
            return Some(grant);
        }
    }
}
