use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on stored failure reasons; engine stderr can be enormous.
const MAX_REASON_LEN: usize = 500;

/// Remote record coordinates supplied at submission in integrated mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub record_id: String,
    pub user_id: String,
}

/// Observable state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Ready { artifact: PathBuf },
    Failed { reason: String },
}

impl JobState {
    fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending)
    }
}

struct Job {
    state: JobState,
    created_at: Instant,
    external_ref: Option<ExternalRef>,
}

/// Read-only snapshot of a job, returned by [`TokenRegistry::get`]
#[derive(Debug, Clone)]
pub struct JobView {
    pub state: JobState,
    pub age: Duration,
    pub external_ref: Option<ExternalRef>,
}

/// Terminal outcome reported by the extraction worker
#[derive(Debug)]
pub enum Outcome {
    Ready(PathBuf),
    Failed(String),
}

/// Result of [`TokenRegistry::transition`]
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// The job moved from Pending to the given terminal state
    Transitioned,
    /// The job was already terminal; the call was ignored
    AlreadyTerminal,
    /// The token was evicted before the worker finished; the caller must
    /// delete any artifact it just produced
    Evicted,
}

/// Why a fetch could not hand out an artifact
#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// Unknown, expired or already-consumed token
    NotFound,
    /// Job still running
    Pending,
    /// Job failed; the entry is consumed by this observation
    Failed(String),
}

/// A job removed by the sweeper, with the artifact left to delete
#[derive(Debug)]
pub struct EvictedJob {
    pub token: String,
    pub artifact: Option<PathBuf>,
}

/// In-memory token-to-job mapping shared by the request facade, the
/// extraction workers and the sweeper.
///
/// Delivery policy: strict one-shot. A successful [`resolve`] removes the
/// entry, so a token grants at most one download; the caller owns the
/// returned artifact path from that point on. Failed jobs are likewise
/// reported once and then forgotten.
///
/// All operations take the single internal mutex, so a worker transition can
/// never interleave with a sweeper eviction on the same token.
///
/// [`resolve`]: TokenRegistry::resolve
pub struct TokenRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new Pending job and return its opaque token.
    ///
    /// Tokens carry 128 bits of entropy; collisions are not checked for
    /// because they do not happen in practice at that size.
    pub fn create(&self, external_ref: Option<ExternalRef>) -> String {
        let token = generate_token();
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.insert(
            token.clone(),
            Job {
                state: JobState::Pending,
                created_at: Instant::now(),
                external_ref,
            },
        );
        token
    }

    /// Non-consuming observation of a job's current state
    pub fn get(&self, token: &str) -> Option<JobView> {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.get(token).map(|job| JobView {
            state: job.state.clone(),
            age: job.created_at.elapsed(),
            external_ref: job.external_ref.clone(),
        })
    }

    /// Consume a token in exchange for its artifact path.
    ///
    /// Ready and Failed entries are removed by this call; Pending entries are
    /// left in place so the client can poll again.
    pub fn resolve(&self, token: &str) -> Result<PathBuf, ResolveError> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        match jobs.get(token) {
            None => Err(ResolveError::NotFound),
            Some(job) => match &job.state {
                JobState::Pending => Err(ResolveError::Pending),
                JobState::Ready { .. } => {
                    let job = jobs.remove(token).expect("entry present under lock");
                    match job.state {
                        JobState::Ready { artifact } => Ok(artifact),
                        _ => unreachable!(),
                    }
                }
                JobState::Failed { .. } => {
                    let job = jobs.remove(token).expect("entry present under lock");
                    match job.state {
                        JobState::Failed { reason } => Err(ResolveError::Failed(reason)),
                        _ => unreachable!(),
                    }
                }
            },
        }
    }

    /// Move a Pending job to a terminal state.
    ///
    /// Called exactly once per job by the worker. If the sweeper got there
    /// first the token is gone and `Evicted` is returned; the worker must
    /// then clean up the artifact itself.
    pub fn transition(&self, token: &str, outcome: Outcome) -> TransitionResult {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        match jobs.get_mut(token) {
            None => TransitionResult::Evicted,
            Some(job) if job.state.is_terminal() => TransitionResult::AlreadyTerminal,
            Some(job) => {
                job.state = match outcome {
                    Outcome::Ready(artifact) => JobState::Ready { artifact },
                    Outcome::Failed(reason) => JobState::Failed {
                        reason: truncate_reason(reason),
                    },
                };
                TransitionResult::Transitioned
            }
        }
    }

    /// Remove every job older than `ttl`, regardless of state, returning the
    /// artifact paths the caller must delete.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<EvictedJob> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.created_at.elapsed() >= ttl)
            .map(|(token, _)| token.clone())
            .collect();

        expired
            .into_iter()
            .map(|token| {
                let job = jobs.remove(&token).expect("entry present under lock");
                let artifact = match job.state {
                    JobState::Ready { artifact } => Some(artifact),
                    _ => None,
                };
                EvictedJob { token, artifact }
            })
            .collect()
    }

    /// Number of live (unconsumed, unevicted) tokens
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().expect("registry mutex poisoned").len()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    // 128 bits, lowercase hex: opaque, URL-safe, unguessable.
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}
