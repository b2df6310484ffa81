//! Delivery authorization: who may read and write a job's channel.
//!
//! Standing is looked up on every call. Applicant lists and hires change
//! while a room is open, so nothing here is cached.

use std::sync::Arc;

use tracing::debug;

use gigroom_shared::{JobId, UserId};
use gigroom_store::JobParticipants;

use crate::error::ServerError;
use crate::jobs::JobDirectory;

/// Why an actor is allowed into a job's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Client,
    Applicant,
    HiredDeveloper,
}

/// The actor's standing on a job, if any.
pub fn standing_of(job: &JobParticipants, actor: &UserId) -> Option<Standing> {
    if job.client == *actor {
        Some(Standing::Client)
    } else if job.hired_developer.as_ref() == Some(actor) {
        Some(Standing::HiredDeveloper)
    } else if job.applicants.contains(actor) {
        Some(Standing::Applicant)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct DeliveryGuard {
    jobs: Arc<dyn JobDirectory>,
}

impl DeliveryGuard {
    pub fn new(jobs: Arc<dyn JobDirectory>) -> Self {
        Self { jobs }
    }

    /// `Ok` with the actor's standing, `Forbidden` if they have none, or
    /// `NotFound` if the job is unknown.
    pub async fn authorize(&self, actor: &UserId, job_id: &JobId) -> Result<Standing, ServerError> {
        let job = self
            .jobs
            .participants(job_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("job {job_id}")))?;

        match standing_of(&job, actor) {
            Some(standing) => {
                debug!(actor = %actor, job = %job_id, ?standing, "delivery authorized");
                Ok(standing)
            }
            None => Err(ServerError::Forbidden(format!(
                "{actor} is not a participant of job {job_id}"
            ))),
        }
    }
}
