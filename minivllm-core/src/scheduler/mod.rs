//! Preemptive Priority Scheduler
//!
//! Admits requests into a bounded running batch in priority order and
//! coordinates with the [`BlockAllocator`] for their KV cache blocks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │  Preempted queue         │   │  Waiting queue           │
//! │  (priority, arrival)     │   │  (priority, arrival)     │
//! └────────────┬─────────────┘   └────────────┬─────────────┘
//!              └──────────────┬───────────────┘
//!                     ┌───────▼───────┐
//!                     │   Scheduler   │ ── shortfall ──► evict lower-priority
//!                     └───────┬───────┘                   running requests
//!                     ┌───────▼───────┐
//!                     │ Running batch │  ≤ max_batch_size
//!                     └───────────────┘
//! ```
//!
//! # Admission rules
//!
//! - The preempted head is served before the waiting head unless the waiting
//!   head has a strictly better priority, so a preempted request never
//!   starves behind new arrivals of equal or lower priority.
//! - When blocks run short, running requests with a strictly worse priority
//!   are evicted one at a time: worst priority first, then the most recently
//!   admitted within that priority so long-running work survives. Requests
//!   admitted in the same step fall back to least recently used.
//! - If the shortfall cannot be cleared the candidate stays at the head of
//!   its queue and no further admissions happen this step.
//!
//! # Example
//!
//! ```rust
//! use minivllm_core::config::EngineConfig;
//! use minivllm_core::scheduler::{NewRequest, Scheduler};
//!
//! let config = EngineConfig::new(4, 16, 8).unwrap();
//! let mut scheduler = Scheduler::new(config).unwrap();
//!
//! scheduler.add_request(NewRequest::new(1, 32, 8)).unwrap();
//! let output = scheduler.schedule();
//!
//! assert_eq!(output.batch.len(), 1);
//! assert_eq!(output.batch[0].block_ids.len(), 2);
//! ```

mod queue;
mod request;

pub use queue::{QueueKey, RequestQueue};
pub use request::{FinishReason, NewRequest, Request, RequestState, ScheduledRequest};

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::kv_cache::{AllocatorError, AllocatorStats, BlockAllocator};
use crate::RequestId;

/// Errors that can occur during scheduling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A live request already uses this identifier
    #[error("request {0} already exists")]
    DuplicateId(RequestId),

    /// The request is not in the state the operation needs
    #[error("request {0} is not known to the scheduler in the required state")]
    UnknownRequestId(RequestId),

    /// The request description is unusable
    #[error("request {id} is invalid: {reason}")]
    InvalidRequest { id: RequestId, reason: &'static str },

    /// The request could never fit in the block pool
    #[error("request {id} needs {blocks_needed} blocks but the pool only has {total_blocks}")]
    ExceedsCapacity { id: RequestId, blocks_needed: usize, total_blocks: usize },

    /// Unexpected allocator failure
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}

/// Queue the next admission candidate comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Preempted,
    Waiting,
}

/// A queue head that could not be admitted this step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stall {
    pub request_id: RequestId,
    pub deficit: usize,
}

/// Output from a scheduling step
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerOutput {
    /// Running requests to process this step, in admission order
    pub batch: Vec<ScheduledRequest>,

    /// Requests admitted by this call
    pub admitted: Vec<RequestId>,

    /// Requests preempted by this call to make room
    pub preempted: Vec<RequestId>,

    /// Queue head left waiting because its shortfall could not be cleared
    pub stalled: Option<Stall>,

    /// Number of requests still waiting
    pub num_waiting: usize,

    /// Number of requests in the preempted queue
    pub num_preempted: usize,
}

impl SchedulerOutput {
    /// Check if there's any work to do this step
    pub fn has_work(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Get the batch size
    pub fn num_sequences(&self) -> usize {
        self.batch.len()
    }
}

/// Result of generating one token for a running request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Still running, blocks cover every token
    Running,
    /// The sequence is complete; the caller should finish it with this reason
    Complete(FinishReason),
    /// No block for the next token; the request was preempted
    Preempted,
}

/// Outcome of [`Scheduler::append_token`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    pub status: TokenStatus,

    /// Lower-priority requests evicted to grow this one
    pub evicted: Vec<RequestId>,
}

/// Preemptive priority scheduler
///
/// Owns every live [`Request`] and the [`BlockAllocator`] backing them.
pub struct Scheduler {
    /// Configuration
    config: EngineConfig,

    /// Block allocator for KV cache memory
    allocator: BlockAllocator,

    /// Waiting, running and preempted requests keyed by ID
    requests: HashMap<RequestId, Request>,

    /// Requests never admitted yet
    waiting: RequestQueue,

    /// Requests that lost their blocks
    preempted: RequestQueue,

    /// Running batch in admission order
    running: Vec<RequestId>,

    /// Finished requests not yet collected
    finished: Vec<Request>,

    /// Next arrival sequence number
    next_arrival: u64,

    /// Preemptions since construction
    total_preemptions: u64,

    /// Number of `schedule()` calls so far
    step: u64,
}

impl Scheduler {
    /// Create a new scheduler and its block pool
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let allocator = BlockAllocator::new(config.num_blocks, config.block_size)?;

        Ok(Self {
            config,
            allocator,
            requests: HashMap::new(),
            waiting: RequestQueue::new(),
            preempted: RequestQueue::new(),
            running: Vec::new(),
            finished: Vec::new(),
            next_arrival: 0,
            total_preemptions: 0,
            step: 0,
        })
    }

    /// Add a new request to the waiting queue
    pub fn add_request(&mut self, new: NewRequest) -> Result<(), SchedulerError> {
        if self.requests.contains_key(&new.id) {
            return Err(SchedulerError::DuplicateId(new.id));
        }
        if new.max_tokens == 0 {
            return Err(SchedulerError::InvalidRequest {
                id: new.id,
                reason: "max_tokens must be greater than 0",
            });
        }

        let request = Request::from_new(new, self.next_arrival);
        let blocks_needed = request.peak_blocks(self.config.block_size);
        if blocks_needed > self.config.num_blocks {
            return Err(SchedulerError::ExceedsCapacity {
                id: new.id,
                blocks_needed,
                total_blocks: self.config.num_blocks,
            });
        }

        self.next_arrival += 1;
        self.waiting.push(request.id, request.queue_key());
        debug!(request_id = request.id, priority = request.priority, "request queued");
        self.requests.insert(request.id, request);

        Ok(())
    }

    /// Schedule the next batch for execution
    ///
    /// Fills free batch slots from the preempted and waiting queues, evicting
    /// lower-priority running requests when blocks run short. Every request in
    /// the returned batch is marked most-recently-used in the allocator.
    pub fn schedule(&mut self) -> SchedulerOutput {
        let mut output = SchedulerOutput::default();
        self.step += 1;

        let requests = &self.requests;
        self.running
            .retain(|id| requests.get(id).is_some_and(|r| r.state == RequestState::Running));

        while self.running.len() < self.config.max_batch_size {
            let Some((source, id)) = self.next_candidate() else {
                break;
            };

            match self.try_admit(id, &output.admitted, &mut output.preempted) {
                Ok(()) => {
                    match source {
                        Source::Preempted => self.preempted.pop(),
                        Source::Waiting => self.waiting.pop(),
                    };
                    output.admitted.push(id);
                }
                Err(deficit) => {
                    warn!(request_id = id, deficit, "cannot admit request, leaving it queued");
                    output.stalled = Some(Stall { request_id: id, deficit });
                    break;
                }
            }
        }

        for &id in &self.running {
            self.allocator.touch(id);
        }

        output.batch = self
            .running
            .iter()
            .filter_map(|id| self.requests.get(id))
            .map(Request::descriptor)
            .collect();
        output.num_waiting = self.waiting.len();
        output.num_preempted = self.preempted.len();

        output
    }

    /// Pick the next admission candidate without dequeuing it
    fn next_candidate(&self) -> Option<(Source, RequestId)> {
        match (self.preempted.peek(), self.waiting.peek()) {
            (Some((p, (p_prio, _))), Some((_, (w_prio, _)))) if p_prio <= w_prio => {
                Some((Source::Preempted, p))
            }
            (_, Some((w, _))) => Some((Source::Waiting, w)),
            (Some((p, _)), None) => Some((Source::Preempted, p)),
            (None, None) => None,
        }
    }

    /// Allocate blocks for a queued request and move it to running
    ///
    /// Returns the unresolved deficit when the request cannot be admitted.
    fn try_admit(
        &mut self,
        id: RequestId,
        pinned: &[RequestId],
        preempted: &mut Vec<RequestId>,
    ) -> Result<(), usize> {
        let Some(request) = self.requests.get(&id) else {
            return Err(0);
        };
        let needed = request.blocks_needed(self.config.block_size);
        let priority = request.priority;

        loop {
            match self.allocator.allocate(id, needed) {
                Ok(_) => break,
                Err(AllocatorError::Shortfall { deficit, .. }) => {
                    if self.reclaimable_blocks(priority, pinned, id) < deficit {
                        return Err(deficit);
                    }
                    let evicted = self.evict_lower_priority(priority, pinned, id);
                    if evicted.is_empty() {
                        return Err(deficit);
                    }
                    preempted.extend(evicted);
                }
                Err(_) => return Err(needed),
            }
        }

        self.sync_blocks(id);
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Running;
            request.admitted_step = self.step;
            debug!(
                request_id = id,
                blocks = request.block_ids.len(),
                preemptions = request.num_preemptions,
                "request admitted"
            );
        }
        self.running.push(id);

        Ok(())
    }

    /// Running requests that may be evicted for a request of `priority`
    fn eviction_candidates<'a>(
        &'a self,
        priority: u32,
        pinned: &'a [RequestId],
        exclude: RequestId,
    ) -> impl Iterator<Item = &'a Request> + 'a {
        self.running
            .iter()
            .filter(move |&&id| id != exclude && !pinned.contains(&id))
            .filter_map(move |id| self.requests.get(id))
            .filter(move |r| r.priority > priority)
    }

    /// Blocks held by running requests with a strictly worse priority
    fn reclaimable_blocks(&self, priority: u32, pinned: &[RequestId], exclude: RequestId) -> usize {
        self.eviction_candidates(priority, pinned, exclude)
            .map(|r| self.allocator.num_owned(r.id))
            .sum()
    }

    /// Evict one running request of the worst priority below `priority`
    ///
    /// Within that priority the most recently admitted request goes first;
    /// requests admitted in the same step are ordered least recently used.
    fn evict_lower_priority(
        &mut self,
        priority: u32,
        pinned: &[RequestId],
        exclude: RequestId,
    ) -> Vec<RequestId> {
        let Some(worst) = self.eviction_candidates(priority, pinned, exclude).map(|r| r.priority).max()
        else {
            return Vec::new();
        };
        let newest = self
            .eviction_candidates(priority, pinned, exclude)
            .filter(|r| r.priority == worst)
            .map(|r| r.admitted_step)
            .max()
            .unwrap_or_default();
        let class: Vec<RequestId> = self
            .eviction_candidates(priority, pinned, exclude)
            .filter(|r| r.priority == worst && r.admitted_step == newest)
            .map(|r| r.id)
            .collect();

        let evicted = match self.allocator.evict_least_recently_used(1, |owner| class.contains(&owner)) {
            Ok(eviction) => eviction.evicted_requests,
            Err(_) => return Vec::new(),
        };

        for &victim in &evicted {
            info!(request_id = victim, priority = worst, for_priority = priority, "evicted request");
            self.demote(victim);
        }
        evicted
    }

    /// Move a running request whose blocks are gone to the preempted queue
    fn demote(&mut self, id: RequestId) {
        self.running.retain(|&running| running != id);
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Preempted;
            request.block_ids.clear();
            request.num_preemptions += 1;
            self.preempted.push(id, request.queue_key());
            self.total_preemptions += 1;
        }
    }

    /// Copy the allocator's block table into the request record
    fn sync_blocks(&mut self, id: RequestId) {
        let blocks = self.allocator.block_ids(id).to_vec();
        if let Some(request) = self.requests.get_mut(&id) {
            request.block_ids = blocks;
        }
    }

    fn running_request(&self, id: RequestId) -> Result<&Request, SchedulerError> {
        self.requests
            .get(&id)
            .filter(|r| r.state == RequestState::Running)
            .ok_or(SchedulerError::UnknownRequestId(id))
    }

    /// Record one generated token for a running request
    ///
    /// A token that ends the sequence (`end_of_sequence`, or the last of
    /// `max_new_tokens`) completes the request without growing it. Otherwise
    /// the block table grows when the tokens no longer fit. If no block can be
    /// found, even after evicting strictly lower-priority running requests,
    /// the request itself is preempted.
    pub fn append_token(
        &mut self,
        id: RequestId,
        end_of_sequence: bool,
    ) -> Result<TokenOutcome, SchedulerError> {
        self.running_request(id)?;

        let block_size = self.config.block_size;
        let (priority, needed) = match self.requests.get_mut(&id) {
            Some(request) => {
                request.generated_tokens += 1;
                let reason = if request.reached_max_tokens() {
                    Some(FinishReason::Length)
                } else if end_of_sequence {
                    Some(FinishReason::Stop)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Ok(TokenOutcome {
                        status: TokenStatus::Complete(reason),
                        evicted: Vec::new(),
                    });
                }
                (request.priority, request.blocks_needed(block_size))
            }
            None => return Err(SchedulerError::UnknownRequestId(id)),
        };

        let mut evicted = Vec::new();
        let owned = self.allocator.num_owned(id);
        if needed <= owned {
            return Ok(TokenOutcome { status: TokenStatus::Running, evicted });
        }

        loop {
            match self.allocator.allocate(id, needed - owned) {
                Ok(_) => {
                    self.sync_blocks(id);
                    debug!(request_id = id, blocks = needed, "grew block table");
                    return Ok(TokenOutcome { status: TokenStatus::Running, evicted });
                }
                Err(AllocatorError::Shortfall { deficit, .. }) => {
                    let victims = if self.reclaimable_blocks(priority, &[], id) >= deficit {
                        self.evict_lower_priority(priority, &[], id)
                    } else {
                        Vec::new()
                    };
                    if victims.is_empty() {
                        self.preempt(id)?;
                        return Ok(TokenOutcome { status: TokenStatus::Preempted, evicted });
                    }
                    evicted.extend(victims);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Mark a running request as finished and release its blocks
    pub fn mark_finished(
        &mut self,
        id: RequestId,
        reason: FinishReason,
    ) -> Result<(), SchedulerError> {
        self.running_request(id)?;

        self.running.retain(|&running| running != id);
        self.allocator.free(id);

        if let Some(mut request) = self.requests.remove(&id) {
            request.state = RequestState::Finished;
            request.finish_reason = Some(reason);
            request.block_ids.clear();
            info!(
                request_id = id,
                reason = %reason,
                generated = request.generated_tokens,
                "request finished"
            );
            self.finished.push(request);
        }

        Ok(())
    }

    /// Preempt a running request: release its blocks and requeue it
    pub fn preempt(&mut self, id: RequestId) -> Result<(), SchedulerError> {
        self.running_request(id)?;

        self.allocator.free(id);
        self.demote(id);
        info!(request_id = id, "request preempted");

        Ok(())
    }

    /// Abort a request (remove it from the system)
    ///
    /// Queued requests are dropped without touching the allocator; a running
    /// request is finished with [`FinishReason::Aborted`].
    pub fn abort_request(&mut self, id: RequestId) -> Result<(), SchedulerError> {
        if self.waiting.remove(id) || self.preempted.remove(id) {
            if let Some(mut request) = self.requests.remove(&id) {
                request.state = RequestState::Finished;
                request.finish_reason = Some(FinishReason::Aborted);
                self.finished.push(request);
            }
            return Ok(());
        }

        self.mark_finished(id, FinishReason::Aborted)
    }

    /// Mark a running request's blocks as most-recently-used
    pub fn touch(&mut self, id: RequestId) -> Result<(), SchedulerError> {
        self.running_request(id)?;
        self.allocator.touch(id);
        Ok(())
    }

    /// Collect requests finished since the last call
    pub fn take_finished(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.finished)
    }

    /// Check whether any request is waiting, running or preempted
    pub fn has_work(&self) -> bool {
        !self.running.is_empty() || !self.waiting.is_empty() || !self.preempted.is_empty()
    }

    /// Get a live request by ID
    pub fn get_request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    /// Iterate over every live request
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    /// Check whether a request is in the running batch
    pub fn is_running(&self, id: RequestId) -> bool {
        self.running_request(id).is_ok()
    }

    /// Running request IDs in admission order
    pub fn running_ids(&self) -> &[RequestId] {
        &self.running
    }

    /// Waiting request IDs in service order
    pub fn waiting_ids(&self) -> Vec<RequestId> {
        self.waiting.ids().collect()
    }

    /// Preempted request IDs in service order
    pub fn preempted_ids(&self) -> Vec<RequestId> {
        self.preempted.ids().collect()
    }

    /// Get the number of waiting requests
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get the number of running requests
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Get the number of preempted requests
    pub fn num_preempted(&self) -> usize {
        self.preempted.len()
    }

    /// Get the block allocator (read-only)
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Get the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get statistics about the scheduler
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            num_waiting: self.waiting.len(),
            num_running: self.running.len(),
            num_preempted: self.preempted.len(),
            total_preemptions: self.total_preemptions,
            allocator: self.allocator.stats(),
        }
    }
}

/// Statistics about the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub num_waiting: usize,
    pub num_running: usize,
    pub num_preempted: usize,
    pub total_preemptions: u64,
    pub allocator: AllocatorStats,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scheduler: {} waiting, {} running, {} preempted, {:.1}% memory",
            self.num_waiting,
            self.num_running,
            self.num_preempted,
            self.allocator.utilization * 100.0
        )
    }
}
