//! Requests and their lifecycle.

use serde::{Deserialize, Serialize};

use crate::kv_cache::BlockId;
use crate::RequestId;

/// State of a request in the scheduler
///
/// `Waiting → Running → Finished`, with `Running → Preempted → Running` as
/// the recovery cycle when another request needs its blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Request is waiting to be scheduled
    Waiting,
    /// Request is currently running (in the active batch)
    Running,
    /// Request lost its blocks and will be rescheduled
    Preempted,
    /// Request has finished generation
    Finished,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Waiting => write!(f, "Waiting"),
            RequestState::Running => write!(f, "Running"),
            RequestState::Preempted => write!(f, "Preempted"),
            RequestState::Finished => write!(f, "Finished"),
        }
    }
}

/// Why a request reached [`RequestState::Finished`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Generated tokens reached `max_new_tokens`
    Length,
    /// The model produced an end-of-sequence token
    Stop,
    /// Cancelled by the caller
    Aborted,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Length => write!(f, "length"),
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Caller-supplied description of a new request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    /// Unique request identifier
    pub id: RequestId,

    /// Priority (lower = higher priority)
    #[serde(default)]
    pub priority: u32,

    /// Prompt length in tokens
    pub prompt_tokens: usize,

    /// Maximum number of new tokens to generate
    pub max_tokens: usize,
}

impl NewRequest {
    /// Create a request description with default priority 0
    pub fn new(id: RequestId, prompt_tokens: usize, max_tokens: usize) -> Self {
        Self { id, priority: 0, prompt_tokens, max_tokens }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// A request tracked by the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Unique request identifier
    pub id: RequestId,

    /// Priority (lower = higher priority)
    pub priority: u32,

    /// Admission order, assigned by the scheduler
    pub arrival: u64,

    /// Prompt length in tokens
    pub prompt_tokens: usize,

    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,

    /// Tokens generated so far
    pub generated_tokens: usize,

    /// Physical blocks currently owned, in logical order
    pub block_ids: Vec<BlockId>,

    /// Current state of the request
    pub state: RequestState,

    /// Scheduling step of the latest admission into the running batch
    pub admitted_step: u64,

    /// How many times the request lost its blocks
    pub num_preemptions: u32,

    /// Set once the request is finished
    pub finish_reason: Option<FinishReason>,
}

impl Request {
    pub(crate) fn from_new(new: NewRequest, arrival: u64) -> Self {
        Self {
            id: new.id,
            priority: new.priority,
            arrival,
            prompt_tokens: new.prompt_tokens,
            max_new_tokens: new.max_tokens,
            generated_tokens: 0,
            block_ids: Vec::new(),
            state: RequestState::Waiting,
            admitted_step: 0,
            num_preemptions: 0,
            finish_reason: None,
        }
    }

    /// Get the total number of tokens (prompt + generated)
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.generated_tokens
    }

    /// Get the number of remaining tokens to generate
    pub fn remaining_tokens(&self) -> usize {
        self.max_new_tokens.saturating_sub(self.generated_tokens)
    }

    /// Check if the request has generated all of its tokens
    pub fn reached_max_tokens(&self) -> bool {
        self.generated_tokens >= self.max_new_tokens
    }

    /// Blocks needed to hold the current tokens, never less than one
    pub fn blocks_needed(&self, block_size: usize) -> usize {
        self.total_tokens().div_ceil(block_size).max(1)
    }

    /// Blocks needed at the largest size this request can reach
    pub fn peak_blocks(&self, block_size: usize) -> usize {
        (self.prompt_tokens + self.max_new_tokens).div_ceil(block_size).max(1)
    }

    /// Ordering key for the waiting and preempted queues
    pub fn queue_key(&self) -> (u32, u64) {
        (self.priority, self.arrival)
    }

    /// Descriptor handed to the model executor
    pub fn descriptor(&self) -> ScheduledRequest {
        ScheduledRequest {
            id: self.id,
            block_ids: self.block_ids.clone(),
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated_tokens,
        }
    }
}

/// Snapshot of a running request for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRequest {
    pub id: RequestId,
    pub block_ids: Vec<BlockId>,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}
