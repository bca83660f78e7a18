// mini-vLLM Core Library
//
// Paged KV block allocator with LRU eviction, preemptive priority scheduler
// and the step loop that drives them.

pub mod config;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod scheduler;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, ModelExecutor, SimulatedExecutor, StepOutput};
pub use error::EngineError;
pub use kv_cache::{AllocatorError, BlockAllocator, BlockId};
pub use scheduler::{NewRequest, Request, RequestState, Scheduler, SchedulerError};

/// Identifier of a request, unique among live requests
pub type RequestId = u64;
