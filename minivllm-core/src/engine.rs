//! Engine driving loop
//!
//! Each [`Engine::step`] asks the scheduler for a batch, hands the batch to a
//! [`ModelExecutor`], then records one generated token per request and
//! finishes requests that hit `max_new_tokens` or an end-of-sequence token.
//!
//! The engine is single-threaded and steps synchronously: a step completes
//! before the next one starts. A host that shares an engine between threads
//! must serialize `add_request` and `step` itself.
//!
//! # Example
//!
//! ```rust
//! use minivllm_core::config::EngineConfig;
//! use minivllm_core::engine::Engine;
//! use minivllm_core::scheduler::NewRequest;
//!
//! let mut engine = Engine::new(EngineConfig::new(20, 16, 4).unwrap()).unwrap();
//! engine.add_request(NewRequest::new(1, 5, 3)).unwrap();
//! engine.add_request(NewRequest::new(2, 5, 5)).unwrap();
//!
//! let summary = engine.run(100).unwrap();
//! assert!(summary.completed);
//! assert_eq!(summary.finished.len(), 2);
//! ```

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::scheduler::{
    FinishReason, NewRequest, Request, ScheduledRequest, Scheduler, Stall, TokenStatus,
};
use crate::RequestId;

/// Model execution backend invoked once per step
pub trait ModelExecutor {
    /// Run one forward pass for the batch
    ///
    /// Returns the IDs whose sequence ended naturally with the token produced
    /// by this pass.
    fn execute(&mut self, batch: &[ScheduledRequest]) -> ExecutionOutput;
}

/// Result of one executor call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Requests that produced an end-of-sequence token
    pub stopped: Vec<RequestId>,
}

/// Executor that produces placeholder tokens
///
/// Sequences run to `max_new_tokens` unless a stop point was registered with
/// [`SimulatedExecutor::stop_after`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    stop_points: HashMap<RequestId, usize>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// End the request's sequence once it has generated `tokens` tokens
    pub fn stop_after(mut self, id: RequestId, tokens: usize) -> Self {
        self.stop_points.insert(id, tokens);
        self
    }

    /// Register a stop point on an existing executor
    pub fn set_stop_after(&mut self, id: RequestId, tokens: usize) {
        self.stop_points.insert(id, tokens);
    }
}

impl ModelExecutor for SimulatedExecutor {
    fn execute(&mut self, batch: &[ScheduledRequest]) -> ExecutionOutput {
        let stopped = batch
            .iter()
            .filter(|r| self.stop_points.get(&r.id).is_some_and(|&n| r.generated_tokens + 1 >= n))
            .map(|r| r.id)
            .collect();
        ExecutionOutput { stopped }
    }
}

/// Result of a single engine step
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepOutput {
    /// Step number, starting at 1
    pub iteration: u64,

    /// Requests processed this step
    pub batch: Vec<RequestId>,

    /// Requests admitted this step
    pub admitted: Vec<RequestId>,

    /// Requests that lost their blocks this step
    pub preempted: Vec<RequestId>,

    /// Requests finished this step
    pub finished: Vec<Request>,

    /// Queue head that could not be admitted
    pub stalled: Option<Stall>,

    /// Tokens recorded this step
    pub tokens_generated: usize,

    /// Free blocks after the step
    pub free_blocks: usize,

    /// Whether any request is still waiting, running or preempted
    pub has_work: bool,
}

/// Counters accumulated across steps
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub iterations: u64,
    pub tokens_generated: u64,
    pub requests_added: u64,
    pub requests_admitted: u64,
    pub preemptions: u64,
    pub stalled_steps: u64,
    pub finished_length: u64,
    pub finished_stop: u64,
    pub aborted: u64,
}

impl EngineMetrics {
    fn record_finished(&mut self, request: &Request) {
        match request.finish_reason {
            Some(FinishReason::Length) => self.finished_length += 1,
            Some(FinishReason::Stop) => self.finished_stop += 1,
            Some(FinishReason::Aborted) => self.aborted += 1,
            None => {}
        }
    }

    /// Requests that completed generation (not aborted)
    pub fn completed(&self) -> u64 {
        self.finished_length + self.finished_stop
    }
}

impl std::fmt::Display for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine: {} iterations, {} tokens, {} completed, {} aborted, {} preemptions",
            self.iterations,
            self.tokens_generated,
            self.completed(),
            self.aborted,
            self.preemptions
        )
    }
}

/// Result of [`Engine::run`]
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Steps executed by this run
    pub iterations: u64,

    /// False when the iteration cap stopped the run with work remaining
    pub completed: bool,

    /// Requests finished during the run, in completion order
    pub finished: Vec<Request>,

    pub metrics: EngineMetrics,
}

/// Inference engine main loop
pub struct Engine<E = SimulatedExecutor> {
    scheduler: Scheduler,
    executor: E,
    metrics: EngineMetrics,
}

impl Engine<SimulatedExecutor> {
    /// Create an engine with the placeholder executor
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_executor(config, SimulatedExecutor::new())
    }
}

impl<E: ModelExecutor> Engine<E> {
    /// Create an engine around a model executor
    pub fn with_executor(config: EngineConfig, executor: E) -> Result<Self, EngineError> {
        let scheduler = Scheduler::new(config)?;
        info!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            max_batch_size = config.max_batch_size,
            "engine created"
        );

        Ok(Self { scheduler, executor, metrics: EngineMetrics::default() })
    }

    /// Queue a new request
    pub fn add_request(&mut self, new: NewRequest) -> Result<(), EngineError> {
        self.scheduler.add_request(new)?;
        self.metrics.requests_added += 1;
        Ok(())
    }

    /// Cancel a request
    ///
    /// The aborted request is reported in the next step's `finished` list.
    pub fn abort(&mut self, id: RequestId) -> Result<(), EngineError> {
        self.scheduler.abort_request(id)?;
        Ok(())
    }

    /// Run one scheduling + generation step
    pub fn step(&mut self) -> Result<StepOutput, EngineError> {
        self.metrics.iterations += 1;
        let scheduled = self.scheduler.schedule();

        let mut output = StepOutput {
            iteration: self.metrics.iterations,
            batch: scheduled.batch.iter().map(|r| r.id).collect(),
            admitted: scheduled.admitted,
            preempted: scheduled.preempted,
            stalled: scheduled.stalled,
            ..Default::default()
        };

        if output.stalled.is_some() {
            self.metrics.stalled_steps += 1;
        }

        if !scheduled.batch.is_empty() {
            let execution = self.executor.execute(&scheduled.batch);

            for request in &scheduled.batch {
                // Evicted earlier in this step by a higher-priority request
                if !self.scheduler.is_running(request.id) {
                    continue;
                }

                let eos = execution.stopped.contains(&request.id);
                let outcome = self.scheduler.append_token(request.id, eos)?;
                output.tokens_generated += 1;
                output.preempted.extend(outcome.evicted);

                match outcome.status {
                    TokenStatus::Running => {}
                    TokenStatus::Complete(reason) => {
                        self.scheduler.mark_finished(request.id, reason)?;
                    }
                    TokenStatus::Preempted => output.preempted.push(request.id),
                }
            }
        }

        output.finished = self.scheduler.take_finished();
        for request in &output.finished {
            self.metrics.record_finished(request);
        }

        self.metrics.requests_admitted += output.admitted.len() as u64;
        self.metrics.preemptions += output.preempted.len() as u64;
        self.metrics.tokens_generated += output.tokens_generated as u64;

        output.free_blocks = self.scheduler.allocator().free_block_count();
        output.has_work = self.scheduler.has_work();

        debug!(
            iteration = output.iteration,
            batch = output.batch.len(),
            tokens = output.tokens_generated,
            finished = output.finished.len(),
            free_blocks = output.free_blocks,
            "step complete"
        );

        Ok(output)
    }

    /// Step until no work remains or `max_iterations` steps have run
    pub fn run(&mut self, max_iterations: usize) -> Result<RunSummary, EngineError> {
        let mut finished = Vec::new();
        let mut iterations = 0;
        let mut completed = !self.scheduler.has_work();

        while !completed && iterations < max_iterations as u64 {
            let output = self.step()?;
            iterations += 1;
            finished.extend(output.finished);
            completed = !output.has_work;
        }

        if completed {
            info!(iterations, finished = finished.len(), "run complete");
        } else {
            warn!(
                iterations,
                waiting = self.scheduler.num_waiting(),
                running = self.scheduler.num_running(),
                preempted = self.scheduler.num_preempted(),
                "iteration cap reached with work remaining"
            );
        }

        Ok(RunSummary { iterations, completed, finished, metrics: self.metrics.clone() })
    }

    /// Check whether any request is waiting, running or preempted
    pub fn has_work(&self) -> bool {
        self.scheduler.has_work()
    }

    /// Get the scheduler (read-only)
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get the accumulated metrics
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Get the model executor mutably
    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }
}
