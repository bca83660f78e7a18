//! Allocator and scheduler properties checked across whole workloads:
//! - Block accounting and ownership after every step
//! - Victim selection: newest admission first, then LRU
//! - Priority admission and preemption recovery
//! - Graceful handling of memory pressure

use std::collections::HashSet;

use minivllm_core::config::EngineConfig;
use minivllm_core::engine::{Engine, SimulatedExecutor};
use minivllm_core::kv_cache::BlockAllocator;
use minivllm_core::scheduler::{NewRequest, RequestState, Scheduler};

/// Check the block accounting invariants of a scheduler
fn assert_invariants(scheduler: &Scheduler) {
    let allocator = scheduler.allocator();
    let block_size = scheduler.config().block_size;

    let mut seen = HashSet::new();
    let mut owned = 0;

    for request in scheduler.requests() {
        match request.state {
            RequestState::Running => {
                assert_eq!(
                    request.block_ids.len(),
                    request.blocks_needed(block_size),
                    "request {} holds the wrong number of blocks",
                    request.id
                );
                assert_eq!(request.block_ids, allocator.block_ids(request.id));
            }
            RequestState::Waiting | RequestState::Preempted => {
                assert!(request.block_ids.is_empty(), "queued request {} owns blocks", request.id);
                assert_eq!(allocator.num_owned(request.id), 0);
            }
            RequestState::Finished => panic!("finished request {} still live", request.id),
        }

        for &block in &request.block_ids {
            assert!(seen.insert(block), "{} owned twice", block);
            assert_eq!(allocator.owner_of(block), Some(request.id));
        }
        owned += request.block_ids.len();
    }

    assert_eq!(allocator.free_block_count() + owned, allocator.num_total_blocks());
    assert_eq!(allocator.num_owned_blocks(), owned);
    assert!(scheduler.num_running() <= scheduler.config().max_batch_size);
}

/// Tiny deterministic generator so workloads are reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn test_capacity_invariant_under_mixed_workload() {
    let config = EngineConfig::new(12, 4, 5).unwrap();
    let mut executor = SimulatedExecutor::new();
    let mut rng = Lcg(7);

    let mut pending = Vec::new();
    for id in 0..40 {
        let prompt = 1 + rng.next(12) as usize;
        let max_tokens = 1 + rng.next(20) as usize;
        let priority = rng.next(4) as u32;
        if rng.next(5) == 0 {
            executor.set_stop_after(id, 1 + rng.next(max_tokens as u64) as usize);
        }
        pending.push(NewRequest::new(id, prompt, max_tokens).with_priority(priority));
    }

    let mut engine = Engine::with_executor(config, executor).unwrap();
    let mut step = 0;
    while !pending.is_empty() || engine.has_work() {
        // A few arrivals per step
        for _ in 0..rng.next(3) {
            if let Some(new) = pending.pop() {
                engine.add_request(new).unwrap();
            }
        }
        engine.step().unwrap();
        assert_invariants(engine.scheduler());

        step += 1;
        assert!(step < 2_000, "workload did not drain");
    }

    assert_eq!(engine.metrics().completed(), 40);
    assert_eq!(engine.scheduler().allocator().free_block_count(), 12);
}

#[test]
fn test_lru_eviction_picks_least_recently_touched() {
    let mut allocator = BlockAllocator::new(3, 16).unwrap();
    for id in [1, 2, 3] {
        allocator.allocate(id, 1).unwrap();
    }

    // Touch order A(1), B(2), C(3)
    allocator.touch(1);
    allocator.touch(2);
    allocator.touch(3);

    let eviction = allocator.evict_least_recently_used(1, |_| true).unwrap();
    assert_eq!(eviction.evicted_requests, vec![1]);
    assert_eq!(eviction.freed_blocks.len(), 1);

    // Request 4 now fits
    assert!(allocator.allocate(4, 1).is_ok());
}

#[test]
fn test_idempotent_free() {
    let mut allocator = BlockAllocator::new(4, 16).unwrap();
    allocator.allocate(1, 2).unwrap();
    allocator.free(1);

    let before = allocator.free_block_count();
    allocator.free(1);
    allocator.free(2);
    assert_eq!(allocator.free_block_count(), before);
}

#[test]
fn test_priority_admission_within_one_schedule_call() {
    let config = EngineConfig::new(3, 16, 8).unwrap();
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_request(NewRequest::new(1, 16, 4).with_priority(1)).unwrap();
    scheduler.add_request(NewRequest::new(2, 16, 4).with_priority(1)).unwrap();
    scheduler.schedule();
    assert_eq!(scheduler.allocator().free_block_count(), 1);

    // Two blocks needed, one free: a priority-1 request has to go
    scheduler.add_request(NewRequest::new(3, 32, 4).with_priority(0)).unwrap();
    let output = scheduler.schedule();

    assert!(output.admitted.contains(&3));
    assert_eq!(output.preempted.len(), 1);
    assert_eq!(scheduler.get_request(3).unwrap().state, RequestState::Running);
    assert_invariants(&scheduler);
}

#[test]
fn test_scenario_lru_victim_among_equal_priority() {
    // 4 blocks, one block per request
    let config = EngineConfig::new(4, 16, 8).unwrap();
    let mut scheduler = Scheduler::new(config).unwrap();

    for id in 1..=4 {
        scheduler.add_request(NewRequest::new(id, 16, 4).with_priority(1)).unwrap();
    }
    let output = scheduler.schedule();
    assert_eq!(output.admitted, vec![1, 2, 3, 4]);
    assert_eq!(scheduler.allocator().free_block_count(), 0);

    scheduler.touch(1).unwrap();

    scheduler.add_request(NewRequest::new(5, 16, 4).with_priority(0)).unwrap();
    let output = scheduler.schedule();

    assert_eq!(output.preempted, vec![2]);
    assert!(output.admitted.contains(&5));
    assert_eq!(scheduler.get_request(2).unwrap().state, RequestState::Preempted);
    assert_eq!(scheduler.get_request(5).unwrap().state, RequestState::Running);
    assert_eq!(scheduler.allocator().free_block_count(), 0);
    assert_invariants(&scheduler);
}

#[test]
fn test_long_running_request_survives_newer_equal_priority() {
    let config = EngineConfig::new(2, 16, 4).unwrap();
    let mut engine = Engine::new(config).unwrap();

    engine.add_request(NewRequest::new(1, 8, 10).with_priority(1)).unwrap();
    engine.step().unwrap();
    engine.step().unwrap();

    engine.add_request(NewRequest::new(2, 8, 10).with_priority(1)).unwrap();
    let step = engine.step().unwrap();
    assert_eq!(step.admitted, vec![2]);

    engine.add_request(NewRequest::new(3, 8, 2)).unwrap();
    let step = engine.step().unwrap();

    assert_eq!(step.preempted, vec![2]);
    assert_eq!(step.admitted, vec![3]);
    assert!(engine.scheduler().is_running(1));
    assert_invariants(engine.scheduler());
}

#[test]
fn test_scenario_oom_without_lower_priority_victims() {
    let config = EngineConfig::new(2, 16, 4).unwrap();
    let mut scheduler = Scheduler::new(config).unwrap();

    scheduler.add_request(NewRequest::new(1, 16, 3)).unwrap();
    scheduler.add_request(NewRequest::new(2, 16, 3)).unwrap();
    scheduler.add_request(NewRequest::new(3, 16, 3).with_priority(1)).unwrap();

    let output = scheduler.schedule();

    let batch: Vec<_> = output.batch.iter().map(|r| r.id).collect();
    assert_eq!(batch, vec![1, 2]);
    assert_eq!(output.stalled.map(|s| s.request_id), Some(3));
    assert!(output.preempted.is_empty());
    assert_eq!(scheduler.get_request(3).unwrap().state, RequestState::Waiting);
    assert_invariants(&scheduler);
}

#[test]
fn test_repeatedly_preempted_request_still_finishes() {
    let config = EngineConfig::new(2, 16, 2).unwrap();
    let mut engine = Engine::new(config).unwrap();

    engine.add_request(NewRequest::new(100, 16, 6).with_priority(5)).unwrap();
    engine.step().unwrap();

    // A finite stream of urgent requests, each forcing the background
    // request out once it is running again
    let mut steps = 1;
    for id in 0..4 {
        engine.add_request(NewRequest::new(id, 16, 2)).unwrap();
        while engine.scheduler().get_request(id).is_some() {
            engine.step().unwrap();
            assert_invariants(engine.scheduler());
            steps += 1;
        }
        while !engine.scheduler().is_running(100) {
            engine.step().unwrap();
            steps += 1;
        }
    }

    let summary = engine.run(100).unwrap();
    assert!(summary.completed);

    let background = summary.finished.iter().find(|r| r.id == 100).unwrap();
    assert_eq!(background.num_preemptions, 4);
    assert_eq!(background.generated_tokens, 6);

    let max_batch = engine.scheduler().config().max_batch_size as u64;
    let bound = (background.num_preemptions as u64 + 1) * max_batch * 6;
    assert!(steps as u64 + summary.iterations <= bound);
}

#[test]
fn test_preempted_request_not_starved_by_equal_priority_arrivals() {
    let config = EngineConfig::new(1, 16, 2).unwrap();
    let mut engine = Engine::new(config).unwrap();

    engine.add_request(NewRequest::new(1, 8, 3).with_priority(1)).unwrap();
    engine.step().unwrap();

    // Higher priority pushes request 1 out
    engine.add_request(NewRequest::new(2, 8, 1)).unwrap();
    let step = engine.step().unwrap();
    assert_eq!(step.preempted, vec![1]);

    // Same-priority newcomer arrives while 1 is preempted
    engine.add_request(NewRequest::new(3, 8, 1).with_priority(1)).unwrap();
    let step = engine.step().unwrap();

    assert_eq!(step.admitted, vec![1]);
    assert_eq!(engine.scheduler().waiting_ids(), vec![3]);
}
