use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use kiln_core::{CompileOutput, Compiler, GroupId, Job, JobId, WorkerTypeKey};

use crate::config::SchedulerConfig;
use crate::shared::Shared;
use crate::transport::fake::{FakeBehavior, FakeFactory};

use super::execution::next_batch;
use super::{Backend, DispatchThread};

fn config(slots: usize, dir: &Path) -> SchedulerConfig {
    SchedulerConfig {
        num_worker_threads: slots,
        max_batch_size: 10,
        working_directory: dir.to_path_buf(),
        ..SchedulerConfig::default()
    }
}

fn jobs(groups: u64, per_group: usize) -> Vec<Job> {
    (0..groups)
        .flat_map(|g| {
            (0..per_group).map(move |i| {
                Job::new(GroupId(g), "vs", json!({"source": format!("group {g} job {i}")}))
            })
        })
        .collect()
}

fn dispatcher(config: SchedulerConfig, factory: &FakeFactory) -> DispatchThread {
    DispatchThread::new(
        Arc::new(Shared::default()),
        config,
        Backend::Workers(Arc::new(factory.clone())),
    )
}

/// Run dispatch passes on the test thread until nothing is outstanding.
fn drive(d: &mut DispatchThread) {
    for _ in 0..2000 {
        if d.commit_and_pull().is_some() {
            panic!("worker mode never returns a direct batch");
        }
        d.service_slots();
        if d.shared.lock_relaxed().num_outstanding_jobs == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("dispatch did not finish");
}

fn finished_jobs(d: &DispatchThread) -> Vec<Job> {
    let mut state = d.shared.lock_relaxed();
    state
        .take_pending(|_| true)
        .into_iter()
        .flat_map(|agg| agg.into_results().jobs)
        .collect()
}

#[test]
fn fifty_jobs_go_out_as_five_full_batches() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let mut d = dispatcher(config(2, dir.path()), &factory);
    d.shared.lock().unwrap().enqueue(jobs(5, 10), false);

    drive(&mut d);

    let batches = factory.batches();
    assert_eq!(batches.len(), 5);
    assert!(batches.iter().all(|b| b.inputs.len() == 10));
    assert!(batches.iter().any(|b| b.slot == 0));
    assert!(batches.iter().any(|b| b.slot == 1));

    let state = d.shared.lock_relaxed();
    assert_eq!(state.pending_finalize.len(), 5);
    assert!(state.groups.is_empty());
    assert!(state.queue.is_empty());
    assert!(state
        .pending_finalize
        .iter()
        .all(|agg| agg.is_complete() && agg.queued_count() == 0));
    drop(state);

    let m = d.shared.metrics_snapshot();
    assert_eq!(m.batches_sent, 5);
    assert_eq!(m.jobs_completed, 50);
    assert_eq!(m.largest_batch, 10);
    assert_eq!(m.worker_launches, 2);
}

#[test]
fn batches_never_exceed_max_size() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let mut cfg = config(3, dir.path());
    cfg.max_batch_size = 4;
    let mut d = dispatcher(cfg, &factory);
    d.shared.lock().unwrap().enqueue(jobs(3, 9), false);

    drive(&mut d);

    let batches = factory.batches();
    assert!(batches.iter().all(|b| b.inputs.len() <= 4));
    let total: usize = batches.iter().map(|b| b.inputs.len()).sum();
    assert_eq!(total, 27);
}

#[test]
fn hung_batch_is_requeued_with_same_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::with_plan([FakeBehavior::Hang]);
    let mut cfg = config(1, dir.path());
    cfg.worker_liveness_timeout_ms = 20;
    let mut d = dispatcher(cfg, &factory);

    let submitted = jobs(1, 3);
    let ids: Vec<JobId> = submitted.iter().map(Job::id).collect();
    d.shared.lock().unwrap().enqueue(submitted, false);

    drive(&mut d);

    let batches = factory.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].inputs, batches[1].inputs);
    assert_eq!(factory.kills(), 1);
    assert_eq!(factory.launches(), 2);

    let done = finished_jobs(&d);
    let mut done_ids: Vec<JobId> = done.iter().map(Job::id).collect();
    done_ids.sort();
    assert_eq!(done_ids, ids);
    assert!(done.iter().all(|j| j.succeeded() && j.is_finalized() && j.attempts() == 2));

    let m = d.shared.metrics_snapshot();
    assert_eq!(m.lost_batches, 1);
    assert_eq!(m.requeued_jobs, 3);
}

#[test]
fn requeued_jobs_go_to_the_front() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::with_plan([FakeBehavior::Exit]);
    let mut cfg = config(1, dir.path());
    cfg.max_batch_size = 2;
    let mut d = dispatcher(cfg, &factory);
    d.shared.lock().unwrap().enqueue(jobs(1, 4), false);

    drive(&mut d);

    let batches = factory.batches();
    // Lost first batch, its retry, then the remaining two jobs.
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].inputs, batches[1].inputs);
    assert_ne!(batches[1].inputs, batches[2].inputs);
}

#[test]
fn job_lost_too_often_fails_instead_of_looping() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::with_plan([FakeBehavior::Exit, FakeBehavior::Exit]);
    let mut cfg = config(1, dir.path());
    cfg.max_job_attempts = 2;
    let mut d = dispatcher(cfg, &factory);
    d.shared.lock().unwrap().enqueue(jobs(1, 1), false);

    drive(&mut d);

    let done = finished_jobs(&d);
    assert_eq!(done.len(), 1);
    assert!(!done[0].succeeded());
    assert!(done[0].errors()[0].contains("lost this job 2 times"));
    assert_eq!(d.shared.metrics_snapshot().jobs_exhausted, 1);
}

#[test]
fn twice_lost_batch_is_split_into_single_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::crashing_on("group 0 job 2");
    let mut d = dispatcher(config(1, dir.path()), &factory);
    d.shared.lock().unwrap().enqueue(jobs(1, 5), false);

    drive(&mut d);

    let batches = factory.batches();
    assert_eq!(batches[0].inputs.len(), 5);
    assert_eq!(batches[0].inputs, batches[1].inputs);
    assert!(batches[2..].iter().all(|b| b.inputs.len() == 1));

    let done = finished_jobs(&d);
    assert_eq!(done.len(), 5);
    let failed: Vec<&Job> = done.iter().filter(|j| !j.succeeded()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].input()["source"], "group 0 job 2");
    assert!(done.iter().all(|j| j.attempts() <= 4));
}

#[test]
fn isolated_job_leaves_its_neighbours_batched() {
    let mut queue: VecDeque<Job> = jobs(1, 6).into();
    queue[2].note_lost();
    queue[2].note_lost();

    let first = next_batch(&mut queue, 10);
    assert_eq!(first.len(), 2);
    let second = next_batch(&mut queue, 10);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].times_lost(), 2);
    let third = next_batch(&mut queue, 10);
    assert_eq!(third.len(), 3);
    assert!(queue.is_empty());
}

#[test]
fn interactive_mode_limits_active_slots() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::with_plan(vec![FakeBehavior::Hang; 4]);
    let mut cfg = config(4, dir.path());
    cfg.num_worker_threads_during_interactive = 1;
    let mut d = dispatcher(cfg, &factory);
    d.shared.interactive.store(true, std::sync::atomic::Ordering::Relaxed);
    d.shared.lock().unwrap().enqueue(jobs(4, 10), false);

    d.commit_and_pull();
    d.service_slots();

    let batches = factory.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].slot, 0);
    assert_eq!(d.shared.lock_relaxed().queue.len(), 30);
}

#[test]
fn oldest_idle_slot_is_fed_first() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::with_plan([FakeBehavior::Exit]);
    let mut d = dispatcher(config(2, dir.path()), &factory);

    // Slot 0 loses a batch, which refreshes its activity timestamp.
    d.shared.lock().unwrap().enqueue(jobs(1, 1), false);
    d.commit_and_pull();
    d.service_slots();
    assert_eq!(factory.batches()[0].slot, 0);

    // The requeued job now lands on slot 1, idle for longer.
    d.commit_and_pull();
    d.service_slots();
    assert_eq!(factory.batches()[1].slot, 1);
}

struct Flaky;

impl Compiler for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn compile(&self, _worker_type: &WorkerTypeKey, input: &Value) -> CompileOutput {
        if input["panic"].as_bool() == Some(true) {
            panic!("exploded");
        }
        CompileOutput::success(json!({"echo": input.clone()}))
    }
}

#[test]
fn direct_mode_compiles_in_thread_and_contains_panics() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(1, dir.path());
    cfg.allow_out_of_process_workers = false;
    let mut d = DispatchThread::new(Arc::new(Shared::default()), cfg, Backend::Direct(Arc::new(Flaky)));

    let ok = Job::new(GroupId(1), "cs", json!({"n": 1}));
    let bad = Job::new(GroupId(1), "cs", json!({"panic": true}));
    let bad_id = bad.id();
    d.shared.lock().unwrap().enqueue(vec![ok, bad], false);

    let batch = d.commit_and_pull().expect("direct mode pulls a batch");
    assert_eq!(batch.len(), 2);
    d.compile_direct(batch);
    assert!(d.commit_and_pull().is_none());

    let done = finished_jobs(&d);
    assert_eq!(done.len(), 2);
    for job in &done {
        if job.id() == bad_id {
            assert!(!job.succeeded());
            assert!(job.errors()[0].contains("exploded"));
        } else {
            assert!(job.succeeded());
        }
    }
    assert_eq!(d.shared.lock_relaxed().num_outstanding_jobs, 0);
}

#[test]
fn spawned_thread_stops_on_shutdown_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let shared = Arc::new(Shared::default());
    let factory = FakeFactory::default();
    let handle = DispatchThread::spawn(
        Arc::clone(&shared),
        config(1, dir.path()),
        Backend::Workers(Arc::new(factory.clone())),
    )
    .unwrap();

    shared.lock().unwrap().enqueue(jobs(1, 3), false);
    shared.work_available.notify_all();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while shared.lock_relaxed().num_outstanding_jobs > 0 {
        assert!(std::time::Instant::now() < deadline, "jobs never finished");
        std::thread::sleep(Duration::from_millis(2));
    }

    shared.shutdown.store(true, std::sync::atomic::Ordering::Release);
    shared.work_available.notify_all();
    handle.join().unwrap();

    assert!(shared.lock().is_ok());
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}
