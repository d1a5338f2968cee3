use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nodevec::persist::write_generation_file;
use nodevec::{
    BuildExecutor, CycleOutcome, Engine, EngineConfig, EntityId, Error, ExternalBuild, IdFilter,
    IndexBuilder, IndexParams, MemorySink, Metric, NoopSink, Promotion, QueryRequest,
};
use nodevec_core::CancelToken;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn config(dir: &std::path::Path, dim: usize) -> EngineConfig {
    let mut config = EngineConfig::from_data_dir(dir.to_path_buf(), dim);
    config.index.partitions = 4;
    config.index.nprobe = 1;
    config.query_threads = 2;
    config.build_threads = 2;
    config.low_priority_builds = false;
    config.refresh.poll_interval_ms = 5;
    config.refresh.backoff_base_ms = 1;
    config.refresh.backoff_max_ms = 10;
    config
}

fn open(dir: &std::path::Path, dim: usize) -> Engine {
    Engine::open_with_sink(config(dir, dim), Arc::new(NoopSink)).unwrap()
}

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_small_store_scenario() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);
    engine.ingest(EntityId(1), &[0.0, 0.0, 0.0, 0.0]).unwrap();
    engine.ingest(EntityId(2), &[1.0, 0.0, 0.0, 0.0]).unwrap();
    engine.ingest(EntityId(3), &[0.0, 1.0, 0.0, 0.0]).unwrap();
    assert!(matches!(engine.refresh_now(), CycleOutcome::Promoted { .. }));

    let result = engine
        .search(&QueryRequest::new(vec![0.9, 0.0, 0.0, 0.0], 2))
        .unwrap();
    assert_eq!(result.ids(), vec![EntityId(2), EntityId(1)]);
    assert!((result.hits[0].distance - 0.01).abs() < 1e-5);
    assert!((result.hits[1].distance - 0.81).abs() < 1e-5);

    let err = engine
        .search(&QueryRequest::new(vec![0.9, 0.0, 0.0, 0.0], 0))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidK(0)));
}

#[test]
fn test_search_before_first_build() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);
    engine.ingest(EntityId(1), &[0.0; 4]).unwrap();
    let err = engine.search(&QueryRequest::new(vec![0.0; 4], 1)).unwrap_err();
    assert!(matches!(err, Error::NoIndexAvailable));
}

#[test]
fn test_empty_snapshot_leaves_active_generation() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 2);
    engine.ingest(EntityId(7), &[1.0, 1.0]).unwrap();
    let CycleOutcome::Promoted { generation_id } = engine.refresh_now() else {
        panic!("first build should promote");
    };

    engine.tombstone(EntityId(7));
    assert_eq!(
        engine.refresh_now(),
        CycleOutcome::Failed {
            kind: "empty_snapshot",
            attempts: 1
        }
    );
    assert_eq!(engine.manager().current().unwrap().id(), generation_id);
    let result = engine.search(&QueryRequest::new(vec![1.0, 1.0], 1)).unwrap();
    assert_eq!(result.ids(), vec![EntityId(7)]);
}

#[test]
fn test_queries_see_exactly_one_generation_during_promotions() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(open(dir.path(), 8));
    let mut rng = StdRng::seed_from_u64(7);

    // Even rounds hold ids [0, 50), odd rounds hold [1000, 1050)
    fn load_round(engine: &Engine, round: u64, rng: &mut StdRng) {
        let base = if round % 2 == 0 { 0 } else { 1000 };
        let old = if round % 2 == 0 { 1000 } else { 0 };
        for i in 0..50 {
            engine.tombstone(EntityId(old + i));
            engine.ingest(EntityId(base + i), &random_vector(8, rng)).unwrap();
        }
    }
    load_round(&engine, 0, &mut rng);
    engine.refresh_now();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|seed| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + seed);
                let mut served = 0usize;
                while !stop.load(Ordering::Acquire) {
                    let query = QueryRequest::new(random_vector(8, &mut rng), 20);
                    let result = engine.search(&query).unwrap();
                    let low = result.hits.iter().filter(|h| h.entity_id.0 < 1000).count();
                    assert!(
                        low == 0 || low == result.hits.len(),
                        "result mixes two generations"
                    );
                    assert_eq!(result.hits.len(), 20);
                    served += 1;
                }
                served
            })
        })
        .collect();

    for round in 1..6 {
        load_round(&engine, round, &mut rng);
        assert!(matches!(engine.refresh_now(), CycleOutcome::Promoted { .. }));
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[test]
fn test_reload_serves_without_rebuilding() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let queries: Vec<Vec<f32>> = (0..10).map(|_| random_vector(16, &mut rng)).collect();

    let (generation_id, before) = {
        let engine = open(dir.path(), 16);
        for id in 0..300 {
            engine.ingest(EntityId(id), &random_vector(16, &mut rng)).unwrap();
        }
        engine.refresh_now();
        engine.ingest(EntityId(5000), &random_vector(16, &mut rng)).unwrap();
        let results: Vec<_> = queries
            .iter()
            .map(|q| engine.search(&QueryRequest::new(q.clone(), 5)).unwrap().hits)
            .collect();
        let id = engine.manager().current().unwrap().id();
        engine.shutdown().unwrap();
        (id, results)
    };

    let engine = open(dir.path(), 16);
    let stats = engine.stats();
    assert_eq!(stats.write_counter, 301);
    assert_eq!(stats.live_entities, 301);
    assert_eq!(stats.active.as_ref().unwrap().generation_id, generation_id);
    assert_eq!(stats.counters.builds_total, 0);
    let restored_snapshot = stats.active.as_ref().unwrap().snapshot_id;
    assert!(engine.store().snapshot().id() > restored_snapshot);

    for (q, expected) in queries.iter().zip(&before) {
        let hits = engine.search(&QueryRequest::new(q.clone(), 5)).unwrap().hits;
        assert_eq!(&hits, expected);
    }

    // Next build gets a fresh id
    let CycleOutcome::Promoted { generation_id: next } = engine.refresh_now() else {
        panic!("rebuild should promote");
    };
    assert!(next > generation_id);
    assert!(engine.manager().current().unwrap().snapshot_id() > restored_snapshot);
}

#[test]
fn test_reopen_with_other_dimension_is_fatal() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 4);
        engine.ingest(EntityId(1), &[0.0; 4]).unwrap();
        engine.shutdown().unwrap();
    }
    let err = Engine::open_with_sink(config(dir.path(), 3), Arc::new(NoopSink))
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("imension"));
}

#[test]
fn test_torn_log_tail_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 4);
        engine.ingest(EntityId(1), &[1.0; 4]).unwrap();
        engine.ingest(EntityId(2), &[2.0; 4]).unwrap();
        engine.checkpoint().unwrap();
    }

    // Simulate a crash halfway through appending a third put
    let log = dir.path().join("records.log");
    let mut bytes = std::fs::read(&log).unwrap();
    bytes.push(1);
    bytes.extend_from_slice(&3u64.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 5]);
    std::fs::write(&log, bytes).unwrap();

    let engine = open(dir.path(), 4);
    assert_eq!(engine.store().write_counter(), 2);
    assert_eq!(engine.store().live_count(), 2);
}

#[test]
fn test_epochs_are_stamped_on_records() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 2);
    engine.ingest(EntityId(1), &[1.0, 0.0]).unwrap();
    assert_eq!(engine.begin_epoch(), 1);
    engine.ingest(EntityId(2), &[0.0, 1.0]).unwrap();
    engine.ingest(EntityId(1), &[0.5, 0.5]).unwrap();

    let snapshot = engine.store().snapshot();
    assert_eq!(snapshot.get(EntityId(1)).unwrap().epoch, 1);
    assert_eq!(snapshot.get(EntityId(2)).unwrap().epoch, 1);
    assert_eq!(&*snapshot.get(EntityId(1)).unwrap().vector, &[0.5, 0.5]);
}

#[test]
fn test_filters_and_metric_override_end_to_end() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 2);
    engine.ingest(EntityId(1), &[1.0, 0.0]).unwrap();
    engine.ingest(EntityId(2), &[0.0, 1.0]).unwrap();
    engine.ingest(EntityId(3), &[5.0, 0.1]).unwrap();
    engine.refresh_now();

    let query = vec![1.0, 0.0];
    let deny = engine
        .search(&QueryRequest::new(query.clone(), 1).with_filter(IdFilter::deny([EntityId(1)])))
        .unwrap();
    assert_eq!(deny.ids(), vec![EntityId(2)]);

    let cosine = engine
        .search(&QueryRequest::new(query.clone(), 3).with_metric(Metric::Cosine))
        .unwrap();
    assert_eq!(cosine.ids(), vec![EntityId(1), EntityId(3), EntityId(2)]);

    let allow_none = engine
        .search(&QueryRequest::new(query, 3).with_filter(IdFilter::allow([])))
        .unwrap();
    assert!(allow_none.hits.is_empty());
}

#[test]
fn test_external_artifact_promotion() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);
    let mut rng = StdRng::seed_from_u64(3);
    for id in 0..40 {
        engine.ingest(EntityId(id), &random_vector(4, &mut rng)).unwrap();
    }
    engine.refresh_now();
    for id in 40..60 {
        engine.ingest(EntityId(id), &random_vector(4, &mut rng)).unwrap();
    }

    // An out-of-process job builds from a fresher snapshot
    let snapshot = engine.store().snapshot();
    let job = IndexBuilder::new(
        IndexParams {
            partitions: 4,
            ..IndexParams::default()
        },
        Arc::new(MemorySink::new()),
    );
    job.reserve_after(100);
    let generation = job.build(&snapshot, &CancelToken::new()).unwrap();
    let artifact = dir.path().join("job-output.nvx");
    write_generation_file(&artifact, &generation).unwrap();

    let err = engine
        .submit_external(ExternalBuild::Completed {
            artifact: artifact.clone(),
            snapshot_id: snapshot.id() + 1,
        })
        .unwrap_err();
    assert!(err.to_string().contains("snapshot"));

    let promotion = engine
        .submit_external(ExternalBuild::Completed {
            artifact,
            snapshot_id: snapshot.id(),
        })
        .unwrap();
    assert!(matches!(
        promotion,
        Some(Promotion::Promoted {
            generation_id: 101,
            ..
        })
    ));
    assert_eq!(engine.stats().active.unwrap().entity_count, 60);
    assert_eq!(
        engine.controller().state(),
        nodevec::ControllerState::Idle
    );
}

#[test]
fn test_foreign_artifact_cannot_claim_a_future_counter() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);
    engine.ingest(EntityId(1), &[1.0, 0.0, 0.0, 0.0]).unwrap();
    assert!(matches!(engine.refresh_now(), CycleOutcome::Promoted { .. }));

    // A store this engine never saw reaches write counter 1000
    let foreign = nodevec_core::VectorStore::new(4).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for id in 0..1000 {
        foreign
            .append(EntityId(id % 10), &random_vector(4, &mut rng))
            .unwrap();
    }
    let snapshot = foreign.snapshot();
    assert_eq!(snapshot.write_counter(), 1000);
    let job = IndexBuilder::new(
        IndexParams {
            partitions: 2,
            ..IndexParams::default()
        },
        Arc::new(MemorySink::new()),
    );
    job.reserve_after(50);
    let generation = job.build(&snapshot, &CancelToken::new()).unwrap();
    let artifact = dir.path().join("foreign.nvx");
    write_generation_file(&artifact, &generation).unwrap();

    let err = engine
        .submit_external(ExternalBuild::Completed {
            artifact,
            snapshot_id: snapshot.id(),
        })
        .unwrap_err();
    assert!(err.to_string().contains("snapshot"), "{err:#}");
    assert_eq!(engine.stats().active.unwrap().entity_count, 1);

    // Later builds of the real store still promote
    for id in 100..200u64 {
        engine
            .ingest(EntityId(id), &[0.0, id as f32, 0.0, 0.0])
            .unwrap();
    }
    assert!(matches!(engine.refresh_now(), CycleOutcome::Promoted { .. }));
    let result = engine
        .search(&QueryRequest::new(vec![0.0, 150.0, 0.0, 0.0], 1).with_nprobe(4))
        .unwrap();
    assert_eq!(result.ids(), vec![EntityId(150)]);
}

#[test]
fn test_log_stays_bounded_across_refreshes() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);
    let mut rng = StdRng::seed_from_u64(21);
    for _round in 0..8 {
        engine.begin_epoch();
        for id in 0..600 {
            engine.ingest(EntityId(id), &random_vector(4, &mut rng)).unwrap();
        }
        assert!(matches!(engine.refresh_now(), CycleOutcome::Promoted { .. }));
        assert!(
            engine.store().log_len() <= 600 + 2 * nodevec_core::store::SEGMENT_LEN,
            "log_len {}",
            engine.store().log_len()
        );
    }
    assert!(engine.stats().counters.compaction_total > 0);
    assert_eq!(engine.store().write_counter(), 4800);
    drop(engine);

    let reopened = open(dir.path(), 4);
    assert_eq!(reopened.store().write_counter(), 4800);
    assert_eq!(reopened.store().live_count(), 600);
}

#[test]
fn test_background_refresh_follows_writes() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), 4);
    cfg.refresh.max_pending_writes = Some(10);
    cfg.refresh.max_age_ms = None;
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::open_with_sink(cfg, sink.clone()).unwrap();
    engine.start().unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    engine.ingest(EntityId(0), &random_vector(4, &mut rng)).unwrap();
    wait_until("initial generation", || engine.manager().has_active());

    for id in 1..=10 {
        engine.ingest(EntityId(id), &random_vector(4, &mut rng)).unwrap();
    }
    wait_until("threshold rebuild", || {
        engine
            .manager()
            .current()
            .map(|g| g.entity_count() == 11)
            .unwrap_or(false)
    });
    assert!(sink.count(nodevec::metrics::BUILD_DURATION_MS) >= 2);

    // Retired generations are reclaimed and their files removed
    wait_until("reclaim", || {
        let files: HashSet<_> = std::fs::read_dir(dir.path().join("generations"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        files.len() == 1
    });
    engine.shutdown().unwrap();
}
