//! Performance benchmarks for Prerun Core.
//!
//! These tests measure timing for the hot paths and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p prerun-core --test benchmarks -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Instant;

use prerun_core::{
    Bindings, BufferedOutput, DeploymentUnit, DispatchError, ExecutableUnit, HostServices,
    PrecompiledRunner, RenderUnit, RequestDispatcher, RunnerOptions, TrackingDispatcher,
    UnitCache, UnitConfig, UsageCounter, UsageTracker,
};

struct NoopPage;

impl ExecutableUnit for NoopPage {
    fn module_path(&self) -> &str {
        "apps.bench"
    }

    fn type_name(&self) -> &str {
        "noop"
    }

    fn init(&self, _config: &UnitConfig) -> anyhow::Result<()> {
        Ok(())
    }

    fn service(&self, _bindings: &mut Bindings) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit cache benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_unit_cache_hits() {
    const UNITS: usize = 50;
    const LOOKUPS: usize = 100_000;
    let cache = UnitCache::<NoopPage, usize>::new();
    let units: Vec<_> = (0..UNITS).map(|_| Arc::new(NoopPage)).collect();

    for (i, unit) in units.iter().enumerate() {
        cache.get_or_init(unit, || Ok(i)).unwrap();
    }

    let start = Instant::now();
    for i in 0..LOOKUPS {
        cache
            .get_or_init(&units[i % UNITS], || panic!("should not be called on hit"))
            .unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / LOOKUPS as u32;

    let stats = cache.cache_stats();
    eprintln!("[bench_unit_cache_hits] {LOOKUPS} lookups in {elapsed:?} ({per_iter:?}/iter)");
    eprintln!(
        "  hits={}, misses={}, cached={}",
        stats.hits, stats.misses, stats.cached_count
    );
    assert_eq!(stats.hits, LOOKUPS);
    assert!(
        elapsed.as_millis() < 1000,
        "100 000 cache hits should finish in < 1 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Runner request path benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_runner_service() {
    const ITERATIONS: usize = 10_000;
    let runner = PrecompiledRunner::new(RunnerOptions::default());
    let render = RenderUnit::new("/apps/bench/noop", DeploymentUnit::new("bench"), Arc::new(NoopPage));

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        runner
            .call_precompiled(Some(&render), &HostServices::new(), &mut Bindings::new())
            .unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_runner_service] {ITERATIONS} requests in {elapsed:?} ({per_iter:?}/iter)");
    runner.metrics().print_report();
    assert!(
        elapsed.as_millis() < 2000,
        "10 000 requests should finish in < 2 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Tracked dispatch benchmark
// ---------------------------------------------------------------------------

struct Noop;

impl RequestDispatcher<(), ()> for Noop {
    fn forward(&self, _: &mut (), _: &mut ()) -> Result<(), DispatchError> {
        Ok(())
    }

    fn include(&self, _: &mut (), _: &mut ()) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[test]
#[ignore]
fn bench_tracked_include() {
    const ITERATIONS: usize = 100_000;
    let tracker = Arc::new(UsageTracker::new());
    let dispatcher = TrackingDispatcher::new(
        Box::new(Noop),
        tracker.clone(),
        Arc::new(BufferedOutput::new()),
    );
    tracker.set_value(4);

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        dispatcher.include(&mut (), &mut ()).unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_tracked_include] {ITERATIONS} includes in {elapsed:?} ({per_iter:?}/iter)");
    assert_eq!(tracker.current_value(), 4);
    assert!(
        elapsed.as_millis() < 1000,
        "100 000 tracked includes should finish in < 1 s, got {elapsed:?}"
    );
}
