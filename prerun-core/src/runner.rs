//! Precompiled Unit Runner
//!
//! The hosting engine for precompiled pages.  A request that has a
//! precompiled unit bound to it is routed here; the runner starts the unit
//! on first use (exactly once, however many threads race for it), counts the
//! engine entry against the nesting limit and services the request.
//!
//! # Request path:
//! - look up or create the unit's cache entry (identity-keyed)
//! - first caller builds the config, runs dependency processing, starts the unit
//! - service the request inside a usage scope

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RunnerOptions;
use crate::dispatch::{CounterHolder, ExternalContext, HostContext, PageOutput, UsageScope, UsageTracker};
use crate::engine::unit_cache::{CacheStats, UnitCache};
use crate::error::{classify, Result, RunnerError, TeardownFailure};
use crate::perf::{MetricsSnapshot, RunnerMetrics, ScopedTimer, TimerType};
use crate::unit::{Bindings, DependencyProcessor, ExecutableUnit, RenderUnit, UnitConfig, UnitWrapper};

/// Services the host makes available while a unit is being started.
#[derive(Clone, Default)]
pub struct HostServices {
    pub dependency_processor: Option<Arc<dyn DependencyProcessor>>,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency_processor(processor: Arc<dyn DependencyProcessor>) -> Self {
        Self {
            dependency_processor: Some(processor),
        }
    }
}

/// Hosting engine for precompiled units.
pub struct PrecompiledRunner {
    options: RunnerOptions,
    units: UnitCache<dyn ExecutableUnit, UnitWrapper>,
    holder: Arc<dyn CounterHolder>,
    metrics: Arc<RunnerMetrics>,
}

impl PrecompiledRunner {
    /// Create a runner that tracks usage with its own [`UsageTracker`].
    pub fn new(options: RunnerOptions) -> Self {
        Self::with_counter_holder(options, Arc::new(UsageTracker::new()))
    }

    /// Create a runner using the host's counter holder.
    pub fn with_counter_holder(options: RunnerOptions, holder: Arc<dyn CounterHolder>) -> Self {
        info!(
            development = options.development,
            max_nesting_depth = options.max_nesting_depth,
            tracked = holder.usage_counter().is_some(),
            "Creating PrecompiledRunner"
        );
        Self {
            options,
            units: UnitCache::new(),
            holder,
            metrics: RunnerMetrics::new(),
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn counter_holder(&self) -> &Arc<dyn CounterHolder> {
        &self.holder
    }

    /// Service a request if a precompiled unit is bound to it.
    ///
    /// Returns `Ok(false)` when there is no render unit or it is not
    /// precompiled, so the caller can fall back to its regular script path.
    pub fn call_precompiled(
        &self,
        render_unit: Option<&RenderUnit>,
        services: &HostServices,
        bindings: &mut Bindings,
    ) -> Result<bool> {
        let Some(render_unit) = render_unit else {
            return Ok(false);
        };
        if !render_unit.unit().is_precompiled() {
            debug!(path = render_unit.path(), "Bound unit is not precompiled");
            return Ok(false);
        }

        let wrapper = self
            .units
            .get_or_init(render_unit.unit(), || self.create_wrapper(render_unit, services))?
            .ok_or_else(|| RunnerError::Unavailable {
                path: render_unit.path().to_owned(),
            })?;

        let _scope = self.enter()?;
        let _timer = ScopedTimer::new(&self.metrics, TimerType::Service);
        wrapper.service(bindings)?;
        Ok(true)
    }

    /// Count one entry into the engine, enforcing the nesting limit.
    fn enter(&self) -> Result<Option<UsageScope<'_>>> {
        let Some(counter) = self.holder.usage_counter() else {
            return Ok(None);
        };
        let scope = UsageScope::enter(counter);
        let depth = scope.depth();
        if depth > self.options.max_nesting_depth {
            warn!(depth, limit = self.options.max_nesting_depth, "Nesting limit exceeded");
            return Err(RunnerError::NestingLimit {
                depth,
                limit: self.options.max_nesting_depth,
            });
        }
        Ok(Some(scope))
    }

    /// Initializer for a unit's cache entry. Runs under the entry lock.
    fn create_wrapper(&self, render_unit: &RenderUnit, services: &HostServices) -> Result<UnitWrapper> {
        let _timer = ScopedTimer::new(&self.metrics, TimerType::Initialization);
        let result = self.start_unit(render_unit, services);
        if result.is_err() {
            self.metrics.record_init_failure();
        }
        result
    }

    fn start_unit(&self, render_unit: &RenderUnit, services: &HostServices) -> Result<UnitWrapper> {
        let unit = render_unit.unit();
        let config = UnitConfig::new(render_unit.clone(), self.options.init_params.clone())
            .with_development(self.options.development);

        if let Some(processor) = &services.dependency_processor {
            processor
                .process_dependencies(unit.as_ref())
                .and_then(|()| processor.post_construct(unit.as_ref()))
                .map_err(|e| {
                    classify(e, |source| RunnerError::DependencyProcessing {
                        unit_type: unit.type_name().to_owned(),
                        source,
                    })
                })?;
        }

        let wrapper = UnitWrapper::new(config);
        unit.init(wrapper.config()).map_err(|e| {
            classify(e, |source| RunnerError::Initialization {
                unit: wrapper.name().to_owned(),
                source,
            })
        })?;

        info!(unit = wrapper.name(), path = wrapper.path(), "Precompiled unit ready");
        Ok(wrapper)
    }

    /// Wrap a foreign host context so delegations through it keep this
    /// runner's usage count consistent.
    pub fn external_context<C: HostContext>(
        &self,
        inner: C,
        page_out: Arc<dyn PageOutput>,
    ) -> ExternalContext<C> {
        ExternalContext::new(inner, Arc::clone(&self.holder), page_out)
    }

    /// Display names of every unit that is ready.
    pub fn ready_units(&self) -> Vec<String> {
        self.units
            .ready_units()
            .iter()
            .map(|w| w.name().to_owned())
            .collect()
    }

    /// Destroy every started unit and empty the cache.
    ///
    /// Outstanding requests must be quiesced first; a request still running
    /// against a destroyed unit gets [`RunnerError::Destroyed`] on its next
    /// call at best.
    pub fn cleanup(&self) -> Result<usize> {
        let destroyed = self.units.remove_and_destroy_all(|wrapper| {
            self.metrics.record_destroy();
            wrapper
                .destroy()
                .map_err(|e| TeardownFailure::new(wrapper.name(), e))
        })?;
        info!(destroyed, "PrecompiledRunner cleaned up");
        Ok(destroyed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.units.cache_stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for PrecompiledRunner {
    fn default() -> Self {
        Self::new(RunnerOptions::default())
    }
}
