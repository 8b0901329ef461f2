//! Executable units and their invocation-ready wrappers
//!
//! An [`ExecutableUnit`] is a compiled page handler supplied by an external
//! compiler.  The runner never creates or frees units; it pairs each one with
//! a [`UnitWrapper`] holding the configuration the unit was started with.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::dispatch::BufferedOutput;
use crate::error::{Result, RunnerError};

/// A compiled page handler.
///
/// Identity is the instance: two units are the same only if they are the
/// same allocation.
pub trait ExecutableUnit: Send + Sync + 'static {
    /// Module path the compiler placed the unit in, possibly escaped.
    fn module_path(&self) -> &str;

    /// Type name of the unit, possibly escaped.
    fn type_name(&self) -> &str;

    /// Whether this unit is a precompiled page the runner can host.
    fn is_precompiled(&self) -> bool {
        true
    }

    /// Startup hook, called once before the first request.
    ///
    /// Return a [`MissingCapability`](crate::error::MissingCapability) error
    /// when the deployment lacks an optional feature the unit needs.
    fn init(&self, config: &UnitConfig) -> anyhow::Result<()>;

    /// Handle one request.
    fn service(&self, bindings: &mut Bindings) -> anyhow::Result<()>;

    /// Shutdown hook.
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Injection step run on a unit before its startup hook.
pub trait DependencyProcessor: Send + Sync {
    fn process_dependencies(&self, unit: &dyn ExecutableUnit) -> anyhow::Result<()>;

    fn post_construct(&self, unit: &dyn ExecutableUnit) -> anyhow::Result<()>;
}

/// The deployment unit (bundle) a compiled unit was shipped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentUnit {
    pub symbolic_name: String,
}

impl DeploymentUnit {
    pub fn new(symbolic_name: impl Into<String>) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
        }
    }
}

/// A unit bound to the request, together with where it came from.
#[derive(Clone)]
pub struct RenderUnit {
    path: String,
    deployment: DeploymentUnit,
    unit: Arc<dyn ExecutableUnit>,
}

impl RenderUnit {
    pub fn new(
        path: impl Into<String>,
        deployment: DeploymentUnit,
        unit: Arc<dyn ExecutableUnit>,
    ) -> Self {
        Self {
            path: path.into(),
            deployment,
            unit,
        }
    }

    /// Script path the unit was compiled from.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn deployment(&self) -> &DeploymentUnit {
        &self.deployment
    }

    pub fn unit(&self) -> &Arc<dyn ExecutableUnit> {
        &self.unit
    }
}

impl fmt::Debug for RenderUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderUnit")
            .field("path", &self.path)
            .field("deployment", &self.deployment)
            .field("unit", &self.unit.type_name())
            .finish()
    }
}

/// Per-request values handed to [`ExecutableUnit::service`].
#[derive(Debug, Default)]
pub struct Bindings {
    values: HashMap<String, String>,
    out: Arc<BufferedOutput>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(out: Arc<BufferedOutput>) -> Self {
        Self {
            values: HashMap::new(),
            out,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// The page writer.
    pub fn out(&self) -> &Arc<BufferedOutput> {
        &self.out
    }
}

/// Startup configuration handed to [`ExecutableUnit::init`].
pub struct UnitConfig {
    render_unit: RenderUnit,
    init_params: BTreeMap<String, String>,
    development: bool,
    unit_name: OnceLock<String>,
}

impl UnitConfig {
    pub fn new(render_unit: RenderUnit, init_params: BTreeMap<String, String>) -> Self {
        Self {
            render_unit,
            init_params,
            development: false,
            unit_name: OnceLock::new(),
        }
    }

    /// Mark the unit as started in development mode.
    pub fn with_development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }

    /// Whether the runner was started in development mode.
    pub fn is_development(&self) -> bool {
        self.development
    }

    /// Display name: `"<deployment>: <module path>/<type name>"`, unescaped.
    ///
    /// Computed on first use and cached.
    pub fn unit_name(&self) -> &str {
        self.unit_name.get_or_init(|| {
            let unit = self.render_unit.unit();
            format!(
                "{}: {}/{}",
                self.render_unit.deployment().symbolic_name,
                unescape_identifier(unit.module_path()),
                unescape_identifier(unit.type_name())
            )
        })
    }

    pub fn init_param(&self, name: &str) -> Option<&str> {
        self.init_params.get(name).map(String::as_str)
    }

    pub fn init_params(&self) -> &BTreeMap<String, String> {
        &self.init_params
    }

    pub fn render_unit(&self) -> &RenderUnit {
        &self.render_unit
    }
}

/// Undo the compiler's identifier escaping: every `__XXXX__` (four hex
/// digits) becomes the character with that code point.
pub fn unescape_identifier(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(start) = rest.find("__") {
        let tail = &rest[start + 2..];
        match decode_escape(tail) {
            Some(ch) => {
                out.push_str(&rest[..start]);
                out.push(ch);
                rest = &tail[6..];
            }
            None => {
                out.push_str(&rest[..start + 1]);
                rest = &rest[start + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_escape(tail: &str) -> Option<char> {
    let hex = tail.get(..4)?;
    if tail.get(4..6)? != "__" || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

/// Invocation-ready state of a started unit.
pub struct UnitWrapper {
    config: UnitConfig,
    destroyed: AtomicBool,
}

impl UnitWrapper {
    pub fn new(config: UnitConfig) -> Self {
        debug!(
            path = config.render_unit().path(),
            development = config.is_development(),
            "Creating UnitWrapper"
        );
        Self {
            config,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.unit_name()
    }

    pub fn path(&self) -> &str {
        self.config.render_unit().path()
    }

    pub fn unit(&self) -> &Arc<dyn ExecutableUnit> {
        self.config.render_unit().unit()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Run the unit for one request.
    pub fn service(&self, bindings: &mut Bindings) -> Result<()> {
        if self.is_destroyed() {
            return Err(RunnerError::Destroyed {
                unit: self.name().to_owned(),
            });
        }
        self.unit()
            .service(bindings)
            .map_err(|e| RunnerError::Service {
                unit: self.name().to_owned(),
                source: e.into(),
            })
    }

    /// Call the unit's shutdown hook. Later calls do nothing.
    pub fn destroy(&self) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(unit = self.name(), "Destroying unit");
        self.unit().destroy()
    }
}

impl fmt::Debug for UnitWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitWrapper")
            .field("name", &self.name())
            .field("development", &self.config.is_development())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
