//! Prerun - Precompiled Page Runner
//!
//! Demonstration host: serves one precompiled page from many worker threads
//! at once, includes a second page through a tracked foreign context, then
//! tears everything down and prints the runner's metrics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use prerun_core::{
    init, Bindings, BufferedOutput, DeploymentUnit, DispatchError, ExecutableUnit, HostContext,
    HostServices, PageOutput, PrecompiledRunner, RenderUnit, RequestDispatcher, RunnerOptions,
    UnitConfig,
};
use tracing::info;

const WORKERS: usize = 8;

fn print_help() {
    println!("prerun - Precompiled Page Runner v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  prerun [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>  Load runner options from a JSON file");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  PRERUN_DEVELOPMENT        Enable development mode (1/true/yes/on)");
    println!("  PRERUN_MAX_NESTING_DEPTH  Deepest engine re-entry allowed");
    println!("  RUST_LOG                  Log filter (default: info)");
}

/// A page that greets whoever the request names.
struct DemoPage {
    type_name: &'static str,
}

impl ExecutableUnit for DemoPage {
    fn module_path(&self) -> &str {
        "apps.demo"
    }

    fn type_name(&self) -> &str {
        self.type_name
    }

    fn init(&self, config: &UnitConfig) -> Result<()> {
        info!(unit = config.unit_name(), "DemoPage starting");
        Ok(())
    }

    fn service(&self, bindings: &mut Bindings) -> Result<()> {
        let request = bindings.get("request").unwrap_or("-").to_owned();
        bindings
            .out()
            .write(&format!("<p>{} served request {request}</p>", self.type_name));
        Ok(())
    }
}

/// Foreign context exposing a single included fragment.
struct DemoHost {
    runner: Arc<PrecompiledRunner>,
    fragment: RenderUnit,
}

struct FragmentDispatcher {
    runner: Arc<PrecompiledRunner>,
    fragment: RenderUnit,
}

impl RequestDispatcher<Bindings, ()> for FragmentDispatcher {
    fn forward(&self, request: &mut Bindings, _response: &mut ()) -> Result<(), DispatchError> {
        self.runner
            .call_precompiled(Some(&self.fragment), &HostServices::new(), request)
            .map(|_| ())
            .map_err(|e| DispatchError::Resource(e.into()))
    }

    fn include(&self, request: &mut Bindings, response: &mut ()) -> Result<(), DispatchError> {
        self.forward(request, response)
    }
}

impl HostContext for DemoHost {
    type Request = Bindings;
    type Response = ();

    fn request_dispatcher(&self, path: &str) -> Option<Box<dyn RequestDispatcher<Bindings, ()>>> {
        (path == self.fragment.path()).then(|| {
            Box::new(FragmentDispatcher {
                runner: Arc::clone(&self.runner),
                fragment: self.fragment.clone(),
            }) as Box<dyn RequestDispatcher<Bindings, ()>>
        })
    }

    fn named_dispatcher(&self, _name: &str) -> Option<Box<dyn RequestDispatcher<Bindings, ()>>> {
        None
    }
}

fn demo_unit(path: &str, type_name: &'static str) -> RenderUnit {
    RenderUnit::new(
        path,
        DeploymentUnit::new("org.example.demo"),
        Arc::new(DemoPage { type_name }),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("prerun {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => {
                let path = args.next().context("--config requires a file argument")?;
                config = Some(PathBuf::from(path));
            }
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'prerun --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init()?;

    let options = match &config {
        Some(path) => RunnerOptions::from_file(path)?,
        None => RunnerOptions::default(),
    }
    .with_env_overrides();
    let runner = Arc::new(PrecompiledRunner::new(options));

    // Concurrent first use: one initialization, every worker served.
    let index = demo_unit("/apps/demo/index.page", "index__002e__page");
    let mut handles = Vec::with_capacity(WORKERS);
    for i in 0..WORKERS {
        let runner = Arc::clone(&runner);
        let index = index.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut bindings = Bindings::new();
            bindings.insert("request", i.to_string());
            runner
                .call_precompiled(Some(&index), &HostServices::new(), &mut bindings)
                .map(|_| bindings.out().pending())
        }));
    }
    for handle in handles {
        let body = handle.await??;
        info!(%body, "Request served");
    }

    // Include through a foreign context; the usage count is isolated.
    let host = DemoHost {
        runner: Arc::clone(&runner),
        fragment: demo_unit("/apps/demo/footer.page", "footer__002e__page"),
    };
    let included = {
        let runner = Arc::clone(&runner);
        tokio::task::spawn_blocking(move || -> Result<String> {
            let out = Arc::new(BufferedOutput::new());
            let ctx = runner.external_context(host, out.clone() as Arc<dyn PageOutput>);
            let mut bindings = Bindings::with_output(out.clone());
            bindings.insert("request", "include");
            out.write("<header/>");
            if let Some(dispatcher) = ctx.request_dispatcher("/apps/demo/footer.page") {
                dispatcher.include(&mut bindings, &mut ())?;
            }
            out.flush()?;
            Ok(out.committed())
        })
        .await??
    };
    info!(%included, "Include completed");

    info!(ready = ?runner.ready_units(), "Ready units");
    let destroyed = runner.cleanup()?;
    info!(destroyed, "Runner shut down");

    runner.metrics().print_report();
    Ok(())
}
