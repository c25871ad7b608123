use std::env;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use mlops_pipeline::approval::ApprovalMode;
use mlops_pipeline::declaration::{DEFAULT_DECLARATION_PATH, Declaration};
use mlops_pipeline::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use mlops_pipeline::observability::server::MetricsServer;
use mlops_pipeline::params::{BUCKET_PLACEHOLDER, DEFAULT_PARAMS_PATH, ParamsFile, params_template};
use mlops_pipeline::pipeline::{RunOutcome, StageRegistry, build_pipeline};
use mlops_pipeline::presets::generate_preset;
use mlops_pipeline::provision::{self, BUCKET_ENV, ProvisionRequest, REGION_ENV};
use mlops_pipeline::report::RunReport;
use mlops_pipeline::runner::ShellRunner;
use mlops_pipeline::stages;
use mlops_pipeline::storage::AwsCli;
use mlops_pipeline::validation::validate_declaration;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match command {
        Commands::Provision {
            region,
            bucket,
            params,
            dry_run,
        } => provision_command(region, bucket, &params, dry_run),
        Commands::Run {
            declaration,
            workdir,
            approval,
            report,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            run_pipeline(RunOptions {
                declaration,
                workdir,
                approval,
                report,
                dry_run,
                print_metrics,
                metrics_json,
                metrics_prometheus,
                metrics_listen,
            })
        }
        Commands::Validate { declarations } => validate_command(&declarations),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Init {
            preset,
            output,
            force,
        } => init_command(&preset, output, force),
        Commands::Params { action } => params_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "mlops-pipeline", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "mlops-pipeline")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn provision_command(
    region: Option<String>,
    bucket: Option<String>,
    params: &Path,
    dry_run: bool,
) -> Result<()> {
    let request = ProvisionRequest::resolve(region, bucket, Utc::now());

    if dry_run {
        let outcome = provision::plan(&request, params)?;
        info!(
            bucket = %outcome.bucket,
            region = %outcome.region,
            params = %outcome.params_path.display(),
            current = outcome.previous_bucket.as_deref().unwrap_or("<none>"),
            "Dry run: bucket would be created and recorded"
        );
        println!("{}", outcome.bucket);
        return Ok(());
    }

    let outcome = provision::provision(&request, &AwsCli::default(), params)?;
    println!("{}", outcome.bucket);
    Ok(())
}

struct RunOptions {
    declaration: PathBuf,
    workdir: Option<PathBuf>,
    approval: ApprovalMode,
    report: Option<PathBuf>,
    dry_run: bool,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn run_pipeline(options: RunOptions) -> Result<()> {
    let declaration = Declaration::load(&options.declaration)?;
    let registry = build_registry();
    ensure_valid(&options.declaration, &declaration, &registry)?;

    let working_dir = match options.workdir {
        Some(dir) => dir,
        None => env::current_dir().context("Failed to determine current directory")?,
    };

    let executor = build_pipeline(&registry, &declaration, working_dir, env::vars().collect())?;

    if options.dry_run {
        info!(
            pipeline = executor.name(),
            stages = executor.stages().len(),
            "Loaded pipeline declaration"
        );
        for (idx, stage) in executor.stages().iter().enumerate() {
            info!(
                position = idx + 1,
                stage = %stage.name,
                kind = stage.stage.kind(),
                required = stage.required,
                credentials = stage.credentials.as_deref().unwrap_or("-"),
                "Planned stage"
            );
        }
        return Ok(());
    }

    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &options.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &options.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let approvals = options.approval.channel();
    let result = executor.execute(&ShellRunner, approvals.as_ref());

    let snapshot = metrics_handle.snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = options.metrics_json {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = options.metrics_prometheus {
        ensure_parent(&path)?;
        std::fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    if let Some(path) = options.report {
        RunReport::new(&options.declaration, &result)?.write(&path)?;
        info!(report = %path.display(), "Run report written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    match result.outcome {
        RunOutcome::Succeeded => {
            info!(pipeline = %result.pipeline, "Pipeline succeeded");
            Ok(())
        }
        RunOutcome::Failed { stage, error } => {
            Err(anyhow!("Pipeline failed at stage '{stage}': {error}"))
        }
        RunOutcome::Aborted { stage, reason } => {
            Err(anyhow!("Pipeline aborted at stage '{stage}': {reason}"))
        }
    }
}

fn ensure_valid(path: &Path, declaration: &Declaration, registry: &StageRegistry) -> Result<()> {
    let report = validate_declaration(declaration, registry);

    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }

    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
    Err(anyhow!(
        "Declaration validation failed with {} error(s)",
        report.errors.len()
    ))
}

fn validate_command(declarations: &[PathBuf]) -> Result<()> {
    let registry = build_registry();
    let mut failures = 0usize;

    for path in declarations {
        let outcome = Declaration::load(path)
            .and_then(|declaration| ensure_valid(path, &declaration, &registry));
        match outcome {
            Ok(()) => info!(file = %path.display(), "Declaration validation passed"),
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "{err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Validation failed for {failures} declaration(s)");
    }
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stage kinds:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn init_command(preset: &str, output: Option<PathBuf>, force: bool) -> Result<()> {
    let destination = output.unwrap_or_else(|| PathBuf::from(DEFAULT_DECLARATION_PATH));
    if destination.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            destination.display()
        );
    }
    let generated = generate_preset(preset, &destination)?;
    info!(
        preset = %preset,
        path = %generated.display(),
        "Pipeline declaration generated"
    );
    Ok(())
}

fn params_command(command: ParamsCommands) -> Result<()> {
    match command {
        ParamsCommands::Bucket { params } => {
            let file = ParamsFile::load(&params)?;
            let bucket = file.bucket()?.ok_or_else(|| {
                anyhow!("{} does not record an S3 bucket", params.display())
            })?;
            if bucket == BUCKET_PLACEHOLDER {
                warn!(params = %params.display(), "Bucket has not been provisioned yet");
            }
            println!("{bucket}");
            Ok(())
        }
        ParamsCommands::Init { output, force } => {
            if output.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", output.display());
            }
            ensure_parent(&output)?;
            std::fs::write(&output, params_template())
                .with_context(|| format!("Failed to write params file: {}", output.display()))?;
            info!(params = %output.display(), "Params template written");
            Ok(())
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "mlops-pipeline",
    version,
    about = "Artifact bucket provisioning and linear CI/CD pipeline runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the artifact bucket, enable versioning and record it in params.yaml
    Provision {
        #[arg(long, env = REGION_ENV)]
        region: Option<String>,
        #[arg(long, env = BUCKET_ENV)]
        bucket: Option<String>,
        #[arg(long, default_value = DEFAULT_PARAMS_PATH)]
        params: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Execute a pipeline declaration
    Run {
        #[arg(default_value = DEFAULT_DECLARATION_PATH)]
        declaration: PathBuf,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long, value_enum, env = "MLOPS_APPROVAL", default_value_t = ApprovalMode::Prompt)]
        approval: ApprovalMode,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Check declarations without running them
    Validate {
        #[arg(required = true)]
        declarations: Vec<PathBuf>,
    },
    ListStages,
    /// Write a built-in pipeline declaration
    Init {
        #[arg(long, default_value = "mlops")]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    Params {
        #[command(subcommand)]
        action: ParamsCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ParamsCommands {
    /// Print the bucket currently recorded in the params file
    Bucket {
        #[arg(long, default_value = DEFAULT_PARAMS_PATH)]
        params: PathBuf,
    },
    /// Write a params template with a placeholder bucket
    Init {
        #[arg(long, default_value = DEFAULT_PARAMS_PATH)]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
}
