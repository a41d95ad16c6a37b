use clap::{Args, Parser, Subcommand};
use model::{CommandBackendConfig, CommandTestBackend, ModelTestBackend};
use package::{CommandExporter, LibraryExporter, PackageExporter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use worker::{
    parse_descriptor, Dispatch, ModelTesterService, ServiceResponse, TaggedCall, TaggedResponse,
    TestError, WorkerConfig, WorkerGate,
};

#[derive(Parser)]
#[command(name = "bioengine-worker")]
#[command(about = "Fetch, stage and test packaged models one at a time")]
struct Cli {
    #[command(flatten)]
    options: WorkerOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WorkerOptions {
    /// TOML configuration file (otherwise BIOENGINE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Directory under which packages are staged
    #[arg(long, global = true)]
    scratch_root: Option<PathBuf>,
    /// Number of requests allowed to wait for the session slot
    #[arg(long, global = true)]
    max_queued_requests: Option<usize>,
    /// Give up on a package download after this many seconds
    #[arg(long, global = true)]
    download_timeout_secs: Option<u64>,
    /// Directory of unpacked packages, one per model id
    #[arg(long, global = true, env = "BIOENGINE_LIBRARY", default_value = "models")]
    library: PathBuf,
    /// Program that exports a package, called as
    /// `<program> <args...> <model_id> <output>`. Takes precedence over --library
    #[arg(long, global = true)]
    export_command: Option<String>,
    /// Extra argument for the export program (repeatable)
    #[arg(long = "export-arg", global = true, allow_hyphen_values = true)]
    export_args: Vec<String>,
    /// Program that runs a model's test suite
    #[arg(long, global = true, env = "BIOENGINE_TEST_COMMAND", default_value = "bioimageio")]
    test_command: String,
    /// Argument for the test program (repeatable, defaults to `test`)
    #[arg(long = "test-arg", global = true, allow_hyphen_values = true)]
    test_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Liveness check
    Ping,
    /// Test a single model and print its report
    Test {
        /// Model identifier
        #[arg(short, long)]
        model_id: String,
        /// URL of the zipped package (otherwise exported locally)
        #[arg(short = 'u', long)]
        model_url: Option<String>,
    },
    /// Check a descriptor's format without running anything
    Validate {
        /// Path to an rdf.yaml (or JSON) descriptor
        path: PathBuf,
    },
    /// Answer newline-delimited JSON calls from stdin
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.options)?;
    let gate = WorkerGate::from_config(
        &config,
        build_exporter(&cli.options),
        build_test_backend(&cli.options)?,
    )?;
    let service = ModelTesterService::new(Arc::new(gate));

    match cli.command {
        Commands::Ping => {
            println!("{}", service.ping());
        }
        Commands::Test {
            model_id,
            model_url,
        } => {
            let outcome = service.test_model(&model_id, model_url.as_deref()).await;
            print_response(&ServiceResponse::from_outcome(&outcome))?;
            outcome?;
        }
        Commands::Validate { path } => {
            let text = tokio::fs::read_to_string(&path).await?;
            let descriptor = parse_descriptor(&text)?;
            let result = service.validate(&descriptor);
            println!("{}", result.details);
            if !result.success {
                return Err(format!("'{}' failed validation", path.display()).into());
            }
        }
        Commands::Serve => {
            serve(service).await?;
        }
    }

    Ok(())
}

fn load_config(options: &WorkerOptions) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config {
        Some(path) => WorkerConfig::from_toml_file(path)?,
        None => WorkerConfig::from_env()?,
    };

    if let Some(root) = &options.scratch_root {
        config = config.with_scratch_root(root);
    }
    if let Some(queued) = options.max_queued_requests {
        config = config.with_max_queued_requests(queued);
    }
    if let Some(secs) = options.download_timeout_secs {
        config = config.with_download_timeout(Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

fn build_exporter(options: &WorkerOptions) -> Arc<dyn PackageExporter> {
    match &options.export_command {
        Some(program) => {
            Arc::new(CommandExporter::new(program).with_args(options.export_args.clone()))
        }
        None => Arc::new(LibraryExporter::new(&options.library)),
    }
}

fn build_test_backend(
    options: &WorkerOptions,
) -> Result<Arc<dyn ModelTestBackend>, Box<dyn std::error::Error>> {
    let args = if options.test_args.is_empty() {
        vec!["test".to_string()]
    } else {
        options.test_args.clone()
    };
    let config = CommandBackendConfig::new(&options.test_command).with_args(args);
    Ok(Arc::new(CommandTestBackend::new(config)?))
}

fn print_response(response: &ServiceResponse) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

async fn serve(service: ModelTesterService) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        queue_capacity = service.gate().queue_capacity(),
        "Serving calls from stdin"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<TaggedResponse>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                error!("Failed to write response: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let TaggedCall { id, call } = match serde_json::from_str(&line) {
            Ok(tagged) => tagged,
            Err(e) => {
                warn!("Discarding malformed call: {}", e);
                let error = TestError::InvalidRequest {
                    reason: format!("malformed call: {}", e),
                };
                let _ = tx.send(TaggedResponse {
                    id: serde_json::Value::Null,
                    response: ServiceResponse::err(&error),
                });
                continue;
            }
        };

        // Tests take their queue place here, in input order, before the
        // wait for the session slot moves off this loop.
        match service.dispatch(call).await {
            Dispatch::Done(response) => {
                let _ = tx.send(TaggedResponse { id, response });
            }
            Dispatch::Queued(admission) => {
                let tx = tx.clone();
                tasks.spawn(async move {
                    let response = ServiceResponse::from_outcome(&admission.run().await);
                    let _ = tx.send(TaggedResponse { id, response });
                });
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Call handler panicked: {}", e);
        }
    }
    drop(tx);
    writer.await?;

    let stats = service.gate().stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        rejected = stats.rejected,
        "Input closed, worker stopping"
    );
    Ok(())
}
