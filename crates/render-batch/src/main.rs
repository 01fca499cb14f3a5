use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use component_render::{RenderConfig, RenderJob};
use env_logger::Env;
use render_batch::{load_collected, load_generated, partition, run_worker, BatchError, Dispatcher};
use tokio::io::AsyncReadExt;

/// Render React components to screenshots across isolated worker processes
#[derive(Parser, Debug)]
#[command(name = "render-batch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Arguments shared by the dispatching subcommands
#[derive(Args, Debug)]
struct DispatchArgs {
    /// Directory screenshots are written to
    screenshot_dir: PathBuf,

    /// Directory holding one template project per batch (`t-<batch>`)
    react_app_dir: PathBuf,

    /// Number of worker processes
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    batches: u16,

    /// JSON render configuration
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render collected components from `<code_dir>/<repo>/<component>.json`
    Collect {
        code_dir: PathBuf,
        #[command(flatten)]
        args: DispatchArgs,
    },
    /// Render generated components from a results JSON array
    Eval {
        results: PathBuf,
        #[command(flatten)]
        args: DispatchArgs,
    },
    /// Render one batch; jobs arrive as JSON on stdin
    #[command(hide = true)]
    Worker {
        batch: u16,
        react_app_dir: PathBuf,
        config: Option<PathBuf>,
    },
}

/// Where the jobs of a dispatch run come from
enum Source {
    Collected(PathBuf),
    Generated(PathBuf),
}

impl Command {
    fn batch(&self) -> Option<u16> {
        match self {
            Command::Worker { batch, .. } => Some(*batch),
            Command::Collect { .. } | Command::Eval { .. } => None,
        }
    }
}

/// Workers tag every line with their batch so interleaved output stays readable
fn init_logging(batch: Option<u16>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if let Some(batch) = batch {
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "[{} {:<5} batch {}] {}",
                buf.timestamp_millis(),
                record.level(),
                batch,
                record.args()
            )
        });
    }
    builder.init();
}

async fn load_config(path: Option<&Path>) -> Result<RenderConfig, BatchError> {
    match path {
        Some(path) => Ok(RenderConfig::load(path).await?),
        None => Ok(RenderConfig::default()),
    }
}

async fn dispatch(source: Source, args: DispatchArgs) -> Result<(), BatchError> {
    let DispatchArgs {
        screenshot_dir,
        react_app_dir,
        batches,
        config,
    } = args;
    tokio::fs::create_dir_all(&screenshot_dir)
        .await
        .map_err(|source| BatchError::Io {
            context: format!("{:?}", screenshot_dir),
            source,
        })?;

    let jobs = match source {
        Source::Collected(code_dir) => load_collected(&code_dir, &screenshot_dir).await?,
        Source::Generated(results) => load_generated(&results, &screenshot_dir).await?,
    };
    let batches = partition(jobs, usize::from(batches));

    let dispatcher = Dispatcher::current_exe(react_app_dir, config)?;
    let reports = dispatcher.run(batches).await;

    match reports.into_iter().find_map(|report| report.result.err()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn work(
    batch: u16,
    react_app_dir: PathBuf,
    config: Option<PathBuf>,
) -> Result<(), BatchError> {
    let mut payload = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut payload)
        .await
        .map_err(|source| BatchError::Io {
            context: "stdin".to_string(),
            source,
        })?;
    let jobs: Vec<RenderJob> =
        serde_json::from_slice(&payload).map_err(|source| BatchError::Json {
            context: "stdin".to_string(),
            source,
        })?;

    let config = load_config(config.as_deref()).await?;
    log::info!("Rendering {} job(s)", jobs.len());
    run_worker(batch, &react_app_dir, config, jobs).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // LLM_BASE_URL, LLM_KEY and MODEL_NAME may come from a .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.command.batch());

    let result = match cli.command {
        Command::Collect { code_dir, args } => dispatch(Source::Collected(code_dir), args).await,
        Command::Eval { results, args } => dispatch(Source::Generated(results), args).await,
        Command::Worker {
            batch,
            react_app_dir,
            config,
        } => work(batch, react_app_dir, config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
