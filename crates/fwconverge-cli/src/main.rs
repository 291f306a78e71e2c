//! fwconverge: converge a security management server towards YAML documents.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use fwconverge::{
    BatchValidator, ClientConfig, ConvergeError, Converger, DocumentLoader, ElementDescriptor,
    EngineSpec, MatchOptions, Outcome, PassOptions, Registry, SmcClient,
};

#[derive(Parser, Debug)]
#[command(name = "fwconverge", version, about)]
struct Cli {
    /// Client config file (defaults to <config dir>/fwconverge/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format of the pass result
    #[arg(long, value_enum, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge a file or directory of element documents
    Apply {
        path: PathBuf,
        #[command(flatten)]
        pass: PassArgs,
        /// Replace list attributes instead of merging into them
        #[arg(long)]
        overwrite: bool,
    },
    /// Converge one engine document
    Engine {
        path: PathBuf,
        #[command(flatten)]
        pass: PassArgs,
    },
    /// Validate, resolve and schedule element documents without changing anything
    Plan { path: PathBuf },
    /// Check element documents offline
    Validate { path: PathBuf },
}

#[derive(clap::Args, Debug)]
struct PassArgs {
    /// Compute changes without applying them
    #[arg(long)]
    dry_run: bool,
    /// Also report objects that needed no change
    #[arg(long)]
    show_unchanged: bool,
    /// Match element names by substring instead of exactly
    #[arg(long)]
    fuzzy: bool,
}

impl PassArgs {
    fn options(&self) -> PassOptions {
        PassOptions {
            dry_run: self.dry_run,
            record_unchanged: self.show_unchanged,
            match_options: MatchOptions {
                exact: !self.fuzzy,
                ..MatchOptions::default()
            },
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(format: LogFormat) -> Result<()> {
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fwconverge=info,reqwest=warn,hyper=warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    }
    .context("Failed to install the tracing subscriber")
}

fn print<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    };
    println!("{}", rendered);
    Ok(())
}

fn load_elements(path: &Path) -> Result<Vec<ElementDescriptor>> {
    let state = DocumentLoader::new(path)
        .load()
        .with_context(|| format!("Failed to load {}", path.display()))?;
    log::info!(
        "Loaded {} element(s) from {} file(s)",
        state.len(),
        state.sources.len()
    );
    Ok(state.elements)
}

async fn connect(config: Option<&Path>, registry: &Registry) -> Result<SmcClient> {
    let config = ClientConfig::discover(config).context("Failed to load client config")?;
    let api_key = config.api_key().context("Failed to resolve the API key")?;
    let client = SmcClient::new(&config, api_key, registry.clone())?;
    client.login().await?;
    Ok(client)
}

/// Prints the result of a pass. Returns false if anything failed.
fn report(result: fwconverge::Result<Outcome>, format: OutputFormat) -> Result<bool> {
    match result {
        Ok(outcome) => {
            let clean = outcome.failures().next().is_none();
            print(&outcome, format)?;
            Ok(clean)
        }
        Err(ConvergeError::Validation(report)) => {
            print(&report, format)?;
            log::error!("Validation failed, nothing was changed");
            Ok(false)
        }
        Err(ConvergeError::Aborted {
            stage,
            reason,
            applied,
        }) => {
            print(&applied, format)?;
            log::error!("Aborted during {}: {}", stage, reason);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let registry = Registry::builtin();

    match cli.command {
        Command::Validate { path } => {
            let elements = load_elements(&path)?;
            let report = BatchValidator::new(&registry).validate(&elements);
            print(&report, cli.output)?;
            Ok(report.is_empty())
        }
        Command::Plan { path } => {
            let elements = load_elements(&path)?;
            let client = connect(cli.config.as_deref(), &registry).await?;
            let result = Converger::new(&client, &registry).plan(elements).await;
            if let Err(e) = client.logout().await {
                log::warn!("Logout failed: {}", e);
            }
            match result {
                Ok(summary) => {
                    print(&summary, cli.output)?;
                    Ok(true)
                }
                Err(ConvergeError::Validation(report)) => {
                    print(&report, cli.output)?;
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Apply {
            path,
            pass,
            overwrite,
        } => {
            let mut elements = load_elements(&path)?;
            if overwrite {
                elements = elements.into_iter().map(ElementDescriptor::overwrite).collect();
            }
            let client = connect(cli.config.as_deref(), &registry).await?;
            let result = Converger::new(&client, &registry)
                .with_options(pass.options())
                .converge(elements)
                .await;
            if let Err(e) = client.logout().await {
                log::warn!("Logout failed: {}", e);
            }
            report(result, cli.output)
        }
        Command::Engine { path, pass } => {
            let spec = EngineSpec::load(&path)?;
            let client = connect(cli.config.as_deref(), &registry).await?;
            let result = Converger::new(&client, &registry)
                .with_options(pass.options())
                .converge_engine(&spec)
                .await;
            if let Err(e) = client.logout().await {
                log::warn!("Logout failed: {}", e);
            }
            report(result, cli.output)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    if run(cli).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
