mod queue;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use queue::QueueOptions;
use regex::Regex;
use soa_core::{builtin_catalog, HostConfig, ProcessServiceOverrides, ServiceHost};
use soa_service_sdk::CancellationToken;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    task::JoinSet,
};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "demos/config/host.toml";

#[derive(Parser, Debug)]
#[command(name = "soa-host", author, version, about = "Host for pluggable user services")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Program run by the built-in process service.
    #[arg(short = 'f', long = "command", global = true, value_name = "PATH")]
    command_path: Option<String>,

    /// Argument string passed to the process service's program.
    #[arg(short = 'a', long, global = true, allow_hyphen_values = true)]
    arguments: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Invoke the user service once per stdin line until EOF or Ctrl+C.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Invoke the user service once and print its response.
    Invoke {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Request payload; read from stdin when omitted.
        #[arg(long)]
        input: Option<String>,
    },
    /// Interact with host configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect the modules this host can load.
    Modules {
        #[command(subcommand)]
        command: ModuleCommands,
    },
    /// Validate queue connectivity options.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum ModuleCommands {
    /// Lists the registered modules.
    List,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Validates queue options and prints the resolved settings.
    Check {
        #[command(flatten)]
        options: QueueOptions,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    let overrides = ProcessServiceOverrides {
        command: cli.command_path,
        arguments: cli.arguments,
    };
    match cli.command {
        Commands::Run { config } => handle_run(config, overrides).await,
        Commands::Invoke { config, input } => handle_invoke(config, input, overrides).await,
        Commands::Config { command } => handle_config(command),
        Commands::Modules { command } => handle_modules(command, overrides),
        Commands::Queue { command } => handle_queue(command),
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_new(level) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("invalid --log-level `{level}` ({err}); using info");
            EnvFilter::new("info")
        }
    };
    // Responses go to stdout, so diagnostics stay on stderr.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

fn start_host(path: &Path, overrides: ProcessServiceOverrides) -> Result<ServiceHost> {
    let config = load_config(path)?;
    tracing::debug!(version = soa_core::version(), config = %path.display(), "starting host");
    let catalog = builtin_catalog(overrides);
    ServiceHost::start(&config, Arc::new(catalog))
        .with_context(|| format!("failed to start service host from {}", path.display()))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown signal received; cancelling invocations");
                cancel.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "failed to install ctrl-c handler"),
        }
    });
}

async fn handle_run(config_path: PathBuf, overrides: ProcessServiceOverrides) -> Result<()> {
    let host = Arc::new(start_host(&config_path, overrides)?);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut join_set = JoinSet::new();
    let mut next_id = 0usize;
    tracing::info!("reading one payload per stdin line");
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(payload) = line else { break };
        let id = next_id;
        next_id += 1;
        let host = host.clone();
        let cancel = cancel.child_token();
        join_set.spawn(async move { (id, host.invoke(&payload, &cancel).await) });
    }

    let mut unanswered = 0usize;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((id, Ok(output))) => print_response(id, output)?,
            Ok((id, Err(err))) => {
                unanswered += 1;
                tracing::warn!(line = id, error = %err, "invocation produced no response");
            }
            Err(err) => {
                unanswered += 1;
                tracing::error!(error = %err, "invocation task aborted");
            }
        }
    }
    tracing::info!(total = next_id, unanswered, "all invocations finished");
    Ok(())
}

fn print_response(id: usize, output: String) -> Result<()> {
    let body = serde_json::from_str::<serde_json::Value>(&output)
        .unwrap_or(serde_json::Value::String(output));
    let line = serde_json::to_string(&serde_json::json!({ "line": id, "response": body }))?;
    println!("{line}");
    Ok(())
}

async fn handle_invoke(
    config_path: PathBuf,
    input: Option<String>,
    overrides: ProcessServiceOverrides,
) -> Result<()> {
    let host = start_host(&config_path, overrides)?;
    let payload = match input {
        Some(payload) => payload,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("failed to read payload from stdin")?;
            buf
        }
    };
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let output = host.invoke(&payload, &cancel).await?;
    println!("{output}");
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../demos/config/host.toml"));
        }
    }
    Ok(())
}

fn handle_modules(command: ModuleCommands, overrides: ProcessServiceOverrides) -> Result<()> {
    match command {
        ModuleCommands::List => {
            for name in builtin_catalog(overrides).module_names() {
                println!("- {name}");
            }
        }
    }
    Ok(())
}

fn handle_queue(command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::Check { options } => {
            let resolved = options.validate()?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
    }
    Ok(())
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<HostConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw, path)?;
    let cfg = HostConfig::from_toml(&expanded, path)?;
    Ok(cfg)
}

/// Expands `${VAR}` and `${VAR:default}` placeholders. A placeholder without
/// a default whose variable is unset is an error naming the config file.
fn interpolate_env(input: &str, origin: &Path) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let mut unset = Vec::new();
    let expanded = regex.replace_all(input, |caps: &regex::Captures| {
        match (std::env::var(&caps[1]), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                unset.push(caps[1].to_string());
                String::new()
            }
        }
    });
    if !unset.is_empty() {
        bail!(
            "{} references unset environment variables without defaults: {}",
            origin.display(),
            unset.join(", ")
        );
    }
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_fall_back_to_defaults() {
        let out = interpolate_env(
            "module_path = \"${SOA_HOST_TEST_UNSET_DIR:/opt}/cgi.so\"",
            Path::new("host.toml"),
        )
        .unwrap();
        assert_eq!(out, "module_path = \"/opt/cgi.so\"");
    }

    #[test]
    fn placeholders_read_the_environment() {
        std::env::set_var("SOA_HOST_TEST_MODULE_DIR", "/srv/modules");
        let out =
            interpolate_env("${SOA_HOST_TEST_MODULE_DIR:/opt}/cgi.so", Path::new("host.toml"))
                .unwrap();
        assert_eq!(out, "/srv/modules/cgi.so");
    }

    #[test]
    fn unset_placeholder_without_default_names_the_file() {
        let err = interpolate_env(
            "module_path = \"${SOA_HOST_TEST_NEVER_SET}/cgi.so\"",
            Path::new("/etc/soa/host.toml"),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("/etc/soa/host.toml"), "{err}");
        assert!(err.contains("SOA_HOST_TEST_NEVER_SET"), "{err}");
    }

    #[test]
    fn bundled_example_is_valid() {
        let cfg = HostConfig::from_toml(
            include_str!("../../../demos/config/host.toml"),
            Path::new("host.toml"),
        )
        .unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn global_process_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "soa-host",
            "invoke",
            "--input",
            "hi",
            "-f",
            "/bin/cat",
            "-a",
            "-u",
        ])
        .unwrap();
        assert_eq!(cli.command_path.as_deref(), Some("/bin/cat"));
        assert_eq!(cli.arguments.as_deref(), Some("-u"));
        assert!(matches!(cli.command, Commands::Invoke { input: Some(_), .. }));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/host.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
