//! pypistack CLI
//!
//! Synthesizes the package index stack template from a config file or flags.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pypistack::{StackBuilder, StackConfig, StorageStrategy};

/// pypistack - CloudFormation synthesizer for a pypiserver package index
#[derive(Parser, Debug)]
#[command(name = "pypistack")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize the CloudFormation template
    Synth(SynthArgs),
    /// Check a config and the graph it builds without writing anything
    Validate(ConfigArgs),
    /// Print the JSON Schema for the config file format
    Schema,
}

/// Config file plus flag overrides, shared by synth and validate
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to a YAML config file
    #[arg(short = 'f', long = "config", env = "PYPISTACK_CONFIG")]
    config_file: Option<PathBuf>,

    /// Hosted zone domain the DNS record lands in
    #[arg(long)]
    domain: Option<String>,

    /// Project name override
    #[arg(long)]
    project: Option<String>,

    /// Record name override, e.g. pypi.srvc
    #[arg(long)]
    record_name: Option<String>,

    /// Storage override: "new" or "existing:<file-system-id>"
    #[arg(long, value_parser = parse_storage)]
    storage: Option<StorageStrategy>,
}

#[derive(Args, Debug)]
struct SynthArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Template output format
    #[arg(long, value_enum, default_value_t = Format::Yaml)]
    format: Format,

    /// Write the template here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    /// Template YAML
    Yaml,
    /// Pretty-printed template JSON
    Json,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match Cli::parse().command {
        Commands::Synth(args) => synth(args),
        Commands::Validate(args) => validate(args),
        Commands::Schema => schema(),
    }
}

fn synth(args: SynthArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let graph = StackBuilder::build(&config)?;
    let rendered = match args.format {
        Format::Yaml => graph.to_yaml()?,
        Format::Json => graph.to_json()?,
    };
    match &args.output {
        Some(path) => {
            fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "template written");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn validate(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let graph = StackBuilder::build(&config)?;
    info!(resources = graph.resources.len(), "config and graph are valid");
    Ok(())
}

fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(StackConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Read the config file if given, then apply flag overrides on top
fn load_config(args: &ConfigArgs) -> anyhow::Result<StackConfig> {
    let mut config = match &args.config_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => StackConfig::default(),
    };
    if let Some(domain) = &args.domain {
        config.domain = domain.clone();
    }
    if let Some(project) = &args.project {
        config.project_name = project.clone();
    }
    if let Some(record_name) = &args.record_name {
        config.record_name = record_name.clone();
    }
    if let Some(storage) = &args.storage {
        config.storage = storage.clone();
    }
    Ok(config)
}

/// Parse "new" or "existing:<file-system-id>" into a storage strategy
fn parse_storage(value: &str) -> Result<StorageStrategy, String> {
    match value {
        "new" => Ok(StorageStrategy::CreateNew { encrypted: false }),
        other => match other.strip_prefix("existing:") {
            Some(id) if !id.is_empty() => Ok(StorageStrategy::UseExisting {
                file_system_id: id.to_string(),
            }),
            _ => Err(format!(
                "expected \"new\" or \"existing:<file-system-id>\", got {value:?}"
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_file_falls_back_to_the_environment() {
        std::env::set_var("PYPISTACK_CONFIG", "/tmp/stack.yaml");
        let cli = Cli::try_parse_from(["pypistack", "validate"]).unwrap();
        std::env::remove_var("PYPISTACK_CONFIG");
        match cli.command {
            Commands::Validate(args) => {
                assert_eq!(args.config_file, Some(PathBuf::from("/tmp/stack.yaml")));
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn storage_override_parses_both_strategies() {
        assert_eq!(
            parse_storage("new").unwrap(),
            StorageStrategy::CreateNew { encrypted: false }
        );
        assert_eq!(
            parse_storage("existing:fs-02396aba539111de6").unwrap(),
            StorageStrategy::UseExisting {
                file_system_id: "fs-02396aba539111de6".to_string()
            }
        );
        assert!(parse_storage("existing:").is_err());
        assert!(parse_storage("shiny").is_err());
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        fs::write(&path, "domain: example.com\nmaxAzs: 3\n").unwrap();

        let args = ConfigArgs {
            config_file: Some(path),
            domain: Some("packages.example.org".to_string()),
            project: None,
            record_name: Some("pypi".to_string()),
            storage: Some(StorageStrategy::CreateNew { encrypted: true }),
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.domain, "packages.example.org");
        assert_eq!(config.max_azs, 3);
        assert_eq!(config.record_name, "pypi");
        assert_eq!(config.project_name, "pypiserver");
        assert_eq!(config.storage, StorageStrategy::CreateNew { encrypted: true });
    }
}
