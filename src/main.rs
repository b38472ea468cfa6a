use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use preflight::report::{HealthReport, EXIT_CONFIG, EXIT_FAILED};
use preflight::{BootstrapConfig, ConfigError};
use std::path::PathBuf;

/// Output format of the health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

/// Command-line arguments for the resource bootstrapper
#[derive(Parser)]
#[command(
    name = "preflight",
    about = "Validate, connect and initialize the resources an application depends on",
    long_about = "Reads a bootstrap file describing databases, caches, queues, directories, \
                  network endpoints and HTTP APIs, initializes them in dependency order \
                  and reports the status of each one."
)]
struct Cli {
    /// Path to the bootstrap file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "preflight.toml",
        help = "Bootstrap file path (TOML format)"
    )]
    config: PathBuf,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    /// Only validate configurations; no connections are opened
    #[arg(long)]
    validate_only: bool,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Reject paths that exist but are not files
    fn validate(&self) -> Result<(), String> {
        if self.config.exists() && !self.config.is_file() {
            return Err(format!(
                "Configuration path is not a file: {}",
                self.config.display()
            ));
        }
        if let Some(extension) = self.config.extension() {
            if extension != "toml" {
                warn!(
                    "Configuration file does not have .toml extension: {}",
                    self.config.display()
                );
            }
        }
        Ok(())
    }
}

/// Run the bootstrap and print the report; returns the process exit code
fn run(cli: &Cli, config: BootstrapConfig) -> anyhow::Result<i32> {
    let mut manager = config
        .build_manager()
        .context("failed to build initializers")?;

    let outcome = if cli.validate_only {
        info!("Validating {} initializers", manager.len());
        manager.validate()
    } else {
        info!("Initializing {} resources", manager.len());
        manager.initialize()
    };
    if let Err(e) = &outcome {
        error!("{}", e);
    }

    let report = HealthReport::from_manager(&manager);
    match cli.format {
        Format::Table => println!("{}", report.render_table()),
        Format::Json => println!(
            "{}",
            report.to_json().context("failed to serialize report")?
        ),
    }

    let code = report.exit_code();
    if outcome.is_err() && code == 0 {
        return Ok(EXIT_FAILED);
    }
    Ok(code)
}

fn load(cli: &Cli) -> Result<BootstrapConfig, ConfigError> {
    cli.validate().map_err(ConfigError::ValidationError)?;
    BootstrapConfig::from_file(&cli.config)
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error in '{}': {}", cli.config.display(), e);
            eprintln!("preflight: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    match run(&cli, config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("preflight: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn cli(config: PathBuf) -> Cli {
        Cli {
            config,
            format: Format::Table,
            validate_only: false,
            verbose: false,
        }
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "preflight",
            "--config",
            "boot.toml",
            "--format",
            "json",
            "--validate-only",
            "-v",
        ]);
        assert_eq!(cli.config, PathBuf::from("boot.toml"));
        assert_eq!(cli.format, Format::Json);
        assert!(cli.validate_only);
        assert!(cli.verbose);

        let defaults = Cli::parse_from(["preflight"]);
        assert_eq!(defaults.config, PathBuf::from("preflight.toml"));
        assert_eq!(defaults.format, Format::Table);
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        assert!(cli(dir.path().to_path_buf()).validate().is_err());
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let result = load(&cli(PathBuf::from("/nonexistent/preflight.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_run_exit_codes() {
        let dir = TempDir::new().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[initializers.storage]\ntype = \"filesystem\"\nbase_path = \"{}\"\nrequired_dirs = [\"cache\"]",
            dir.path().display()
        )
        .unwrap();
        let args = cli(file.path().to_path_buf());
        let config = load(&args).unwrap();
        assert_eq!(run(&args, config).unwrap(), 0);
        assert!(dir.path().join("cache").is_dir());

        let mut bad = NamedTempFile::new().unwrap();
        writeln!(
            bad,
            "[initializers.storage]\ntype = \"filesystem\"\nbase_path = \"{}\"\nrequired_dirs = []",
            dir.path().display()
        )
        .unwrap();
        let args = Cli {
            validate_only: true,
            ..cli(bad.path().to_path_buf())
        };
        let config = load(&args).unwrap();
        assert_eq!(run(&args, config).unwrap(), EXIT_FAILED);
    }
}
