//! Turns any [`Plugin`] into a standalone plugin executable.
//!
//! ```no_run
//! # use custodian_plugin::builtin::FsStore;
//! fn main() {
//!     custodian_plugin::run(FsStore);
//! }
//! ```

use crate::endpoint::Endpoint;
use crate::errors::{PluginError, SUCCESS, USAGE};
use crate::meta::FieldMode;
use crate::plugin::Plugin;
use crate::process::ENDPOINT_ENV;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "custodian plugin")]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'D', long, global = true, env = "DEBUG")]
    debug: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print plugin metadata as JSON
    Info,
    /// Validate an endpoint configuration
    Validate {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
        #[arg(short, long, default_value = "target")]
        mode: FieldMode,
    },
    /// Write a backup of the target to stdout
    Backup {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
    },
    /// Restore the target from stdin
    Restore {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
    },
    /// Store stdin and print the stored key as JSON
    Store {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
    },
    /// Write a stored object to stdout
    Retrieve {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
        #[arg(short, long, default_value = "")]
        key: String,
    },
    /// Delete a stored object
    Purge {
        #[arg(short, long, env = ENDPOINT_ENV, default_value = "{}")]
        endpoint: String,
        #[arg(short, long, default_value = "")]
        key: String,
    },
}

fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Parses the command line, runs the requested operation and exits with the
/// matching status code. stdout carries only data or JSON results.
pub fn run<P: Plugin + 'static>(plugin: P) -> ! {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(USAGE);
        }
        Err(e) => e.exit(),
    };
    init_logging(cli.debug);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(crate::errors::EXEC_FAILURE);
        }
    };

    let code = match runtime.block_on(dispatch(&plugin, cli.action)) {
        Ok(()) => SUCCESS,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code)
}

async fn dispatch(plugin: &dyn Plugin, action: Action) -> Result<(), PluginError> {
    let mut stdout = tokio::io::stdout();
    match action {
        Action::Info => {
            let info = plugin.meta().await?;
            let json = serde_json::to_string_pretty(&info)?;
            stdout.write_all(json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        Action::Validate { endpoint, mode } => {
            let ep = Endpoint::parse(&endpoint)?;
            plugin.validate(mode, &ep).await?;
            debug!("{} endpoint is valid", mode.as_str());
        }
        Action::Backup { endpoint } => {
            let ep = Endpoint::parse(&endpoint)?;
            plugin.backup(&ep, &mut stdout).await?;
        }
        Action::Restore { endpoint } => {
            let ep = Endpoint::parse(&endpoint)?;
            plugin.restore(&ep, &mut tokio::io::stdin()).await?;
        }
        Action::Store { endpoint } => {
            let ep = Endpoint::parse(&endpoint)?;
            let stored = plugin.store(&ep, &mut tokio::io::stdin()).await?;
            let json = serde_json::to_string(&stored)?;
            stdout.write_all(json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        Action::Retrieve { endpoint, key } => {
            if key.is_empty() {
                return Err(PluginError::MissingKey);
            }
            let ep = Endpoint::parse(&endpoint)?;
            plugin.retrieve(&ep, &key, &mut stdout).await?;
        }
        Action::Purge { endpoint, key } => {
            if key.is_empty() {
                return Err(PluginError::MissingKey);
            }
            let ep = Endpoint::parse(&endpoint)?;
            plugin.purge(&ep, &key).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_operations() {
        let cli = Cli::try_parse_from(["p", "purge", "--endpoint", "{}", "--key", "k1"]).unwrap();
        assert!(matches!(cli.action, Action::Purge { ref key, .. } if key == "k1"));

        let cli = Cli::try_parse_from(["p", "-D", "validate", "--mode", "store"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.action, Action::Validate { mode: FieldMode::Store, .. }));

        assert!(Cli::try_parse_from(["p", "explode"]).is_err());
    }

    #[tokio::test]
    async fn test_missing_key_maps_to_exit_code() {
        let err = dispatch(
            &crate::builtin::MemoryStore::new(),
            Action::Purge {
                endpoint: "{}".into(),
                key: String::new(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::RESTORE_KEY_REQUIRED);
    }
}
