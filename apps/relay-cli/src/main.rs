mod commands;
mod config;
mod sync;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use nostr_relay_pool::RelayInfo;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-cli")]
#[command(about = "Manage Nostr relays and watch their merged event stream")]
struct Cli {
    /// Config file (default: $NOSTR_RELAY_CLI_CONFIG or ./relay-cli.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Edit the configured relay list
    #[command(subcommand)]
    Relays(RelaysCommand),
    /// Stream deduplicated events from every configured relay as JSON lines
    Watch(WatchArgs),
    /// Resolve a NIP-05 identifier through the delegation service
    Nip05(Nip05Args),
    /// Check that the delegation service is reachable and accepts the secret
    DelegationStatus,
}

#[derive(Subcommand, Debug)]
enum RelaysCommand {
    List,
    Add(AddRelayArgs),
    Remove(RemoveRelayArgs),
}

#[derive(Args, Debug)]
struct AddRelayArgs {
    url: String,
    /// read, write or read-write
    #[arg(long, default_value = "read-write")]
    info: RelayInfo,
    /// Seconds to wait for relays while updating the published relay list
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    /// Publish a fresh relay list when no prior one is found
    #[arg(long)]
    bootstrap: bool,
    /// Only edit the config file; never touch the network
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Debug)]
struct RemoveRelayArgs {
    url: String,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Event kinds to subscribe to
    #[arg(long, value_delimiter = ',', default_values_t = vec![1u16])]
    kinds: Vec<u16>,
    /// Restrict to one author (hex public key)
    #[arg(long)]
    author: Option<String>,
    /// Stored events to request per relay
    #[arg(long)]
    limit: Option<u64>,
    /// Exit after this many events
    #[arg(long)]
    max_events: Option<usize>,
}

#[derive(Args, Debug)]
struct Nip05Args {
    identifier: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = config::resolve_config_path(cli.config);
    let mut out = std::io::stdout();
    match cli.command {
        Command::Relays(RelaysCommand::List) => commands::list_relays(&config_path, &mut out),
        Command::Relays(RelaysCommand::Add(args)) => {
            commands::add_relay(&config_path, &args, &mut out).await
        }
        Command::Relays(RelaysCommand::Remove(args)) => {
            commands::remove_relay(&config_path, &args.url, &mut out)
        }
        Command::Watch(args) => commands::watch(&config_path, &args, &mut out).await,
        Command::Nip05(args) => commands::nip05(&config_path, &args.identifier, &mut out).await,
        Command::DelegationStatus => commands::delegation_status(&config_path, &mut out).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_add_with_info() -> Result<()> {
        let cli = Cli::try_parse_from([
            "relay-cli",
            "--config",
            "/tmp/relays.toml",
            "relays",
            "add",
            "wss://relay.example",
            "--info",
            "read",
        ])?;
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/relays.toml")));
        let Command::Relays(RelaysCommand::Add(args)) = cli.command else {
            anyhow::bail!("expected relays add");
        };
        assert_eq!(args.url, "wss://relay.example");
        assert_eq!(args.info, RelayInfo::Read);
        assert_eq!(args.timeout, 10);
        assert!(!args.bootstrap && !args.offline);
        Ok(())
    }

    #[test]
    fn info_defaults_to_read_write() -> Result<()> {
        let cli = Cli::try_parse_from(["relay-cli", "relays", "add", "wss://relay.example"])?;
        let Command::Relays(RelaysCommand::Add(args)) = cli.command else {
            anyhow::bail!("expected relays add");
        };
        assert_eq!(args.info, RelayInfo::ReadWrite);
        Ok(())
    }

    #[test]
    fn rejects_unknown_info() {
        let parsed = Cli::try_parse_from([
            "relay-cli",
            "relays",
            "add",
            "wss://relay.example",
            "--info",
            "sideways",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parses_watch_filters() -> Result<()> {
        let cli = Cli::try_parse_from([
            "relay-cli",
            "watch",
            "--kinds",
            "1,7",
            "--author",
            "abc",
            "--limit",
            "20",
        ])?;
        let Command::Watch(args) = cli.command else {
            anyhow::bail!("expected watch");
        };
        assert_eq!(args.kinds, vec![1, 7]);
        assert_eq!(args.author.as_deref(), Some("abc"));
        assert_eq!(args.limit, Some(20));
        assert_eq!(args.max_events, None);
        Ok(())
    }

    #[test]
    fn watch_defaults_to_text_notes() -> Result<()> {
        let cli = Cli::try_parse_from(["relay-cli", "watch"])?;
        let Command::Watch(args) = cli.command else {
            anyhow::bail!("expected watch");
        };
        assert_eq!(args.kinds, vec![1]);
        Ok(())
    }

    #[test]
    fn parses_nip05_and_status() -> Result<()> {
        let cli = Cli::try_parse_from(["relay-cli", "nip05", "bob@example.com"])?;
        assert!(matches!(
            cli.command,
            Command::Nip05(ref args) if args.identifier == "bob@example.com"
        ));

        let cli = Cli::try_parse_from(["relay-cli", "delegation-status"])?;
        assert!(matches!(cli.command, Command::DelegationStatus));
        Ok(())
    }
}
