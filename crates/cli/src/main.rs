// redmap CLI entry point.

use std::process;

use clap::{Args, Parser};
use redmap_core::MapConfig;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "redmap",
    about = "Shared Redis-backed maps that disappear with their last handle",
    after_help = "A collection only outlives a command while some other handle \
                  (for example `redmap hold`) is attached to it."
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

#[derive(Debug, Default, Args)]
struct ConnectionArgs {
    /// Redis URL, e.g. redis://localhost:6379/0.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Redis host (overrides the URL host).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Redis port (overrides the URL port).
    #[arg(long, global = true)]
    port: Option<u16>,
}

impl ConnectionArgs {
    /// Layer the flags over file and environment configuration.
    fn resolve(&self, mut config: MapConfig) -> anyhow::Result<MapConfig> {
        if let Some(url) = &self.url {
            config.apply_url(url)?;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

fn init_tracing(config: &MapConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> process::ExitCode {
    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);

    let config = match cli.connection.resolve(MapConfig::load()) {
        Ok(config) => config,
        Err(error) => {
            output::print_anyhow_error(format, &error);
            return ExitCode::from_error(&error).into();
        }
    };
    init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let error = anyhow::Error::new(error).context("failed to start tokio runtime");
            output::print_anyhow_error(format, &error);
            return ExitCode::Error.into();
        }
    };

    match runtime.block_on(commands::run(cli.command, config, format)) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_loaded_config() {
        let args = ConnectionArgs {
            url: Some("redis://cache.internal:6390/2".into()),
            host: None,
            port: Some(7000),
        };
        let config = args.resolve(MapConfig::default()).unwrap();
        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 7000);
        assert_eq!(config.db, 2);
    }

    #[test]
    fn invalid_url_flag_is_rejected() {
        let args = ConnectionArgs { url: Some("http://nope".into()), ..ConnectionArgs::default() };
        assert!(args.resolve(MapConfig::default()).is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["redmap", "size", "orders", "--json", "--port", "6380"])
            .unwrap();
        assert!(cli.json);
        assert_eq!(cli.connection.port, Some(6380));
    }
}
