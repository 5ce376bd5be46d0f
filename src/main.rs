use std::process::ExitCode;

use clap::Parser;
use tracing::{error, metadata::LevelFilter};
use tracing_subscriber::prelude::*;

mod app;
mod cli;

const EXIT_FATAL: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;

fn resolve_config(args: &cli::CliArgs) -> Result<app::ProxyConfiguration, app::ConfigError> {
    let file = match &args.config {
        Some(path) => app::RawConfig::from_toml_file(path)?,
        None => Default::default(),
    };
    args.raw_config().layered_over(file).resolve()
}

fn exit_status(outcome: &Result<app::StopReason, app::ServiceError>) -> u8 {
    match outcome {
        Ok(app::StopReason::Signal) => 0,
        Err(_) => EXIT_FATAL,
    }
}

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();
    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    let log_level = if config.verbose {
        args.log_level.max(LevelFilter::DEBUG)
    } else {
        args.log_level
    };
    tracing_subscriber::registry()
        .with(log_level)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let context = app::AppContext::new(config);
    let outcome = match app::block_on(async {
        app::ServiceSupervisor::new(&context)
            .run(app::shutdown_signal())
            .await
    }) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Failed to start runtime: {}", err);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    if let Err(err) = &outcome {
        error!(service = err.service(), "Fatal: {}", err);
        eprintln!("Error: {}", err);
    }
    ExitCode::from(exit_status(&outcome))
}

#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr};

    use super::*;

    fn args(argv: &[&str]) -> cli::CliArgs {
        cli::CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn exit_zero_on_signal() {
        assert_eq!(exit_status(&Ok(app::StopReason::Signal)), 0);
    }

    #[test]
    fn exit_one_on_fatal_service_error() {
        let bind = app::ServiceError::Bind {
            service: "HTTP proxy",
            addr: SocketAddr::from(([127, 0, 0, 1], 3128)),
            source: io::ErrorKind::AddrInUse.into(),
        };
        assert_eq!(exit_status(&Err(bind)), 1);
        let panicked = app::ServiceError::Panicked { service: "UDP relay" };
        assert_eq!(exit_status(&Err(panicked)), 1);
    }

    #[test]
    fn bad_config_is_reported_before_launch() {
        assert!(resolve_config(&args(&["gatewayd", "-s", "70000"])).is_err());
        assert!(resolve_config(&args(&["gatewayd", "-a", "not-an-ip"])).is_err());
        assert!(resolve_config(&args(&["gatewayd", "-s", "1080", "-l"])).is_ok());
        assert_eq!(EXIT_BAD_CONFIG, 2);
    }
}
