use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webserv::{Server, Site};

const BACKLOG: i32 = 1024;

#[derive(Parser)]
#[command(name = "webserv", version)]
#[command(about = "HTTP/1.1 server with location routing and CGI", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "webserv.toml")]
    config: PathBuf,

    /// Default log filter, `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("webserv={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let site = match Site::load(&cli.config) {
        Ok(site) => site,
        Err(e) => {
            tracing::error!(config = %cli.config.display(), error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let listener = match webserv::bind(site.listen, BACKLOG) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %site.listen, error = %e, "cannot bind");
            return ExitCode::FAILURE;
        }
    };

    Server::builder()
        .listener(listener)
        .site(site)
        .build()
        .launch()
        .await;

    ExitCode::SUCCESS
}
