//! couchctl - inspect and control CouchDB servers by locator
//!
//! Usage: `couchctl <locator> [url|futon|status|stop|restart]`

use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use couch::instance::InstanceState;
use couch::{config, Couch, Environment, Locator, ManagedInstance};

const USAGE: &str = "Usage: couchctl <locator> [url|futon|status|stop|restart]";

#[derive(Debug, Clone, Copy)]
enum Command {
    Url,
    Futon,
    Status,
    Stop,
    Restart,
}

impl Command {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "url" => Some(Self::Url),
            "futon" => Some(Self::Futon),
            "status" => Some(Self::Status),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("couch=debug,couchctl=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (locator, command) = match args.as_slice() {
        [locator] => (locator.as_str(), Some(Command::Url)),
        [locator, command] => (locator.as_str(), Command::parse(command)),
        _ => ("", None),
    };
    let command = match command {
        Some(command) => command,
        None => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = config::init_config() {
        error!("Failed to load configuration: {}", e);
        return ExitCode::FAILURE;
    }

    match run(locator, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(locator: &str, command: Command) -> couch::Result<()> {
    let env = Environment::system()?;

    if let Command::Status = command {
        return match Locator::parse(locator)? {
            Locator::LocalDirectory { dir, .. } => {
                let state = ManagedInstance::state(&dir, &env).await?;
                println!("{}", describe(state));
                Ok(())
            }
            _ => Err(couch::CouchError::UnsupportedBackend(
                "status is only known for file:// locators".to_string(),
            )),
        };
    }

    let mut couch = Couch::open_with(locator, None, &env).await?;
    match command {
        Command::Url | Command::Status => println!("{}", couch.uri()),
        Command::Futon => println!("{}", couch.futon_url()),
        Command::Stop => {
            info!("Stopping {}", couch);
            couch.shutdown().await?;
        }
        Command::Restart => {
            couch.restart().await?;
            println!("{}", couch.uri());
        }
    }
    Ok(())
}

fn describe(state: InstanceState) -> &'static str {
    match state {
        InstanceState::NoInfo => "never started",
        InstanceState::Stopped => "stopped",
        InstanceState::Starting => "starting",
        InstanceState::Running => "running",
        InstanceState::Unknown => "unknown (process can't be verified)",
    }
}
