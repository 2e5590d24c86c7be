use std::path::PathBuf;
use std::process::ExitCode;

use relay_llm::{ConfigStore, GatewayState, TraceRecorder};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const HELP: &str = "\
relay-gateway - failover reverse proxy for chat completion APIs

Usage: relay-gateway [OPTIONS]

Options:
  -p, --port <PORT>        Listen port (default: 3000)
  -h, --host <ADDR>        Listen address (default: 127.0.0.1)
  -c, --config-dir <PATH>  Config directory (default: <cwd>/data)
  -l, --log-dir <PATH>     Trace log directory (default: <config-dir>/logs)
      --no-cors            Disable the permissive CORS layer
      --help               Print this help";

#[derive(Debug)]
struct Args {
    host: String,
    port: u16,
    config_dir: PathBuf,
    log_dir: Option<PathBuf>,
    cors: bool,
}

impl Default for Args {
    fn default() -> Self {
        let config_dir = std::env::current_dir()
            .map(|dir| dir.join("data"))
            .unwrap_or_else(|_| PathBuf::from("data"));
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            config_dir,
            log_dir: None,
            cors: true,
        }
    }
}

/// `Ok(None)` means `--help` was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Args>, String> {
    let mut out = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" | "-p" => {
                let value = args.next().ok_or("missing value for --port")?;
                out.port = value
                    .parse()
                    .map_err(|_| format!("invalid port: {value}"))?;
            }
            "--host" | "-h" => {
                out.host = args.next().ok_or("missing value for --host")?;
            }
            "--config-dir" | "-c" => {
                out.config_dir = PathBuf::from(args.next().ok_or("missing value for --config-dir")?);
            }
            "--log-dir" | "-l" => {
                out.log_dir = Some(PathBuf::from(args.next().ok_or("missing value for --log-dir")?));
            }
            "--no-cors" => out.cors = false,
            "--help" => return Ok(None),
            other => return Err(format!("unknown arg: {other}")),
        }
    }
    Ok(Some(out))
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{HELP}");
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("{err}\n{HELP}");
            return ExitCode::from(1);
        }
    };

    init_tracing();

    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| args.config_dir.join("logs"));

    let store = match ConfigStore::new(&args.config_dir) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open config dir {}: {err}", args.config_dir.display());
            return ExitCode::from(1);
        }
    };
    let recorder = match TraceRecorder::new(&log_dir) {
        Ok(recorder) => recorder,
        Err(err) => {
            eprintln!("failed to open log dir {}: {err}", log_dir.display());
            return ExitCode::from(1);
        }
    };

    let state = GatewayState::new(store, recorder).with_cors(args.cors);
    let app = relay_llm::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            return ExitCode::from(1);
        }
    };
    tracing::info!("relay-gateway listening on {addr}");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("server error: {err}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
