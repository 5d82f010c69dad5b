use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use minerl_env::VersionInfo;
use minerl_env::bridge::connection::{one_shot, query_status};
use minerl_env::bridge::protocol::{Command, decode_ack};
use minerl_env::config::SOCKET_TIMEOUT;

struct Args {
    host: String,
    port: u16,
    timeout: Duration,
    reinit: Option<String>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("MINERL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("minerl_env={level},minerl_status={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        host: "127.0.0.1".to_string(),
        port: 9000,
        timeout: SOCKET_TIMEOUT,
        reinit: None,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                parsed.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                parsed.port = value
                    .parse()
                    .map_err(|_| format!("invalid port: {value}"))?;
            }
            "--timeout" => {
                i += 1;
                let value = args.get(i).ok_or("--timeout requires a value")?;
                let secs: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid timeout: {value}"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(format!("invalid timeout: {value}"));
                }
                parsed.timeout = Duration::from_secs_f64(secs);
            }
            "--reinit" => {
                i += 1;
                parsed.reinit = Some(args.get(i).ok_or("--reinit requires a token")?.clone());
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

async fn run(args: Args) -> anyhow::Result<()> {
    if let Some(token) = &args.reinit {
        let reply = one_shot(&args.host, args.port, args.timeout, Command::Init(token))
            .await
            .with_context(|| format!("reinit {}:{}", args.host, args.port))?;
        let ok = decode_ack("reinit", &reply)?;
        tracing::info!(ok, "Reinit acknowledged");
        println!("{}", serde_json::json!({ "reinit": ok }));
        return Ok(());
    }

    let status = query_status(&args.host, args.port, args.timeout)
        .await
        .with_context(|| format!("query status from {}:{}", args.host, args.port))?;
    let info = VersionInfo::new().with_remote_status(status);
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: minerl-status [--host <host>] [--port <port>] [--timeout <secs>] [--reinit <token>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>      Malmo client host [default: 127.0.0.1]");
            eprintln!("  --port <port>      Malmo mission port [default: 9000]");
            eprintln!("  --timeout <secs>   Socket timeout [default: 240]");
            eprintln!("  --reinit <token>   Reset the episode counter for a session token");
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
