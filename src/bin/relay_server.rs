//! Relay server binary
//!
//! Run with: relay-server [--bind ADDR] [--flv KEY=URL]... [--hls KEY=URL[,PREFERENCE]]...
//!
//! Examples:
//!   relay-server --flv room1=http://upstream:8080/live/room1.flv
//!   relay-server --bind 0.0.0.0:9000 \
//!       --flv room1=http://upstream:8080/live/room1.flv \
//!       --hls room2=http://upstream:8080/live/room2.m3u8,720
//!
//! Viewers attach at:
//!   http://<host>/live/flv/room1/<client-id>
//!   http://<host>/live/hls/room2/<client-id>/index.m3u8
//!
//! Camera uploads need no declaration; POST FLV bytes to
//!   http://<host>/live/camera/ingest/<key>
//! e.g. ffmpeg ... -f flv http://<host>/live/camera/ingest/cam1

use std::net::SocketAddr;

use relay_rs::server::{RelayConfig, RelayServer};

struct StreamArg {
    key: String,
    url: String,
    preference: Option<String>,
}

fn parse_stream_arg(arg: &str) -> Result<StreamArg, String> {
    let (key, rest) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=URL, got '{arg}'"))?;
    if key.is_empty() || rest.is_empty() {
        return Err(format!("expected KEY=URL, got '{arg}'"));
    }

    // An optional ",PREFERENCE" suffix picks an HLS variant
    let (url, preference) = match rest.rsplit_once(',') {
        Some((url, pref)) if !pref.contains('/') => (url, Some(pref.to_string())),
        _ => (rest, None),
    };

    Ok(StreamArg {
        key: key.to_string(),
        url: url.to_string(),
        preference,
    })
}

fn print_usage() {
    eprintln!("Usage: relay-server [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --bind ADDR       Address to listen on (default: 0.0.0.0:8080,");
    eprintln!("                    or LISTEN_ADDR from the environment)");
    eprintln!("  --flv KEY=URL     Declare a pulled-FLV stream");
    eprintln!("  --hls KEY=URL[,PREFERENCE]");
    eprintln!("                    Declare an HLS mirror; PREFERENCE picks a");
    eprintln!("                    master-playlist variant by substring");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  relay-server --flv room1=http://upstream:8080/live/room1.flv");
    eprintln!("  relay-server --hls room2=http://upstream:8080/live/room2.m3u8,720");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut bind: Option<String> = std::env::var("LISTEN_ADDR").ok();
    let mut flv_streams = Vec::new();
    let mut hls_streams = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut take_value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{name} requires a value"))
        };
        match arg.as_str() {
            "--bind" => bind = Some(take_value("--bind")?),
            "--flv" => {
                let value = take_value("--flv")?;
                flv_streams.push(parse_stream_arg(&value).map_err(anyhow::Error::msg)?);
            }
            "--hls" => {
                let value = take_value("--hls")?;
                hls_streams.push(parse_stream_arg(&value).map_err(anyhow::Error::msg)?);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let mut config = RelayConfig::default();
    if let Some(bind) = bind {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{bind}': {e}"))?;
        config = config.bind(addr);
    }

    let server = RelayServer::new(config);
    for stream in &flv_streams {
        tracing::info!(stream = %stream.key, url = %stream.url, "declaring flv stream");
        server.add_flv_stream(&stream.key, &stream.url);
    }
    for stream in &hls_streams {
        tracing::info!(stream = %stream.key, url = %stream.url, "declaring hls stream");
        server.add_hls_stream(&stream.key, &stream.url, stream.preference.clone())?;
    }

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
