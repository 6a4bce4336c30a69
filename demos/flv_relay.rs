//! FLV Relay - replays an FLV file as a live stream to HTTP-FLV viewers
//!
//! Run with: cargo run --example flv_relay -- input.flv [BIND_ADDR]
//!
//! The file is published under `live/<file stem>` and paced by its
//! timestamps. Each viewer request gets its own consumer and joins at the
//! current point of the stream.
//!
//! # Architecture
//!
//! ```text
//!   input.flv ──> publish_flv ──> Broadcaster ──┬──> Consumer ──> viewer 1
//!                                               ├──> Consumer ──> viewer 2
//!                                               └──> Consumer ──> viewer N
//! ```

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use flv_relay::ingest::{publish_flv, IngestConfig};
use flv_relay::media::FlvReader;
use flv_relay::registry::{Broadcaster, StreamKey, StreamRegistry};
use flv_relay::Consumer;

/// Bytes buffered between a consumer and its HTTP response body
const PIPE_CAPACITY: usize = 64 * 1024;

fn print_usage() {
    eprintln!("Usage: flv_relay INPUT.flv [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  INPUT.flv    FLV file to replay as a live stream");
    eprintln!("  BIND_ADDR    Address to serve viewers on (default: 0.0.0.0:8080)");
    eprintln!();
    eprintln!("Play with:");
    eprintln!("  ffplay http://localhost:8080/live/<file stem>.flv");
}

/// `GET /{app}/{name}`: stream one consumer as the response body
async fn play(
    State(registry): State<Arc<StreamRegistry>>,
    UrlPath((app, name)): UrlPath<(String, String)>,
) -> Response {
    let Some(key) = StreamKey::from_path(&format!("{}/{}", app, name)) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let subscribed = match registry.lookup(&key).await {
        Ok(broadcaster) => broadcaster
            .subscribe()
            .await
            .map(|consumer| (broadcaster, consumer)),
        Err(e) => Err(e),
    };
    let (broadcaster, consumer) = match subscribed {
        Ok(pair) => pair,
        Err(e) => {
            tracing::info!(stream = %key, error = %e, "Viewer refused");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
    };

    tracing::info!(stream = %key, subscriber = %consumer.id(), "Viewer joined");

    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(relay(broadcaster, consumer, writer));

    (
        [
            (header::CONTENT_TYPE, "video/x-flv"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

/// Drain a consumer into the response pipe, then detach it
///
/// The pipe breaks when the client goes away and the response body is
/// dropped, which ends the drain with a delivery error.
async fn relay(broadcaster: Arc<Broadcaster>, mut consumer: Consumer, mut writer: DuplexStream) {
    let result = consumer.drain(&mut writer).await;
    broadcaster.unsubscribe(consumer.id()).await;
    let _ = writer.shutdown().await;

    let stats = consumer.stats();
    match result {
        Ok(()) => tracing::info!(
            stream = %consumer.stream_key(),
            delivered_units = stats.delivered_units,
            dropped_units = stats.dropped_units,
            "Viewer finished"
        ),
        Err(e) => tracing::info!(
            stream = %consumer.stream_key(),
            delivered_units = stats.delivered_units,
            dropped_units = stats.dropped_units,
            error = %e,
            "Viewer left"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let input = Path::new(&args[1]).to_path_buf();
    let bind_addr: SocketAddr = match args.get(2) {
        Some(addr) => addr.parse()?,
        None => "0.0.0.0:8080".parse()?,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flv_relay=debug".parse()?),
        )
        .init();

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or("input file has no usable name")?;
    let key = StreamKey::new("live", stem);
    let registry = Arc::new(StreamRegistry::new());

    let ingest = {
        let registry = Arc::clone(&registry);
        let key = key.clone();
        let file = tokio::fs::File::open(&input).await?;
        tokio::spawn(async move {
            let mut reader = FlvReader::new(tokio::io::BufReader::new(file));
            let config = IngestConfig::default().realtime(true);
            publish_flv(&registry, &key, &mut reader, config).await
        })
    };

    let app = Router::new()
        .route("/{app}/{name}", get(play))
        .with_state(Arc::clone(&registry));

    let listener = TcpListener::bind(bind_addr).await?;
    println!("Serving {} at http://{}/{}.flv", input.display(), bind_addr, key);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        result = ingest => {
            match result? {
                Ok(summary) => println!("Input finished after {} units", summary.published_units),
                Err(e) => eprintln!("Ingest error: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    Ok(())
}
