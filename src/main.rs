//! Replays a recorded backend SSE body (stdin) as a front-protocol response
//! (stdout).
//!
//! ```text
//! toolbridge [--config PATH] [--model NAME] [--buffered] < body.sse
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use toolbridge::api::{collect_message, pump, PumpOutcome, RequestContext, RequestIdGenerator};
use toolbridge::config::{load_config, AppConfig};
use toolbridge::observability::{init_tracing, TracingSink};
use toolbridge::protocol::anthropic::{new_message_id, FrontEncoder};
use toolbridge::protocol::backend::upstream_events;
use toolbridge::routing::ModelTierResolver;
use toolbridge::stream::{EngineOptions, StreamConverter};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_FRONT_MODEL: &str = "claude-sonnet-4-5";
const ENV_PREFIX: &str = "TOOLBRIDGE_";
const READ_CHUNK_BYTES: usize = 8 * 1024;

struct Args {
    config_path: Option<String>,
    model: String,
    buffered: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: None,
        model: DEFAULT_FRONT_MODEL.to_string(),
        buffered: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config_path = iter.next(),
            "--model" => {
                if let Some(model) = iter.next() {
                    args.model = model;
                }
            }
            "--buffered" => args.buffered = true,
            other => {
                eprintln!("Ignoring unknown argument '{other}'");
            }
        }
    }
    args
}

fn load_app_config(args: &Args) -> AppConfig {
    let path = args.config_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = if args.config_path.is_some() || std::path::Path::new(path).exists() {
        load_config(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration from '{path}': {e}");
            std::process::exit(1);
        })
    } else {
        AppConfig::default()
    };

    let env_pairs: Vec<(String, String)> = std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|suffix| (suffix.to_ascii_lowercase(), value))
        })
        .collect();
    config.merge_key_values(env_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    config
}

fn stdin_bytes() -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some(tokio::io::stdin()), |stdin| async move {
        let mut stdin = stdin?;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
        match stdin.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(stdin))),
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn main() {
    let args = parse_args();
    let config = load_app_config(&args);
    init_tracing(&config.features.log_level, config.features.log_format);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(run(args, config));
    std::process::exit(code);
}

async fn run(args: Args, config: AppConfig) -> i32 {
    let ids = RequestIdGenerator::new();
    let resolver = ModelTierResolver::new(config.model_tiers.clone());
    let ctx = RequestContext::new(&ids, &resolver, &args.model);
    tracing::info!(
        request_id = %ctx.request_id,
        front_model = %ctx.front_model,
        backend_model = %ctx.backend_model,
        context_window = ctx.limits.context_window,
        "replaying backend stream"
    );

    let converter = StreamConverter::new(EngineOptions::from(&config.stream), Arc::new(TracingSink));
    let upstream = upstream_events(stdin_bytes());

    if args.buffered {
        return match collect_message(upstream, converter, new_message_id(), &ctx).await {
            Ok(message) => match serde_json::to_string_pretty(&message) {
                Ok(body) => {
                    println!("{body}");
                    0
                }
                Err(e) => {
                    eprintln!("Failed to serialize response: {e}");
                    1
                }
            },
            Err(e) => {
                let (status, body) = toolbridge::error::format_error(&e);
                eprintln!("{} {}", status.as_u16(), body);
                1
            }
        };
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(config.stream.client_buffer_frames);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            if stdout.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = stdout.flush().await;
    });

    let outcome = pump(
        upstream,
        converter,
        FrontEncoder::new(ctx.front_model.clone()),
        tx,
        &ctx,
        Duration::from_secs(config.stream.idle_timeout_secs),
    )
    .await;
    let _ = writer.await;

    match outcome {
        PumpOutcome::Completed(_) | PumpOutcome::ClientDisconnected => 0,
        PumpOutcome::Failed(_) => 1,
    }
}
