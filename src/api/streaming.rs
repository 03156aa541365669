use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::Instrument;

use super::RequestContext;
use crate::error::GatewayError;
use crate::observability::{log_stream_complete, ConversionStats};
use crate::protocol::anthropic::{FrontEncoder, FrontEvent};
use crate::protocol::backend::UpstreamEvent;
use crate::stream::StreamConverter;

/// How a streamed response ended.
#[derive(Debug)]
pub enum PumpOutcome {
    /// The message trailer went out.
    Completed(ConversionStats),
    /// The client went away; upstream consumption stopped.
    ClientDisconnected,
    /// A terminal `error` event went out.
    Failed(GatewayError),
}

/// Drive one response: upstream events through the engine to `tx`, one SSE
/// frame per send.
///
/// Stops reading upstream as soon as the receiving side of `tx` is dropped,
/// or when no upstream event arrives within `idle_timeout`.
pub async fn pump<S>(
    upstream: S,
    converter: StreamConverter,
    encoder: FrontEncoder,
    tx: mpsc::Sender<Bytes>,
    ctx: &RequestContext,
    idle_timeout: Duration,
) -> PumpOutcome
where
    S: Stream<Item = Result<UpstreamEvent, GatewayError>>,
{
    let span = tracing::info_span!(
        "stream",
        request_id = %ctx.request_id,
        model = %ctx.backend_model
    );
    pump_inner(upstream, converter, encoder, tx, ctx, idle_timeout)
        .instrument(span)
        .await
}

async fn pump_inner<S>(
    upstream: S,
    mut converter: StreamConverter,
    mut encoder: FrontEncoder,
    tx: mpsc::Sender<Bytes>,
    ctx: &RequestContext,
    idle_timeout: Duration,
) -> PumpOutcome
where
    S: Stream<Item = Result<UpstreamEvent, GatewayError>>,
{
    let started = Instant::now();
    let mut upstream = std::pin::pin!(upstream);
    let mut events: Vec<FrontEvent> = Vec::with_capacity(8);

    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => {
                tracing::debug!("client disconnected, dropping upstream");
                return PumpOutcome::ClientDisconnected;
            }
            next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
        };

        let step = match next {
            Ok(None) => break,
            Ok(Some(Ok(event))) => converter.push(event, &mut events),
            Ok(Some(Err(err))) => Err(err),
            Err(_) => Err(GatewayError::Transport(format!(
                "no upstream data for {}s",
                idle_timeout.as_secs()
            ))),
        };

        if let Err(err) = step {
            tracing::warn!("stream terminated: {}", err);
            events.push(FrontEvent::from_error(&err));
            if send_events(&mut encoder, &mut events, &tx).await.is_err() {
                return PumpOutcome::ClientDisconnected;
            }
            return PumpOutcome::Failed(err);
        }
        if send_events(&mut encoder, &mut events, &tx).await.is_err() {
            tracing::debug!("client disconnected, dropping upstream");
            return PumpOutcome::ClientDisconnected;
        }
    }

    converter.finish(&mut events);
    if send_events(&mut encoder, &mut events, &tx).await.is_err() {
        return PumpOutcome::ClientDisconnected;
    }
    let stats = *converter.stats();
    log_stream_complete(&ctx.backend_model, &stats, started);
    PumpOutcome::Completed(stats)
}

struct ClientGone;

async fn send_events(
    encoder: &mut FrontEncoder,
    events: &mut Vec<FrontEvent>,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), ClientGone> {
    for event in events.drain(..) {
        let frame = encoder.encode_to_string(&event);
        tx.send(Bytes::from(frame)).await.map_err(|_| ClientGone)?;
    }
    Ok(())
}
