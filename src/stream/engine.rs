//! Per-request conversion of backend tool-call fragments into front-protocol
//! stream events.
//!
//! Each backend `toolUseId` moves through
//! `UNSEEN -> REGISTERED -> (STREAMING | SKIPPED) -> CLOSED`:
//!
//! - REGISTERED: the call is known but nothing has been sent for it. Its
//!   opening text is not yet long enough to fingerprint, or an earlier call
//!   of the same tool has not settled yet. Calls announce in the order they
//!   were first seen, so the earliest id wins a fingerprint.
//! - STREAMING: the fingerprint was unique; `content_block_start` went out
//!   and argument text is forwarded through the tier-1 key rewrite.
//! - SKIPPED: the fingerprint belonged to an earlier call; every later
//!   fragment for the id is dropped.
//! - CLOSED: finalized. Tier-2 normalization ran and at most one trailing
//!   correction fragment was sent before `content_block_stop`.

use std::borrow::Cow;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::validation::FINGERPRINT_PREFIX_RANGE;
use crate::config::StreamConfig;
use crate::error::GatewayError;
use crate::fc::normalize::{normalize, parse_arguments, Args};
use crate::fc::reconcile::{close_prefix, complete};
use crate::fc::textual::{closing_suffix_len, rewriter_for, KeyRewriter};
use crate::observability::{
    ConversionStats, DiagnosticEvent, DiagnosticSink, Diagnostics, DropReason,
};
use crate::protocol::anthropic::{FrontEvent, FrontStopReason, FrontUsage};
use crate::protocol::backend::{ToolCallFragment, UpstreamEvent};
use crate::protocol::mapping::{backend_stop_to_front, resolve_stop_reason};
use crate::util::last_significant_byte;

/// Engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Characters of tier-1 text that make up a content fingerprint.
    pub fingerprint_prefix_chars: usize,
    /// Forward argument text as it arrives. When false, each call's arguments
    /// are sent in one piece at finalization.
    pub stream_arguments: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fingerprint_prefix_chars: 50,
            stream_arguments: true,
        }
    }
}

impl From<&StreamConfig> for EngineOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            fingerprint_prefix_chars: config.fingerprint_prefix_chars,
            stream_arguments: config.stream_tool_arguments,
        }
    }
}

/// What the engine did with one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDisposition {
    /// Accepted and buffered; the call is not announced yet.
    Registered,
    /// Accepted; ready text was forwarded.
    Forwarded,
    /// Accepted and the call was closed.
    Finalized,
    Duplicate,
    Ghost,
    Skipped,
    Malformed,
    Late,
}

impl From<DropReason> for FragmentDisposition {
    fn from(reason: DropReason) -> Self {
        match reason {
            DropReason::GhostStream => FragmentDisposition::Ghost,
            DropReason::DuplicateOperation => FragmentDisposition::Duplicate,
            DropReason::Skipped => FragmentDisposition::Skipped,
            DropReason::Malformed => FragmentDisposition::Malformed,
            DropReason::Late => FragmentDisposition::Late,
        }
    }
}

/// The materialized result of one tool call.
#[derive(Debug, Clone)]
pub struct FinalizedToolCall {
    pub id: String,
    pub name: String,
    /// Tier-2 arguments, or the conversion fault for this call.
    pub outcome: Result<Args, GatewayError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announce {
    Pending,
    Announced,
    Duplicate,
}

struct ActiveCall {
    id: String,
    tool_name: String,
    seq: u64,
    primary_stream_index: usize,
    /// Front block index, set once the call is announced.
    block_index: Option<usize>,
    /// Raw backend argument text.
    accumulated: String,
    /// Bytes of `accumulated` already rewritten and sent.
    forwarded_raw: usize,
    /// Tier-1 text sent to the client so far.
    emitted: String,
    /// Last significant raw byte before `forwarded_raw`.
    lead: Option<u8>,
    rewriter: Option<&'static KeyRewriter>,
    final_seen: bool,
    /// Fragments accepted before the call was announced.
    buffered_fragments: u64,
}

impl ActiveCall {
    fn new(id: String, tool_name: String, seq: u64, primary_stream_index: usize) -> Self {
        let rewriter = rewriter_for(&tool_name);
        Self {
            id,
            tool_name,
            seq,
            primary_stream_index,
            block_index: None,
            accumulated: String::new(),
            forwarded_raw: 0,
            emitted: String::new(),
            lead: None,
            rewriter,
            final_seen: false,
            buffered_fragments: 0,
        }
    }

    fn rewrite<'t>(&self, text: &'t str, lead: Option<u8>) -> Cow<'t, str> {
        match self.rewriter {
            Some(rewriter) => rewriter.rewrite(text, lead),
            None => Cow::Borrowed(text),
        }
    }

    /// Tier-1 rendering of everything received so far.
    fn rewritten_so_far(&self) -> Cow<'_, str> {
        self.rewrite(&self.accumulated, None)
    }

    fn is_pending(&self) -> bool {
        self.block_index.is_none()
    }

    /// Tier-1 rendering of the held-back tail.
    fn unsent(&self) -> Cow<'_, str> {
        self.rewrite(&self.accumulated[self.forwarded_raw..], self.lead)
    }

    /// Send the part of the raw tail that can no longer change.
    fn forward_ready(&mut self, out: &mut Vec<FrontEvent>) {
        let Some(index) = self.block_index else {
            return;
        };
        let pending = &self.accumulated[self.forwarded_raw..];
        let partial_token = self
            .rewriter
            .map_or(0, |rewriter| rewriter.pending_suffix_len(pending, self.lead));
        let hold = partial_token.max(closing_suffix_len(pending));
        let ready = pending.len() - hold;
        if ready == 0 {
            return;
        }
        let chunk = &pending[..ready];
        let rewritten = self.rewrite(chunk, self.lead).into_owned();
        self.lead = last_significant_byte(chunk).or(self.lead);
        self.forwarded_raw += ready;
        self.emitted.push_str(&rewritten);
        out.push(FrontEvent::InputJsonDelta {
            index,
            partial_json: rewritten,
        });
    }
}

/// The opening is settled once it is long enough to fingerprint, the call
/// is final, or the text is already a complete object.
fn opening_settled(normalized: &str, prefix_chars: usize, is_final: bool) -> bool {
    is_final
        || normalized.chars().nth(prefix_chars - 1).is_some()
        || (closing_suffix_len(normalized) > 0 && parse_arguments(normalized).is_ok())
}

/// `tool:prefix` of the tier-1 text. A call that ends without any argument
/// text fingerprints as the empty object it normalizes to.
fn fingerprint(tool_name: &str, normalized: &str, prefix_chars: usize) -> String {
    let opening = if normalized.trim().is_empty() {
        "{}"
    } else {
        normalized
    };
    let end = opening
        .char_indices()
        .nth(prefix_chars)
        .map_or(opening.len(), |(pos, _)| pos);
    let mut key = String::with_capacity(tool_name.len() + 1 + end);
    key.push_str(tool_name);
    key.push(':');
    key.push_str(&opening[..end]);
    key
}

/// Converts one request's backend event stream into front-protocol events.
///
/// One instance per request; all state is dropped with it.
pub struct StreamConverter {
    options: EngineOptions,
    diagnostics: Diagnostics,
    calls: FxHashMap<String, ActiveCall>,
    /// fingerprint -> first tool call id that produced it
    fingerprints: FxHashMap<String, String>,
    skip: FxHashSet<String>,
    closed: FxHashSet<String>,
    /// Resolves id-less continuation fragments.
    last_id_by_stream: FxHashMap<usize, String>,
    next_seq: u64,
    next_block_index: usize,
    text_block: Option<usize>,
    tool_blocks_started: usize,
    started: bool,
    finished: bool,
    backend_stop: Option<FrontStopReason>,
    usage: FrontUsage,
    finalized: Vec<FinalizedToolCall>,
}

impl StreamConverter {
    #[must_use]
    pub fn new(mut options: EngineOptions, sink: Arc<dyn DiagnosticSink>) -> Self {
        options.fingerprint_prefix_chars = options.fingerprint_prefix_chars.clamp(
            *FINGERPRINT_PREFIX_RANGE.start(),
            *FINGERPRINT_PREFIX_RANGE.end(),
        );
        Self {
            options,
            diagnostics: Diagnostics::new(sink),
            calls: FxHashMap::default(),
            fingerprints: FxHashMap::default(),
            skip: FxHashSet::default(),
            closed: FxHashSet::default(),
            last_id_by_stream: FxHashMap::default(),
            next_seq: 0,
            next_block_index: 0,
            text_block: None,
            tool_blocks_started: 0,
            started: false,
            finished: false,
            backend_stop: None,
            usage: FrontUsage::default(),
            finalized: Vec::new(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ConversionStats {
        self.diagnostics.stats()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn finalized_calls(&self) -> &[FinalizedToolCall] {
        &self.finalized
    }

    pub fn take_finalized(&mut self) -> Vec<FinalizedToolCall> {
        std::mem::take(&mut self.finalized)
    }

    #[must_use]
    pub fn usage(&self) -> FrontUsage {
        self.usage
    }

    /// Feed one upstream event, appending the resulting front events to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Upstream`] when the backend reports an error;
    /// the stream should be terminated with it.
    pub fn push(
        &mut self,
        event: UpstreamEvent,
        out: &mut Vec<FrontEvent>,
    ) -> Result<(), GatewayError> {
        if let UpstreamEvent::Error { status, message } = event {
            return Err(GatewayError::Upstream { status, message });
        }
        if self.finished {
            tracing::debug!("ignoring upstream event after stream end");
            return Ok(());
        }
        self.ensure_started(out);
        match event {
            UpstreamEvent::Text(text) => self.push_text(text, out),
            UpstreamEvent::ToolCall(fragment) => {
                self.process_fragment(fragment, out);
            }
            UpstreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage = FrontUsage {
                    input_tokens,
                    output_tokens,
                };
            }
            UpstreamEvent::End { stop_reason } => {
                if let Some(reason) = stop_reason {
                    self.backend_stop = Some(backend_stop_to_front(&reason));
                }
            }
            UpstreamEvent::Error { .. } => {}
        }
        Ok(())
    }

    /// Classify one tool-call fragment and emit whatever it makes ready.
    pub fn process_fragment(
        &mut self,
        fragment: ToolCallFragment,
        out: &mut Vec<FrontEvent>,
    ) -> FragmentDisposition {
        let ToolCallFragment {
            id,
            stream_index,
            tool_name,
            argument_text,
            is_final,
        } = fragment;

        let id = match id {
            Some(id) => id,
            None => match self.last_id_by_stream.get(&stream_index) {
                Some(id) => id.clone(),
                None => return self.drop_fragment(DropReason::Malformed, None, stream_index),
            },
        };

        if self.skip.contains(&id) {
            return self.drop_fragment(DropReason::Skipped, Some(id), stream_index);
        }
        if self.closed.contains(&id) {
            return self.drop_fragment(DropReason::Late, Some(id), stream_index);
        }
        let primary_stream_index = self.calls.get(&id).map(|call| call.primary_stream_index);
        match primary_stream_index {
            Some(primary) if primary != stream_index => {
                return self.drop_fragment(DropReason::GhostStream, Some(id), stream_index);
            }
            Some(_) => {}
            None => {
                let Some(name) = tool_name else {
                    return self.drop_fragment(DropReason::Malformed, Some(id), stream_index);
                };
                tracing::debug!(
                    tool_call_id = %id,
                    tool = %name,
                    stream_index,
                    "registered tool call"
                );
                self.next_seq += 1;
                let call = ActiveCall::new(id.clone(), name, self.next_seq, stream_index);
                self.calls.insert(id.clone(), call);
            }
        }

        // only fragments accepted on the call's own index re-point it
        self.last_id_by_stream.insert(stream_index, id.clone());

        let disposition = self.accept(&id, &argument_text, is_final, out);
        match disposition {
            FragmentDisposition::Registered => {
                if let Some(call) = self.calls.get_mut(&id) {
                    call.buffered_fragments += 1;
                }
            }
            FragmentDisposition::Forwarded | FragmentDisposition::Finalized => {
                self.diagnostics.stats.fragments_forwarded += 1;
            }
            _ => {}
        }
        disposition
    }

    /// Close everything still open and emit the message trailer.
    pub fn finish(&mut self, out: &mut Vec<FrontEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);

        let mut open: Vec<(u64, String)> = self
            .calls
            .values_mut()
            .map(|call| {
                call.final_seen = true;
                (call.seq, call.id.clone())
            })
            .collect();
        open.sort_unstable();
        for (_, id) in open {
            if !self.calls.contains_key(&id) {
                continue;
            }
            tracing::debug!(tool_call_id = %id, "finalizing tool call left open at stream end");
            self.advance(&id, out);
        }

        self.close_text_block(out);
        let stop_reason = resolve_stop_reason(self.backend_stop, self.tool_blocks_started > 0);
        out.push(FrontEvent::MessageDelta {
            stop_reason,
            usage: self.usage,
        });
        out.push(FrontEvent::MessageStop);
        self.finished = true;

        let stats = *self.diagnostics.stats();
        self.diagnostics.report(DiagnosticEvent::StreamCompleted(stats));
    }

    fn ensure_started(&mut self, out: &mut Vec<FrontEvent>) {
        if !self.started {
            self.started = true;
            out.push(FrontEvent::MessageStart);
        }
    }

    fn push_text(&mut self, text: String, out: &mut Vec<FrontEvent>) {
        if text.is_empty() {
            return;
        }
        let index = match self.text_block {
            Some(index) => index,
            None => {
                let index = self.allocate_block();
                self.text_block = Some(index);
                out.push(FrontEvent::TextBlockStart { index });
                index
            }
        };
        out.push(FrontEvent::TextDelta { index, text });
    }

    fn allocate_block(&mut self) -> usize {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn close_text_block(&mut self, out: &mut Vec<FrontEvent>) {
        if let Some(index) = self.text_block.take() {
            out.push(FrontEvent::BlockStop { index });
        }
    }

    fn drop_fragment(
        &mut self,
        reason: DropReason,
        tool_call_id: Option<String>,
        stream_index: usize,
    ) -> FragmentDisposition {
        tracing::debug!(
            ?reason,
            tool_call_id = tool_call_id.as_deref().unwrap_or("-"),
            stream_index,
            "dropped tool call fragment"
        );
        self.diagnostics.stats.count_drop(reason);
        self.diagnostics.report(DiagnosticEvent::FragmentDropped {
            reason,
            tool_call_id,
            stream_index,
        });
        reason.into()
    }

    fn accept(
        &mut self,
        id: &str,
        text: &str,
        is_final: bool,
        out: &mut Vec<FrontEvent>,
    ) -> FragmentDisposition {
        let Some(call) = self.calls.get_mut(id) else {
            return FragmentDisposition::Duplicate;
        };
        call.accumulated.push_str(text);
        call.final_seen |= is_final;
        let was_pending = call.is_pending();
        let tool_name = call.tool_name.clone();

        let disposition = self.advance(id, out);
        if was_pending && disposition != FragmentDisposition::Registered {
            self.release_waiting(&tool_name, out);
        }
        disposition
    }

    /// Move a call as far as its buffered text allows: announce it, forward
    /// ready text, and finalize it once its last fragment is in.
    fn advance(&mut self, id: &str, out: &mut Vec<FrontEvent>) -> FragmentDisposition {
        let Some(is_final) = self.calls.get(id).map(|call| call.final_seen) else {
            return FragmentDisposition::Duplicate;
        };
        match self.try_announce(id, out) {
            Announce::Pending => FragmentDisposition::Registered,
            Announce::Duplicate => FragmentDisposition::Duplicate,
            Announce::Announced if is_final => {
                self.finalize(id, out);
                FragmentDisposition::Finalized
            }
            Announce::Announced => {
                if self.options.stream_arguments {
                    if let Some(call) = self.calls.get_mut(id) {
                        call.forward_ready(out);
                    }
                }
                FragmentDisposition::Forwarded
            }
        }
    }

    /// Retry calls of `tool_name` that were waiting on an earlier one, in
    /// the order they were seen.
    fn release_waiting(&mut self, tool_name: &str, out: &mut Vec<FrontEvent>) {
        let mut waiting: Vec<(u64, String)> = self
            .calls
            .values()
            .filter(|call| call.is_pending() && call.tool_name == tool_name)
            .map(|call| (call.seq, call.id.clone()))
            .collect();
        waiting.sort_unstable();
        for (_, id) in waiting {
            if self.advance(&id, out) == FragmentDisposition::Registered {
                break;
            }
        }
    }

    /// Announce a registered call once its opening settles and no earlier
    /// call of the same tool is still unsettled, unless its fingerprint
    /// belongs to an earlier call.
    fn try_announce(&mut self, id: &str, out: &mut Vec<FrontEvent>) -> Announce {
        let prefix_chars = self.options.fingerprint_prefix_chars;
        let Some(call) = self.calls.get(id) else {
            return Announce::Duplicate;
        };
        if !call.is_pending() {
            return Announce::Announced;
        }
        let blocked = self.calls.values().any(|other| {
            other.seq < call.seq && other.is_pending() && other.tool_name == call.tool_name
        });
        if blocked {
            return Announce::Pending;
        }

        let (key, stream_index, tool_name, buffered) = {
            let normalized = call.rewritten_so_far();
            if !opening_settled(&normalized, prefix_chars, call.final_seen) {
                return Announce::Pending;
            }
            (
                fingerprint(&call.tool_name, &normalized, prefix_chars),
                call.primary_stream_index,
                call.tool_name.clone(),
                call.buffered_fragments,
            )
        };

        if let Some(owner) = self.fingerprints.get(&key).cloned() {
            self.calls.remove(id);
            self.skip.insert(id.to_string());
            self.diagnostics.report(DiagnosticEvent::FingerprintCollision {
                fingerprint: key,
                owner,
                duplicate: id.to_string(),
            });
            self.drop_fragment(
                DropReason::DuplicateOperation,
                Some(id.to_string()),
                stream_index,
            );
            return Announce::Duplicate;
        }
        self.fingerprints.insert(key, id.to_string());

        self.close_text_block(out);
        let index = self.allocate_block();
        if let Some(call) = self.calls.get_mut(id) {
            call.block_index = Some(index);
        }
        self.tool_blocks_started += 1;
        self.diagnostics.stats.fragments_forwarded += buffered;
        out.push(FrontEvent::ToolUseStart {
            index,
            id: id.to_string(),
            name: tool_name,
        });
        Announce::Announced
    }

    fn finalize(&mut self, id: &str, out: &mut Vec<FrontEvent>) {
        let Some(mut call) = self.calls.remove(id) else {
            return;
        };
        self.closed.insert(call.id.clone());
        let Some(index) = call.block_index else {
            return;
        };

        let outcome = match parse_arguments(&call.accumulated) {
            Ok(raw) => {
                if self.options.stream_arguments {
                    call.forward_ready(out);
                }
                let authoritative = normalize(&call.tool_name, raw);
                let unsent = call.unsent();
                let completion = complete(&call.emitted, &unsent, &authoritative);
                if !completion.text.is_empty() {
                    out.push(FrontEvent::InputJsonDelta {
                        index,
                        partial_json: completion.text,
                    });
                }
                if let Some(correction) = completion.correction {
                    if !call.emitted.is_empty() {
                        tracing::debug!(
                            tool_call_id = %call.id,
                            bytes = correction.len(),
                            "appending argument correction"
                        );
                        self.diagnostics.stats.corrections_emitted += 1;
                        self.diagnostics.report(DiagnosticEvent::CorrectionEmitted {
                            tool_call_id: call.id.clone(),
                            bytes: correction.len(),
                        });
                    }
                    out.push(FrontEvent::InputJsonDelta {
                        index,
                        partial_json: correction,
                    });
                }
                if !completion.residual.is_empty() {
                    tracing::warn!(
                        tool_call_id = %call.id,
                        members = ?completion.residual,
                        "streamed arguments keep members the normalized call does not have"
                    );
                    self.diagnostics.stats.unpatchable_calls += 1;
                    self.diagnostics.report(DiagnosticEvent::UnpatchableMembers {
                        tool_call_id: call.id.clone(),
                        members: completion.residual,
                    });
                }
                Ok(authoritative)
            }
            Err(message) => {
                // the unparseable tail stays back; close what was sent
                let closing = if call.emitted.trim().is_empty() {
                    Some("{}".to_string())
                } else {
                    close_prefix(&call.emitted)
                };
                match closing {
                    Some(partial_json) => out.push(FrontEvent::InputJsonDelta {
                        index,
                        partial_json,
                    }),
                    None => tracing::warn!(
                        tool_call_id = %call.id,
                        "streamed arguments cannot be closed into an object"
                    ),
                }
                tracing::warn!(
                    tool_call_id = %call.id,
                    tool = %call.tool_name,
                    "tool call arguments could not be converted: {}",
                    message
                );
                self.diagnostics.stats.conversion_faults += 1;
                self.diagnostics.report(DiagnosticEvent::ParseFailure {
                    tool_call_id: call.id.clone(),
                    message: message.clone(),
                });
                Err(GatewayError::Conversion {
                    tool_call_id: call.id.clone(),
                    message,
                })
            }
        };

        out.push(FrontEvent::BlockStop { index });
        if let Err(err) = &outcome {
            self.push_fault_notice(&call.id, &call.tool_name, err, out);
        }
        self.diagnostics.stats.tool_calls_finalized += 1;
        self.finalized.push(FinalizedToolCall {
            id: call.id,
            name: call.tool_name,
            outcome,
        });
    }

    /// Tell the client, in its own text block, that a call's arguments
    /// could not be converted.
    fn push_fault_notice(
        &mut self,
        id: &str,
        tool_name: &str,
        err: &GatewayError,
        out: &mut Vec<FrontEvent>,
    ) {
        self.close_text_block(out);
        let index = self.allocate_block();
        out.push(FrontEvent::TextBlockStart { index });
        out.push(FrontEvent::TextDelta {
            index,
            text: fault_notice(id, tool_name, err),
        });
        out.push(FrontEvent::BlockStop { index });
    }
}

fn fault_notice(id: &str, tool_name: &str, err: &GatewayError) -> String {
    format!("[tool call {id} ({tool_name}) failed: {err}]")
}

impl std::fmt::Debug for StreamConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConverter")
            .field("options", &self.options)
            .field("open_calls", &self.calls.len())
            .field("skipped", &self.skip.len())
            .field("closed", &self.closed.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{NullSink, RecordingSink};
    use serde_json::{json, Value};

    fn converter() -> StreamConverter {
        StreamConverter::new(EngineOptions::default(), Arc::new(NullSink))
    }

    fn fragment(id: Option<&str>, index: usize, name: Option<&str>, text: &str, is_final: bool) -> ToolCallFragment {
        ToolCallFragment {
            id: id.map(str::to_string),
            stream_index: index,
            tool_name: name.map(str::to_string),
            argument_text: text.to_string(),
            is_final,
        }
    }

    fn tool(id: &str, text: &str, is_final: bool) -> ToolCallFragment {
        fragment(Some(id), 0, Some("Bash"), text, is_final)
    }

    fn client_text(events: &[FrontEvent], block: usize) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                FrontEvent::InputJsonDelta {
                    index,
                    partial_json,
                } if *index == block => Some(partial_json.as_str()),
                _ => None,
            })
            .collect()
    }

    fn tool_starts(events: &[FrontEvent]) -> Vec<(usize, String)> {
        events
            .iter()
            .filter_map(|event| match event {
                FrontEvent::ToolUseStart { index, id, .. } => Some((*index, id.clone())),
                _ => None,
            })
            .collect()
    }

    fn finalized_input(converter: &StreamConverter, id: &str) -> Value {
        let call = converter
            .finalized_calls()
            .iter()
            .find(|call| call.id == id)
            .expect("call finalized");
        Value::Object(call.outcome.clone().expect("call converted"))
    }

    #[test]
    fn renamed_key_is_rewritten_in_stream_and_final_call() {
        let mut engine = converter();
        let mut out = Vec::new();
        assert_eq!(
            engine.process_fragment(tool("t1", "{\"prompt\":\"ls", false), &mut out),
            FragmentDisposition::Registered
        );
        assert_eq!(
            engine.process_fragment(tool("t1", " -la\"}", true), &mut out),
            FragmentDisposition::Finalized
        );
        assert_eq!(client_text(&out, 0), "{\"command\":\"ls -la\"}");
        assert_eq!(finalized_input(&engine, "t1"), json!({"command": "ls -la"}));
        assert_eq!(out.last(), Some(&FrontEvent::BlockStop { index: 0 }));
    }

    #[test]
    fn rename_split_across_chunks_is_held_back() {
        let mut engine = StreamConverter::new(
            EngineOptions {
                fingerprint_prefix_chars: 8,
                stream_arguments: true,
            },
            Arc::new(NullSink),
        );
        let mut out = Vec::new();
        engine.process_fragment(tool("t1", "{\"timeout\":10,\"pro", false), &mut out);
        let sent_before: String = client_text(&out, 0);
        assert!(!sent_before.contains("\"pro"), "partial token forwarded: {sent_before}");
        engine.process_fragment(tool("t1", "mpt\" :\"pwd\"}", true), &mut out);
        assert_eq!(client_text(&out, 0), "{\"timeout\":10,\"command\" :\"pwd\"}");
    }

    #[test]
    fn long_arguments_stream_before_the_call_ends() {
        let mut engine = converter();
        let mut out = Vec::new();
        let opening = format!("{{\"prompt\":\"echo {}", "a".repeat(60));
        assert_eq!(
            engine.process_fragment(tool("t1", &opening, false), &mut out),
            FragmentDisposition::Forwarded
        );
        assert!(client_text(&out, 0).starts_with("{\"command\":\"echo aaa"));
        engine.process_fragment(tool("t1", "\"}", true), &mut out);
        let text = client_text(&out, 0);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["command"], format!("echo {}", "a".repeat(60)));
    }

    #[test]
    fn duplicate_operation_is_dropped_before_registration() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = StreamConverter::new(EngineOptions::default(), sink.clone());
        let mut out = Vec::new();
        engine.process_fragment(tool("t1", "{\"prompt\":\"ls", false), &mut out);
        engine.process_fragment(tool("t1", " -la\"}", true), &mut out);
        assert_eq!(
            engine.process_fragment(tool("t2", "{\"command\":\"ls -la\"}", false), &mut out),
            FragmentDisposition::Duplicate
        );
        assert_eq!(
            engine.process_fragment(tool("t2", "", true), &mut out),
            FragmentDisposition::Skipped
        );
        assert_eq!(tool_starts(&out), vec![(0, "t1".to_string())]);
        assert_eq!(engine.finalized_calls().len(), 1);
        assert_eq!(engine.stats().duplicate_dropped, 1);
        assert_eq!(engine.stats().skipped_dropped, 1);
        assert!(sink.events().iter().any(|event| matches!(
            event,
            DiagnosticEvent::FingerprintCollision { owner, duplicate, .. }
                if owner == "t1" && duplicate == "t2"
        )));
    }

    #[test]
    fn ghost_stream_fragments_are_dropped_without_skipping_the_id() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("t1"), 0, Some("Read"), "{\"path\":", false), &mut out);
        assert_eq!(
            engine.process_fragment(fragment(Some("t1"), 1, Some("Read"), "{\"path\":", false), &mut out),
            FragmentDisposition::Ghost
        );
        engine.process_fragment(fragment(Some("t1"), 0, None, "\"/tmp/a\"}", true), &mut out);
        assert_eq!(finalized_input(&engine, "t1"), json!({"file_path": "/tmp/a"}));
        assert_eq!(engine.stats().ghost_dropped, 1);
        assert_eq!(engine.stats().skipped_dropped, 0);
    }

    #[test]
    fn idless_continuations_resolve_by_stream_index() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("t1"), 0, Some("Glob"), "", false), &mut out);
        engine.process_fragment(fragment(None, 0, None, "{\"glob\":\"*.rs\"}", false), &mut out);
        assert_eq!(
            engine.process_fragment(fragment(None, 0, None, "", true), &mut out),
            FragmentDisposition::Finalized
        );
        assert_eq!(client_text(&out, 0), "{\"pattern\":\"*.rs\"}");
        assert_eq!(
            engine.process_fragment(fragment(None, 0, None, "x", false), &mut out),
            FragmentDisposition::Late
        );
    }

    #[test]
    fn fragments_without_name_or_registration_are_malformed() {
        let mut engine = converter();
        let mut out = Vec::new();
        assert_eq!(
            engine.process_fragment(fragment(None, 3, None, "{}", true), &mut out),
            FragmentDisposition::Malformed
        );
        assert_eq!(
            engine.process_fragment(fragment(Some("t9"), 0, None, "{}", true), &mut out),
            FragmentDisposition::Malformed
        );
        assert_eq!(engine.stats().malformed_dropped, 2);
        assert!(out.is_empty());
    }

    #[test]
    fn missing_defaults_are_appended_as_correction() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(
            fragment(Some("t1"), 0, Some("Task"), "{\"prompt\":\"investigate X\"}", true),
            &mut out,
        );
        assert_eq!(
            client_text(&out, 0),
            "{\"description\":\"investigate X\",\"subagent_type\":\"Explore\"}"
        );
        assert_eq!(engine.stats().corrections_emitted, 1);
    }

    #[test]
    fn enum_values_are_coerced_through_the_correction() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(
            fragment(
                Some("t1"),
                0,
                Some("Grep"),
                "{\"query\":\"fn main\",\"output_mode\":\"Files_With_Matches\"}",
                true,
            ),
            &mut out,
        );
        let value: Value = serde_json::from_str(&client_text(&out, 0)).unwrap();
        assert_eq!(
            value,
            json!({"pattern": "fn main", "output_mode": "files_with_matches"})
        );
        assert_eq!(value, finalized_input(&engine, "t1"));
    }

    #[test]
    fn escaped_source_key_is_reported_unpatchable() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = StreamConverter::new(EngineOptions::default(), sink.clone());
        let mut out = Vec::new();
        engine.process_fragment(tool("t1", "{\"pr\\u006fmpt\":\"ls\"}", true), &mut out);
        assert_eq!(engine.stats().unpatchable_calls, 1);
        assert_eq!(finalized_input(&engine, "t1"), json!({"command": "ls"}));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            DiagnosticEvent::UnpatchableMembers { members, .. } if members == &vec!["prompt".to_string()]
        )));
    }

    #[test]
    fn invalid_json_is_a_conversion_fault_for_that_call_only() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(tool("t1", "{\"prompt\":\"ls\"", true), &mut out);
        engine.process_fragment(tool("t2", "{\"prompt\":\"pwd\"}", true), &mut out);
        let calls = engine.finalized_calls();
        assert!(matches!(
            calls[0].outcome,
            Err(GatewayError::Conversion { ref tool_call_id, .. }) if tool_call_id == "t1"
        ));
        assert!(calls[1].outcome.is_ok());
        assert_eq!(engine.stats().conversion_faults, 1);

        // the broken call still closes as an object, followed by a notice
        assert_eq!(client_text(&out, 0), "{}");
        let stop = out
            .iter()
            .position(|event| *event == FrontEvent::BlockStop { index: 0 })
            .expect("tool block closed");
        assert_eq!(out[stop + 1], FrontEvent::TextBlockStart { index: 1 });
        assert!(out.iter().any(|event| matches!(
            event,
            FrontEvent::TextDelta { index: 1, text } if text.starts_with("[tool call t1 (Bash) failed:")
        )));
        assert_eq!(tool_starts(&out), vec![(0, "t1".to_string()), (2, "t2".to_string())]);
    }

    #[test]
    fn streamed_prefix_of_a_broken_call_is_closed() {
        let mut engine = converter();
        let mut out = Vec::new();
        let opening = format!("{{\"prompt\":\"echo {}", "b".repeat(60));
        engine.process_fragment(tool("t1", &opening, false), &mut out);
        engine.process_fragment(tool("t1", "\" oops}", true), &mut out);
        let value: Value = serde_json::from_str(&client_text(&out, 0)).unwrap();
        assert!(value["command"].as_str().unwrap().starts_with("echo bbb"));
        assert!(engine.finalized_calls()[0].outcome.is_err());
    }

    #[test]
    fn finish_closes_open_calls_and_picks_stop_reason() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine
            .push(UpstreamEvent::Text("Running it.".into()), &mut out)
            .unwrap();
        engine
            .push(UpstreamEvent::ToolCall(tool("t1", "{\"prompt\":\"ls\"}", false)), &mut out)
            .unwrap();
        engine
            .push(
                UpstreamEvent::End {
                    stop_reason: Some("end_turn".into()),
                },
                &mut out,
            )
            .unwrap();
        engine.finish(&mut out);

        assert_eq!(out[0], FrontEvent::MessageStart);
        assert_eq!(out[1], FrontEvent::TextBlockStart { index: 0 });
        assert_eq!(out[3], FrontEvent::BlockStop { index: 0 });
        assert_eq!(tool_starts(&out), vec![(1, "t1".to_string())]);
        assert_eq!(client_text(&out, 1), "{\"command\":\"ls\"}");
        assert!(matches!(
            out[out.len() - 2],
            FrontEvent::MessageDelta {
                stop_reason: FrontStopReason::ToolUse,
                ..
            }
        ));
        assert_eq!(out.last(), Some(&FrontEvent::MessageStop));
        assert!(engine.is_finished());
        assert_eq!(engine.stats().tool_calls_finalized, 1);
    }

    #[test]
    fn buffered_arguments_are_sent_once_at_finalization() {
        let mut engine = StreamConverter::new(
            EngineOptions {
                fingerprint_prefix_chars: 8,
                stream_arguments: false,
            },
            Arc::new(NullSink),
        );
        let mut out = Vec::new();
        engine.process_fragment(
            fragment(Some("t1"), 0, Some("Task"), "{\"prompt\":\"look around the repo\"", false),
            &mut out,
        );
        assert!(client_text(&out, 0).is_empty());
        engine.process_fragment(fragment(Some("t1"), 0, None, "}", true), &mut out);
        let deltas = out
            .iter()
            .filter(|event| matches!(event, FrontEvent::InputJsonDelta { .. }))
            .count();
        assert_eq!(deltas, 1);
        let value: Value = serde_json::from_str(&client_text(&out, 0)).unwrap();
        assert_eq!(
            value,
            json!({"description": "look around the repo", "subagent_type": "Explore"})
        );
        assert_eq!(engine.stats().corrections_emitted, 0);
    }

    #[test]
    fn upstream_error_is_returned() {
        let mut engine = converter();
        let mut out = Vec::new();
        let err = engine
            .push(
                UpstreamEvent::Error {
                    status: 400,
                    message: "Invalid model".into(),
                },
                &mut out,
            )
            .unwrap_err();
        assert!(err.is_upstream_rejection());
        assert!(out.is_empty());
    }

    #[test]
    fn empty_arguments_become_an_empty_object() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("t1"), 0, Some("TodoRead"), "", true), &mut out);
        assert_eq!(client_text(&out, 0), "{}");
        assert_eq!(finalized_input(&engine, "t1"), json!({}));
    }

    #[test]
    fn fingerprint_covers_empty_openings() {
        assert_eq!(fingerprint("TodoRead", "{}", 50), "TodoRead:{}");
        assert_eq!(fingerprint("TodoRead", "", 50), "TodoRead:{}");
        assert_eq!(
            fingerprint("Bash", "{\"command\":\"ls -la\"}", 8),
            "Bash:{\"comman"
        );
    }

    #[test]
    fn earliest_call_wins_when_a_later_duplicate_settles_first() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("a"), 0, Some("Bash"), "{\"command\":\"ls", false), &mut out);
        assert_eq!(
            engine.process_fragment(
                fragment(Some("b"), 1, Some("Bash"), "{\"command\":\"ls -la\"}", true),
                &mut out
            ),
            FragmentDisposition::Registered
        );
        assert_eq!(
            engine.process_fragment(fragment(None, 0, None, " -la\"}", true), &mut out),
            FragmentDisposition::Finalized
        );
        assert_eq!(tool_starts(&out), vec![(0, "a".to_string())]);
        assert_eq!(engine.stats().duplicate_dropped, 1);
        assert_eq!(engine.stats().fragments_forwarded, 2);
    }

    #[test]
    fn waiting_call_with_distinct_arguments_is_announced_after_the_earlier_one() {
        let mut engine = converter();
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("a"), 0, Some("Read"), "{\"path\":\"/a", false), &mut out);
        engine.process_fragment(fragment(Some("b"), 1, Some("Read"), "{\"path\":\"/b\"}", true), &mut out);
        assert!(tool_starts(&out).is_empty());
        engine.process_fragment(fragment(Some("a"), 0, None, "\"}", true), &mut out);
        assert_eq!(
            tool_starts(&out),
            vec![(0, "a".to_string()), (1, "b".to_string())]
        );
        assert_eq!(finalized_input(&engine, "b"), json!({"file_path": "/b"}));
        assert_eq!(engine.stats().fragments_forwarded, 3);
    }

    #[test]
    fn prefix_length_is_clamped_to_the_configurable_range() {
        let mut engine = StreamConverter::new(
            EngineOptions {
                fingerprint_prefix_chars: 0,
                stream_arguments: true,
            },
            Arc::new(NullSink),
        );
        assert_eq!(engine.options.fingerprint_prefix_chars, 8);
        let mut out = Vec::new();
        engine.process_fragment(fragment(Some("a"), 0, Some("Fetch"), "{\"u\":\"a\"}", true), &mut out);
        engine.process_fragment(fragment(Some("b"), 1, Some("Fetch"), "{\"u\":\"b\"}", true), &mut out);
        assert_eq!(
            tool_starts(&out),
            vec![(0, "a".to_string()), (1, "b".to_string())]
        );

        let wide = StreamConverter::new(
            EngineOptions {
                fingerprint_prefix_chars: usize::MAX,
                stream_arguments: true,
            },
            Arc::new(NullSink),
        );
        assert_eq!(wide.options.fingerprint_prefix_chars, 1024);
    }
}
