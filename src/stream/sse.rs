/// SSE (Server-Sent Events) frame parser, encoder, and stream utilities.
///
/// Handles the low-level parsing of SSE frames from the backend byte stream,
/// including buffering partial lines and UTF-8 sequences split across chunks,
/// and the named-event framing of the front protocol.
use super::SseEvent;
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;

struct PendingEvents {
    events: SmallVec<[SseEvent; 8]>,
    head: usize,
}

impl PendingEvents {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        let mut events = SmallVec::new();
        events.reserve(capacity);
        Self { events, head: 0 }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<SseEvent> {
        if self.head >= self.events.len() {
            return None;
        }
        let event = std::mem::take(&mut self.events[self.head]);
        self.head += 1;
        if self.head == self.events.len() {
            self.events.clear();
            self.head = 0;
        }
        Some(event)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<SseEvent>) {
        if parsed.is_empty() {
            return;
        }
        self.events.reserve(parsed.len());
        self.events.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// SseParser: incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
        }
    }

    /// Feed raw text and return any complete events parsed.
    ///
    /// - `event:` sets the event type for the next frame
    /// - `data:` appends to the data buffer (one leading space stripped);
    ///   multiple `data:` lines are joined with `\n`
    /// - an empty line terminates a frame
    /// - lines starting with `:` are comments
    /// - `id:` sets the last event ID; `retry:` is ignored
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush a frame left open when the body ended without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let tail = self.buffer.split_off(self.read_offset);
        self.buffer.clear();
        self.read_offset = 0;
        let mut out = Vec::new();
        if !tail.is_empty() {
            let line = tail.strip_suffix('\r').unwrap_or(&tail);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                &mut out,
            );
        }
        Self::process_line(
            "",
            &mut self.event_type,
            &mut self.data_buffer,
            &mut self.has_data,
            &mut self.last_event_id,
            &mut out,
        );
        out.pop()
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                });
                *has_data = false;
            } else {
                // A named event without data carries nothing.
                *event_type = None;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *last_event_id = Some(value.to_string());
        }
        // Unknown field names (including `retry:`) are ignored.
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Append a named SSE frame (`event: {event}\ndata: {json}\n\n`) to `out`.
#[inline]
pub fn push_named_event_frame(out: &mut String, event_type: &str, json: &str) {
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

struct FrameStreamState<S> {
    stream: std::pin::Pin<Box<S>>,
    parser: SseParser,
    remainder: Vec<u8>,
    parsed: Vec<SseEvent>,
    pending: PendingEvents,
    done: bool,
}

impl<S> FrameStreamState<S> {
    fn feed_bytes(&mut self, bytes: &[u8]) {
        if self.remainder.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                self.parser.feed_into(text, &mut self.parsed);
                self.pending.extend_from_vec(&mut self.parsed);
                return;
            }
        }
        self.remainder.extend_from_slice(bytes);
        self.feed_remainder();
        self.pending.extend_from_vec(&mut self.parsed);
    }

    /// Feed the decodable prefix of `remainder`, keeping an incomplete
    /// trailing sequence and skipping bytes that can never decode.
    fn feed_remainder(&mut self) {
        loop {
            match std::str::from_utf8(self.remainder.as_slice()) {
                Ok(text) => {
                    self.parser.feed_into(text, &mut self.parsed);
                    self.remainder.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                    let text =
                        unsafe { std::str::from_utf8_unchecked(&self.remainder[..valid_up_to]) };
                    self.parser.feed_into(text, &mut self.parsed);
                    match e.error_len() {
                        Some(invalid) => {
                            tracing::debug!("skipping {} bytes of invalid UTF-8", invalid);
                            self.remainder.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.remainder.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Split a byte stream into SSE events using [`SseParser`].
///
/// Bytes arriving from the backend body are decoded as UTF-8, fed into the
/// parser, and complete [`SseEvent`] frames are yielded. A body error is
/// yielded once and ends the stream; a final frame without its blank-line
/// terminator is still delivered at end of body.
pub fn sse_frame_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, E>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    use futures_util::StreamExt;

    let state = FrameStreamState {
        stream: Box::pin(byte_stream),
        parser: SseParser::new(),
        remainder: Vec::new(),
        parsed: Vec::with_capacity(8),
        pending: PendingEvents::with_capacity(8),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            match state.stream.as_mut().next().await {
                Some(Ok(bytes)) => state.feed_bytes(&bytes),
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.done = true;
                    if !state.remainder.is_empty() {
                        tracing::debug!(
                            "discarding {} trailing bytes of invalid UTF-8",
                            state.remainder.len()
                        );
                        state.remainder.clear();
                    }
                    if let Some(event) = state.parser.finish() {
                        return Some((Ok(event), state));
                    }
                    return None;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
