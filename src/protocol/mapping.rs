use super::anthropic::FrontStopReason;

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn backend_stop_to_front(s: &str) -> FrontStopReason {
    match s {
        "tool_use" | "tool_calls" | "TOOL_USE" => FrontStopReason::ToolUse,
        "max_tokens" | "length" | "MAX_TOKENS" => FrontStopReason::MaxTokens,
        "stop_sequence" | "STOP_SEQUENCE" => FrontStopReason::StopSequence,
        _ => FrontStopReason::EndTurn, // end_turn, stop, STOP and unknown values
    }
}

#[must_use]
pub fn front_stop_str(reason: FrontStopReason) -> &'static str {
    match reason {
        FrontStopReason::EndTurn => "end_turn",
        FrontStopReason::ToolUse => "tool_use",
        FrontStopReason::MaxTokens => "max_tokens",
        FrontStopReason::StopSequence => "stop_sequence",
    }
}

/// Final stop reason of a converted response. A truncated response stays
/// truncated; otherwise any emitted tool call makes it `tool_use`.
#[must_use]
pub fn resolve_stop_reason(
    backend: Option<FrontStopReason>,
    emitted_tool_calls: bool,
) -> FrontStopReason {
    match backend {
        Some(FrontStopReason::MaxTokens) => FrontStopReason::MaxTokens,
        _ if emitted_tool_calls => FrontStopReason::ToolUse,
        Some(FrontStopReason::ToolUse) | None => FrontStopReason::EndTurn,
        Some(other) => other,
    }
}
