//! GenAI semantic convention span helpers for LLM calls.
//!
//! Fields follow the OpenTelemetry GenAI conventions:
//! `gen_ai.operation.name`, `gen_ai.request.model`,
//! `gen_ai.request.max_tokens`, `gen_ai.provider.name`.

use tracing::Span;

/// Start a span for a chat completion.
pub fn start_chat_span(model: &str, provider: &str, max_tokens: u64) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.request.model" = model,
        "gen_ai.request.max_tokens" = max_tokens,
        "gen_ai.provider.name" = provider,
        "error.type" = tracing::field::Empty,
    )
}

/// Mark the span as failed with a short error class.
pub fn record_error(span: &Span, error_type: &str) {
    span.record("error.type", error_type);
}
