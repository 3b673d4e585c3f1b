//! Per-operation handle passed to the callback of [`crate::Telemetry::run`].

use std::borrow::Cow;

use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};

use crate::error::BaggageError;
use crate::telemetry::Telemetry;
use crate::trace;

/// Maximum bytes of one `key=value` baggage member.
pub const MAX_BAGGAGE_MEMBER_BYTES: usize = 4096;

/// Maximum number of baggage members.
pub const MAX_BAGGAGE_MEMBERS: usize = 180;

/// Maximum bytes of the whole serialized baggage header.
pub const MAX_BAGGAGE_BYTES: usize = 8192;

/// Logging, span and metric access for one running operation.
#[derive(Clone)]
pub struct State {
    operation: Cow<'static, str>,
    cx: Context,
    log: tracing::Span,
    telemetry: Telemetry,
}

impl State {
    pub(crate) fn new(
        operation: impl Into<Cow<'static, str>>,
        cx: Context,
        log: tracing::Span,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            operation: operation.into(),
            cx,
            log,
            telemetry,
        }
    }

    /// Name of the running operation.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Context carrying the operation's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// The operation logger. Events recorded inside it carry `operation`,
    /// `trace_id` and `span_id`.
    pub fn log(&self) -> &tracing::Span {
        &self.log
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn trace_id(&self) -> Option<String> {
        trace::trace_id(&self.cx)
    }

    pub fn span_id(&self) -> Option<String> {
        trace::span_id(&self.cx)
    }

    /// Tag the operation's span.
    pub fn set_attributes(&self, attributes: Vec<KeyValue>) {
        self.cx.span().set_attributes(attributes);
    }

    /// Add a timestamped event to the operation's span.
    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        self.cx.span().add_event(name, attributes);
    }

    /// Return a copy of `cx` with one more baggage member.
    ///
    /// `cx` itself is never modified. An invalid member is logged and `cx`
    /// is returned unchanged.
    pub fn set_baggage(&self, cx: &Context, key: &str, value: &str) -> Context {
        if let Err(e) = validate_baggage(cx, key, value) {
            self.log.in_scope(|| {
                tracing::warn!(key, error = %e, "Failed to set baggage member");
            });
            return cx.clone();
        }
        cx.with_baggage(vec![KeyValue::new(key.to_string(), value.to_string())])
    }

    /// Add one to the counter registered as `name`.
    pub fn inc_counter(&self, name: &str, attributes: &[KeyValue]) {
        self.telemetry.registry().add_counter(name, 1, attributes);
    }

    /// Record `value` in the histogram registered as `name`.
    pub fn record_histogram(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        self.telemetry
            .registry()
            .record_histogram(name, value, attributes);
    }

    /// Add `delta` to the up-down counter registered as `name`.
    pub fn add_up_down_counter(&self, name: &str, delta: i64, attributes: &[KeyValue]) {
        self.telemetry
            .registry()
            .add_up_down_counter(name, delta, attributes);
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("operation", &self.operation)
            .field("trace_id", &self.trace_id())
            .finish_non_exhaustive()
    }
}

/// Check that adding `key=value` to the baggage of `cx` stays within the
/// W3C baggage rules.
pub fn validate_baggage(cx: &Context, key: &str, value: &str) -> Result<(), BaggageError> {
    if key.is_empty() {
        return Err(BaggageError::EmptyKey);
    }
    if !key.bytes().all(is_token_byte) {
        return Err(BaggageError::InvalidKey(key.to_string()));
    }

    let member_len = key.len() + 1 + value.len();
    if member_len > MAX_BAGGAGE_MEMBER_BYTES {
        return Err(BaggageError::MemberTooLarge {
            key: key.to_string(),
            len: member_len,
            max: MAX_BAGGAGE_MEMBER_BYTES,
        });
    }

    // A member with the same key is replaced, not added.
    let mut count = 1;
    let mut total = member_len;
    for (existing_key, (existing_value, _)) in cx.baggage() {
        if existing_key.as_str() == key {
            continue;
        }
        count += 1;
        total += existing_key.as_str().len() + 1 + existing_value.as_str().len() + 1;
    }

    if count > MAX_BAGGAGE_MEMBERS {
        return Err(BaggageError::TooManyMembers {
            count,
            max: MAX_BAGGAGE_MEMBERS,
        });
    }
    if total > MAX_BAGGAGE_BYTES {
        return Err(BaggageError::TooLarge {
            len: total,
            max: MAX_BAGGAGE_BYTES,
        });
    }
    Ok(())
}

/// RFC 7230 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
