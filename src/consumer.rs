// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Settles a single delivery: decode the envelope, route it by its
//! `event_type` to the registered handler, then ack or nack depending on the
//! outcome. Every delivery is settled exactly once.
//!
//! | Outcome                          | Settlement            |
//! |----------------------------------|-----------------------|
//! | body is not a JSON object        | `nack(requeue=false)` |
//! | `event_type` missing/not string  | `nack(requeue=false)` |
//! | no handler for `event_type`      | `nack(requeue=false)` |
//! | handler failed                   | `nack(requeue=true)`  |
//! | handler succeeded                | `ack`                 |

use crate::{
    dispatcher::{EventHandler, HandlerMap},
    errors::AmqpError,
    events::EVENT_TYPE_FIELD,
    otel,
    transport::InboundMessage,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::{Map, Value};
use std::{
    borrow::Cow,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, error, warn};

/// Span name used when a delivery carries no usable event type.
const UNROUTABLE_SPAN: &str = "unroutable";

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handled and acknowledged.
    Acknowledged,
    /// Handler failed; returned to the queue for redelivery.
    Requeued,
    /// Undecodable or unroutable; dropped without requeue.
    Discarded,
}

/// Processes one delivery and settles it.
///
/// Consume-side failures never leave this function: they only decide how the
/// delivery is settled. Failing to ack or nack is logged and recorded on the
/// span.
pub(crate) async fn process_message(
    tracer: &BoxedTracer,
    handlers: &RwLock<HandlerMap>,
    message: InboundMessage,
) -> Settlement {
    let decoded = serde_json::from_slice::<Map<String, Value>>(&message.data);

    let event_type = decoded.as_ref().ok().and_then(|envelope| {
        envelope
            .get(EVENT_TYPE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_owned)
    });

    let (ctx, mut span) = otel::new_span(
        message.headers.as_ref(),
        tracer,
        event_type.as_deref().unwrap_or(UNROUTABLE_SPAN),
    );

    if let Err(err) = decoded {
        error!(
            error = err.to_string(),
            delivery_tag = message.delivery_tag,
            "failed to unmarshal message"
        );
        return discard(&mut span, message, AmqpError::DecodeError(err.to_string())).await;
    }

    let Some(event_type) = event_type else {
        error!(
            delivery_tag = message.delivery_tag,
            "message has no string event_type"
        );
        let err = AmqpError::RoutingError("event_type missing or not a string".to_owned());
        return discard(&mut span, message, err).await;
    };

    let Some(handler) = lookup(handlers, &event_type) else {
        warn!(event_type, "no handler registered for event type");
        let err = AmqpError::RoutingError(format!("no handler for {event_type}"));
        return discard(&mut span, message, err).await;
    };

    debug!(
        event_type,
        delivery_tag = message.delivery_tag,
        redelivered = message.redelivered,
        "dispatching message"
    );

    match handler.handle(&ctx, &message.data).await {
        Ok(()) => {
            match message.ack().await {
                Ok(()) => {
                    debug!(event_type, "message successfully processed");
                    span.set_status(Status::Ok);
                }
                Err(err) => {
                    error!(error = err.to_string(), event_type, "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
            }
            Settlement::Acknowledged
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                event_type, "handler failed, requeuing message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            if let Err(err) = message.nack(true).await {
                error!(error = err.to_string(), event_type, "error whiling requeuing");
                span.record_error(&err);
            }
            Settlement::Requeued
        }
    }
}

fn lookup(handlers: &RwLock<HandlerMap>, event_type: &str) -> Option<Arc<dyn EventHandler>> {
    handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(event_type)
        .cloned()
}

async fn discard(span: &mut BoxedSpan, message: InboundMessage, reason: AmqpError) -> Settlement {
    span.record_error(&reason);
    span.set_status(Status::Error {
        description: Cow::from(reason.to_string()),
    });

    if let Err(err) = message.nack(false).await {
        error!(error = err.to_string(), "error whiling nack msg");
        span.record_error(&err);
    }
    Settlement::Discarded
}
