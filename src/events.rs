// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope and Topics
//!
//! Every message published through this crate is wrapped in an
//! [`EventEnvelope`]: `{event_id, event_type, timestamp, data}`, serialized as
//! a JSON object. The event type doubles as the routing key and as the key the
//! consumer dispatches on.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use uuid::Uuid;

pub const TOPIC_IMAGE_RECEIVED: &str = "image.received";
pub const TOPIC_FACE_RECOGNITION: &str = "face.recognition";
pub const TOPIC_DATA_SAVED: &str = "data.saved";

/// Envelope field carrying the event type.
pub const EVENT_TYPE_FIELD: &str = "event_type";

/// Canonical wrapper around every published payload.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<T> {
    pub event_id: String,
    pub event_type: String,
    #[serde(serialize_with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    /// Wraps `data` with a fresh event id and the current UTC time.
    pub fn new(event_type: &str, data: T) -> Self {
        EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_owned(),
            timestamp: Utc::now(),
            data,
        }
    }
}

fn rfc3339_seconds<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Payload of [`TOPIC_IMAGE_RECEIVED`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageReceivedEventData {
    pub image_id: String,
    /// Base64 encoded image bytes.
    pub image_data: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Payload of [`TOPIC_FACE_RECOGNITION`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceRecognitionEventData {
    pub image_id: String,
    pub faces_found: i32,
    pub processing_ms: i64,
    pub results: Vec<FaceRecognitionResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceRecognitionResult {
    pub face_id: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Payload of [`TOPIC_DATA_SAVED`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSavedEventData {
    pub image_id: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
