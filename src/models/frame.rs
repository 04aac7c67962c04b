use base64::Engine;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Longest excerpt of a rejected message kept for the dead-letter record.
const EXCERPT_CHARS: usize = 256;

/// Broker handle for acknowledging one delivery.
///
/// For the Redis queue this is the exact element sitting in the worker's
/// processing list, so it doubles as the value removed on ack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where the pixel data of a frame lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Encoded image bytes carried in the message (base64 on the wire).
    Inline {
        #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
        data: Vec<u8>,
    },
    /// Key of an object in the frame blob bucket.
    Blob { key: String },
}

/// A unit of work referencing one frame to be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameJob {
    pub job_id: String,
    pub stream_id: String,
    pub sequence_number: i64,
    pub payload_ref: PayloadRef,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_tag: DeliveryTag,
}

/// JSON message a producer pushes onto the frame queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FrameEnvelope {
    #[garde(length(min = 1, max = 128))]
    pub job_id: String,

    #[garde(length(min = 1, max = 128))]
    pub stream_id: String,

    #[garde(range(min = 0))]
    pub sequence_number: i64,

    #[garde(custom(validate_payload))]
    pub payload: PayloadRef,

    #[garde(skip)]
    pub enqueued_at: DateTime<Utc>,
}

fn validate_payload(value: &PayloadRef, _ctx: &()) -> garde::Result {
    match value {
        PayloadRef::Inline { data } if data.is_empty() => {
            Err(garde::Error::new("inline payload is empty"))
        }
        PayloadRef::Blob { key } if key.trim().is_empty() => {
            Err(garde::Error::new("blob key is empty"))
        }
        _ => Ok(()),
    }
}

impl FrameEnvelope {
    /// Parse and validate one raw queue message.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: FrameEnvelope = serde_json::from_str(raw)?;
        envelope
            .validate()
            .map_err(|report| EnvelopeError::Invalid(report.to_string()))?;
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_job(self, delivery_tag: DeliveryTag) -> FrameJob {
        FrameJob {
            job_id: self.job_id,
            stream_id: self.stream_id,
            sequence_number: self.sequence_number,
            payload_ref: self.payload,
            enqueued_at: self.enqueued_at,
            delivery_tag,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Frame message is not a valid envelope: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Frame message failed validation: {0}")]
    Invalid(String),
}

/// A message that could not be turned into a [`FrameJob`]. Whatever identity
/// could be salvaged from it is kept so the dead-letter entry stays auditable.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedDelivery {
    pub delivery_tag: DeliveryTag,
    pub job_id: Option<String>,
    pub stream_id: Option<String>,
    pub sequence_number: Option<i64>,
    pub reason: String,
    pub excerpt: String,
}

impl MalformedDelivery {
    pub fn from_raw(delivery_tag: DeliveryTag, raw: &str, error: &EnvelopeError) -> Self {
        let salvaged: Option<serde_json::Value> = serde_json::from_str(raw).ok();
        let field = |name: &str| salvaged.as_ref().and_then(|v| v.get(name).cloned());

        Self {
            job_id: field("job_id").and_then(|v| v.as_str().map(str::to_string)),
            stream_id: field("stream_id").and_then(|v| v.as_str().map(str::to_string)),
            sequence_number: field("sequence_number").and_then(|v| v.as_i64()),
            reason: error.to_string(),
            excerpt: raw.chars().take(EXCERPT_CHARS).collect(),
            delivery_tag,
        }
    }
}

/// What the frame source hands the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Frame(FrameJob),
    Malformed(MalformedDelivery),
}

impl Delivery {
    /// Build a delivery from a raw message; parsing failures become
    /// [`Delivery::Malformed`] rather than being discarded.
    pub fn from_raw(raw: String) -> Self {
        match FrameEnvelope::decode(&raw) {
            Ok(envelope) => Delivery::Frame(envelope.into_job(DeliveryTag::new(raw))),
            Err(e) => {
                let tag = DeliveryTag::new(raw.clone());
                Delivery::Malformed(MalformedDelivery::from_raw(tag, &raw, &e))
            }
        }
    }

    pub fn tag(&self) -> &DeliveryTag {
        match self {
            Delivery::Frame(job) => &job.delivery_tag,
            Delivery::Malformed(m) => &m.delivery_tag,
        }
    }
}

fn encode_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
