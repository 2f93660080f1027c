use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoints::common::BadStoreRequest;
use crate::extractors::RequestMeta;

/// The unique identifier of an event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Generates a new random event id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Deserialize)]
struct EventIdHelper {
    #[serde(default, rename = "event_id")]
    id: Option<EventId>,
}

/// An event payload in flight through the relay.
///
/// Envelopes are created in the store endpoint after authentication and carry the raw payload
/// bytes along with the request meta data until delivery or terminal failure.
#[derive(Clone, Debug)]
pub struct Envelope {
    event_id: EventId,
    meta: RequestMeta,
    content_type: String,
    payload: Bytes,
}

impl Envelope {
    /// Parses an envelope from a store request body.
    ///
    /// JSON payloads must parse and carry their `event_id` if present; a missing event id is
    /// generated. Non-JSON payloads are passed through opaquely with a fresh event id.
    pub fn from_request(
        meta: RequestMeta,
        content_type: String,
        payload: Bytes,
    ) -> Result<Box<Self>, BadStoreRequest> {
        if payload.is_empty() {
            return Err(BadStoreRequest::EmptyBody);
        }

        let event_id = if content_type.starts_with(mime::APPLICATION_JSON.essence_str()) {
            serde_json::from_slice::<EventIdHelper>(&payload)
                .map_err(BadStoreRequest::InvalidJson)?
                .id
                .unwrap_or_default()
        } else {
            EventId::new()
        };

        Ok(Box::new(Envelope {
            event_id,
            meta,
            content_type,
            payload,
        }))
    }

    /// Returns the unique identifier of this event.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Returns the request meta data of this event.
    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    /// Returns the content type of the payload.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns the raw payload bytes.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }
}

#[cfg(test)]
mod tests {
    use relay_common::{ProjectId, ProjectKey};

    use super::*;

    fn test_meta() -> RequestMeta {
        RequestMeta::for_test(
            ProjectId::new(42),
            ProjectKey::parse("31a5a894b4524f74a9a8d0e27e21ba91").unwrap(),
        )
    }

    #[test]
    fn test_event_id_from_payload() {
        let payload = Bytes::from_static(
            br#"{"event_id":"9ec79c33ec9942ab8353589fcb2e04dc","message":"hello"}"#,
        );
        let envelope =
            Envelope::from_request(test_meta(), "application/json".to_owned(), payload).unwrap();

        assert_eq!(
            envelope.event_id().to_string(),
            "9ec79c33ec9942ab8353589fcb2e04dc"
        );
    }

    #[test]
    fn test_event_id_generated() {
        let payload = Bytes::from_static(br#"{"message":"hello"}"#);
        let envelope =
            Envelope::from_request(test_meta(), "application/json".to_owned(), payload).unwrap();

        assert_ne!(envelope.event_id().to_string(), "");
    }

    #[test]
    fn test_malformed_json_rejected() {
        let payload = Bytes::from_static(b"{not json");
        let result = Envelope::from_request(test_meta(), "application/json".to_owned(), payload);
        assert!(matches!(result, Err(BadStoreRequest::InvalidJson(_))));
    }

    #[test]
    fn test_empty_body_rejected() {
        let result = Envelope::from_request(
            test_meta(),
            "application/json".to_owned(),
            Bytes::new(),
        );
        assert!(matches!(result, Err(BadStoreRequest::EmptyBody)));
    }

    #[test]
    fn test_raw_payload_passes_through() {
        let payload = Bytes::from_static(b"raw bytes");
        let envelope =
            Envelope::from_request(test_meta(), "application/octet-stream".to_owned(), payload)
                .unwrap();
        assert_eq!(envelope.payload().as_ref(), b"raw bytes");
    }
}
