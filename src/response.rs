use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::ReqflowResult;
use crate::descriptor::RequestDescriptor;
use crate::error::FailureEnvelope;
use crate::util::truncate_body;

/// A response body decoded according to its declared content type.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl ResponseBody {
    /// `application/json` (and `+json` suffixes) decode to a structured
    /// value, `text/*` to a string, anything else stays binary.
    pub(crate) fn decode(headers: &HeaderMap, raw: Bytes) -> Self {
        if raw.is_empty() {
            return Self::Empty;
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            })
            .unwrap_or_default();

        if content_type == "application/json" || content_type.ends_with("+json") {
            return match serde_json::from_slice(&raw) {
                Ok(value) => Self::Json(value),
                Err(error) => {
                    debug!(error = %error, "json response body failed to parse; keeping text");
                    Self::Text(String::from_utf8_lossy(&raw).into_owned())
                }
            };
        }
        if content_type.starts_with("text/") {
            return Self::Text(String::from_utf8_lossy(&raw).into_owned());
        }
        Self::Binary(raw)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn text_lossy(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    pub body: ResponseBody,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub request: RequestDescriptor,
    pub from_cache: bool,
}

impl ResponseEnvelope {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
        request: RequestDescriptor,
    ) -> Self {
        Self {
            body,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            request,
            from_cache: false,
        }
    }

    /// Synthetic `200 OK` envelope produced for a cache hit.
    pub(crate) fn cached(body: ResponseBody, request: RequestDescriptor) -> Self {
        let mut envelope = Self::new(StatusCode::OK, HeaderMap::new(), body, request);
        envelope.from_cache = true;
        envelope
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        self.body.text_lossy()
    }

    pub fn json<T>(&self) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        let decoded = match &self.body {
            ResponseBody::Json(value) => T::deserialize(value),
            other => serde_json::from_slice(&other.to_bytes()),
        };
        decoded.map_err(|source| {
            FailureEnvelope::application(format!(
                "failed to decode response json: {source}; body={}",
                truncate_body(&self.body.to_bytes())
            ))
            .with_status(self.status)
        })
    }
}
