use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::format::Payload;

/// Production ingestion endpoint. Tests point at a mock server instead.
pub const DEFAULT_ENDPOINT: &str = "https://notify.bugsnag.com/";

const API_KEY_HEADER: &str = "Bugsnag-Api-Key";
const PAYLOAD_VERSION_HEADER: &str = "Bugsnag-Payload-Version";
const PAYLOAD_VERSION: &str = "4";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to encode payload")]
    Encode(#[source] serde_json::Error),
    #[error("failed to send crash report")]
    Http(#[from] reqwest::Error),
    #[error("crash report rejected with status {0}")]
    UnexpectedStatus(StatusCode),
}

/// Delivers payloads to the ingestion endpoint. One blocking request per
/// call, no retries; TLS follows the endpoint URL scheme.
pub struct Transport {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl Transport {
    pub fn new(endpoint: Url, api_key: &str) -> Result<Transport, DeliveryError> {
        let client = Client::builder().build()?;
        Ok(Transport {
            client,
            endpoint,
            api_key: api_key.to_string(),
        })
    }

    /// Sends one payload and checks the response status. The API key
    /// travels both as a request header and embedded in the body.
    pub fn deliver(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let mut body = serde_json::to_value(payload).map_err(DeliveryError::Encode)?;
        if let Value::Object(map) = &mut body {
            map.insert("apiKey".into(), Value::String(self.api_key.clone()));
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, "identity")
            .header(API_KEY_HEADER, &self.api_key)
            .header(PAYLOAD_VERSION_HEADER, PAYLOAD_VERSION)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::UnexpectedStatus(status));
        }
        Ok(())
    }
}
