//! Ephemeral credential issuance for the realtime channel.
//!
//! The client never holds a long-lived secret: every connection attempt
//! asks a trusted intermediary for a fresh short-lived credential.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CredentialIssuer, RealtimeCredential};
use crate::error::VoiceError;

/// Fetches credentials from an HTTP endpoint (the hosted function that
/// fronted the vendor's session API in the original deployment).
pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    endpoint: String,
    authorization: Option<String>,
    fallback_url: String,
}

impl HttpCredentialIssuer {
    pub fn new(
        endpoint: impl Into<String>,
        authorization: Option<String>,
        fallback_url: impl Into<String>,
    ) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| VoiceError::TransportSetup(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            authorization,
            fallback_url: fallback_url.into(),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    client_secret: ClientSecret,
    url: Option<String>,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
}

pub(crate) fn credential_from_json(
    body: &str,
    fallback_url: &str,
) -> Result<RealtimeCredential, VoiceError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| VoiceError::TransportSetup(format!("bad credential response: {e}")))?;
    if parsed.client_secret.value.is_empty() {
        return Err(VoiceError::TransportSetup("empty ephemeral secret".into()));
    }
    Ok(RealtimeCredential {
        url: parsed.url.unwrap_or_else(|| fallback_url.to_string()),
        secret: parsed.client_secret.value,
    })
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self) -> Result<RealtimeCredential, VoiceError> {
        let mut request = self.client.post(&self.endpoint);
        if let Some(authorization) = &self.authorization {
            request = request.bearer_auth(authorization);
        }
        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::TransportSetup(format!("credential fetch failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::TransportSetup(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(VoiceError::TransportSetup(format!(
                "credential endpoint returned {status}: {snippet}"
            )));
        }
        let credential = credential_from_json(&body, &self.fallback_url)?;
        debug!(url = %credential.url, "ephemeral credential issued");
        Ok(credential)
    }
}
