use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use crate::config::PayPalConfig;
use crate::error::{AppError, Result};

/// Signature material carried in PayPal webhook headers.
#[derive(Debug, Clone)]
pub struct PayPalSignatureHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

impl PayPalSignatureHeaders {
    /// Pull the five verification headers off the request. Any missing
    /// header means the request cannot be verified.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        Some(Self {
            transmission_id: get("paypal-transmission-id")?,
            transmission_time: get("paypal-transmission-time")?,
            transmission_sig: get("paypal-transmission-sig")?,
            cert_url: get("paypal-cert-url")?,
            auth_algo: get("paypal-auth-algo")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerifyWebhookResponse {
    verification_status: String,
}

/// PayPal API client. Signature verification goes through PayPal's
/// verify-webhook-signature endpoint rather than local crypto - the cert
/// chain handling lives with the provider.
pub struct PayPalClient {
    client: reqwest::Client,
    config: PayPalConfig,
}

impl PayPalClient {
    pub fn new(client: reqwest::Client, config: PayPalConfig) -> Self {
        Self { client, config }
    }

    pub fn webhook_id(&self) -> &str {
        &self.config.webhook_id
    }

    /// Fetch an OAuth access token via client credentials.
    async fn get_access_token(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("PayPal OAuth error: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "PayPal OAuth returned {}",
                response.status()
            )));
        }

        let token: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse PayPal token: {}", e)))?;

        Ok(token.access_token)
    }

    /// Verify a webhook delivery against PayPal's verification API.
    /// Returns Ok(false) for a definitive FAILURE verdict; transport or
    /// parse problems are errors so the caller can decide retry behavior.
    pub async fn verify_webhook_signature(
        &self,
        sig: &PayPalSignatureHeaders,
        event_body: &serde_json::Value,
    ) -> Result<bool> {
        let access_token = self.get_access_token().await?;

        let response = self
            .client
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.api_base
            ))
            .bearer_auth(access_token)
            .json(&json!({
                "auth_algo": sig.auth_algo,
                "cert_url": sig.cert_url,
                "transmission_id": sig.transmission_id,
                "transmission_sig": sig.transmission_sig,
                "transmission_time": sig.transmission_time,
                "webhook_id": self.config.webhook_id,
                "webhook_event": event_body,
            }))
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("PayPal verification error: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "PayPal verification returned {}",
                response.status()
            )));
        }

        let verdict: VerifyWebhookResponse = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse PayPal verification: {}", e))
        })?;

        Ok(verdict.verification_status == "SUCCESS")
    }
}

/// PayPal webhook event envelope.
#[derive(Debug, Deserialize)]
pub struct PayPalWebhookEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub resource: serde_json::Value,
}
