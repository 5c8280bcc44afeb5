//! Outbound HTTP sender (C2). Stateless, safe to share across tasks.

use std::time::Duration;

use crate::error::CallbackError;

#[derive(Clone)]
pub struct Sender {
    client: reqwest::Client,
}

impl Sender {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    /// Issues a single POST with `Content-Type: application/json`. Any
    /// status >= 400, timeout, or transport error is a failure; 2xx with
    /// a fully drained body is the only success.
    ///
    /// Races the request against `shutdown`: a shutdown signaled before
    /// the call starts aborts immediately, and one that arrives mid-flight
    /// cancels the wait for a response rather than leaving it dangling.
    pub async fn send(
        &self,
        url: &str,
        payload: &serde_json::Value,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), CallbackError> {
        tracing::debug!(url, "sending callback");

        if *shutdown.borrow() {
            return Err(CallbackError::TransientHttp("shutdown in progress, delivery not attempted".into()));
        }

        let resp = tokio::select! {
            result = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(payload)
                .send() => {
                result.map_err(|e| CallbackError::TransientHttp(e.to_string()))?
            }
            _ = shutdown.changed() => {
                return Err(CallbackError::TransientHttp("shutdown while awaiting callback response".into()));
            }
        };

        if resp.status().is_client_error() || resp.status().is_server_error() {
            let status = resp.status();
            // drain the body before returning, matching C2's "fully drained" contract
            let _ = resp.bytes().await;
            tracing::warn!(url, %status, "callback endpoint returned error response");
            return Err(CallbackError::TransientHttp(format!("error response: {status}")));
        }

        let _ = resp.bytes().await;
        Ok(())
    }
}
