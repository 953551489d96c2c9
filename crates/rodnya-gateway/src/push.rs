use std::time::Duration;

use tracing::{debug, warn};

/// Fire-and-forget Web Push fallback for offline recipients.
///
/// Sends a payload-less "tickle" POST to the subscription endpoint with a
/// TTL header; the service worker on the other end re-fetches unread
/// messages itself. Delivery failures are logged and dropped, matching the
/// protocol's no-retry semantics.
#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
}

impl PushClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Notify the endpoint stored in a serialized browser subscription.
    pub async fn notify(&self, username: &str, subscription_json: &str) {
        let Some(endpoint) = extract_endpoint(subscription_json) else {
            warn!("push: subscription for {} has no endpoint", username);
            return;
        };

        match self
            .http
            .post(&endpoint)
            .header("TTL", "60")
            .body(Vec::new())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!("push: tickled {} via {}", username, endpoint);
            }
            Ok(resp) => {
                warn!("push: endpoint for {} answered {}", username, resp.status());
            }
            Err(e) => {
                warn!("push: delivery to {} failed: {}", username, e);
            }
        }
    }
}

impl Default for PushClient {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_endpoint(subscription_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(subscription_json).ok()?;
    let endpoint = value.get("endpoint")?.as_str()?;
    if endpoint.starts_with("https://") {
        Some(endpoint.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_extraction() {
        let sub = r#"{"endpoint":"https://push.example/abc","keys":{"p256dh":"k","auth":"a"}}"#;
        assert_eq!(
            extract_endpoint(sub).as_deref(),
            Some("https://push.example/abc")
        );

        assert!(extract_endpoint(r#"{"keys":{}}"#).is_none());
        assert!(extract_endpoint("not json").is_none());
        assert!(extract_endpoint(r#"{"endpoint":"http://insecure"}"#).is_none());
    }
}
