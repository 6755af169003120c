use {
    base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _},
    crate::hub::stream::StreamKey,
    async_trait::async_trait,
    hmac::{Hmac, Mac},
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    std::sync::Arc,
    std::time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access denied: {0}")]
    Denied(String),
    #[error("signed policy expired")]
    Expired,
    #[error("malformed signed policy: {0}")]
    MalformedPolicy(String),
    #[error("admission webhook unreachable: {0}")]
    WebhookUnreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessDirection {
    Publish,
    Play,
}

/// One admission decision's worth of context, protocol-agnostic.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRequest {
    pub direction: AccessDirection,
    pub protocol: &'static str,
    pub url: String,
    pub stream: StreamKey,
    pub remote_addr: String,
    pub user_agent: Option<String>,
}

/// Admission decision hook every provider and publisher consults before
/// accepting a session.
#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    async fn admit(&self, request: &AccessRequest) -> Result<(), AccessError>;
}

/// Policy that admits everything (no AccessControl block configured).
pub struct AllowAll;

#[async_trait]
impl AdmissionPolicy for AllowAll {
    async fn admit(&self, _request: &AccessRequest) -> Result<(), AccessError> {
        Ok(())
    }
}

/// The base64url policy document carried in the `policy` query parameter.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedPolicyDocument {
    /// Expiry, milliseconds since the Unix epoch.
    pub url_expire: u64,
    /// Optional activation time, same unit.
    #[serde(default)]
    pub url_activate: Option<u64>,
    /// Optional client address pin.
    #[serde(default)]
    pub allow_ip: Option<String>,
}

/// SignedPolicy verification: the request URL (minus the signature
/// parameter) is HMAC-SHA256'd with the application secret and compared
/// against the `signature` parameter; the embedded policy document gates
/// time and client address.
pub struct SignedPolicyValidator {
    secret: String,
    policy_key: String,
    signature_key: String,
}

impl SignedPolicyValidator {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            policy_key: "policy".into(),
            signature_key: "signature".into(),
        }
    }

    pub fn verify(&self, url: &str, remote_addr: &str) -> Result<(), AccessError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AccessError::MalformedPolicy(format!("bad url: {e}")))?;

        let mut policy_b64 = None;
        let mut signature = None;
        for (k, v) in parsed.query_pairs() {
            if k == self.policy_key.as_str() {
                policy_b64 = Some(v.to_string());
            } else if k == self.signature_key.as_str() {
                signature = Some(v.to_string());
            }
        }
        let policy_b64 =
            policy_b64.ok_or_else(|| AccessError::MalformedPolicy("missing policy".into()))?;
        let signature =
            signature.ok_or_else(|| AccessError::MalformedPolicy("missing signature".into()))?;

        // The signature covers the URL with the signature parameter removed.
        let base = match url.rfind(&format!("&{}=", self.signature_key)) {
            Some(idx) => &url[..idx],
            None => {
                return Err(AccessError::MalformedPolicy(
                    "signature must be the last query parameter".into(),
                ))
            }
        };
        let expected = self.sign(base);
        if expected != signature {
            return Err(AccessError::Denied("signature mismatch".into()));
        }

        let policy_json = URL_SAFE_NO_PAD
            .decode(policy_b64.trim_end_matches('='))
            .map_err(|_| AccessError::MalformedPolicy("policy is not base64url".into()))?;
        let policy: SignedPolicyDocument = serde_json::from_slice(&policy_json)
            .map_err(|e| AccessError::MalformedPolicy(format!("policy json: {e}")))?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if now_ms > policy.url_expire {
            return Err(AccessError::Expired);
        }
        if let Some(activate) = policy.url_activate {
            if now_ms < activate {
                return Err(AccessError::Denied("policy not yet active".into()));
            }
        }
        if let Some(allow_ip) = &policy.allow_ip {
            let client_ip = remote_addr.rsplit_once(':').map_or(remote_addr, |(ip, _)| ip);
            if client_ip != allow_ip {
                return Err(AccessError::Denied("client address not allowed".into()));
            }
        }
        Ok(())
    }

    /// base64url(HMAC-SHA256(secret, data)), the signature format clients
    /// must produce.
    #[must_use]
    pub fn sign(&self, data: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[derive(Debug, Serialize)]
struct WebhookClient<'a> {
    address: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WebhookStream<'a> {
    application: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct WebhookRequestBody<'a> {
    direction: AccessDirection,
    protocol: &'static str,
    url: &'a str,
    stream: WebhookStream<'a>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    client: WebhookClient<'a>,
    request: WebhookRequestBody<'a>,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Admission webhook: POSTs the request context to a configured endpoint
/// and enforces its verdict. Unreachable webhook denies (fail closed).
pub struct AdmissionWebhook {
    client: reqwest::Client,
    endpoint: String,
}

impl AdmissionWebhook {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn check(&self, request: &AccessRequest) -> Result<(), AccessError> {
        let (address, port) = match request.remote_addr.rsplit_once(':') {
            Some((ip, port)) => (ip, port.parse().unwrap_or(0)),
            None => (request.remote_addr.as_str(), 0),
        };
        let payload = WebhookPayload {
            client: WebhookClient {
                address,
                port,
                user_agent: request.user_agent.as_deref(),
            },
            request: WebhookRequestBody {
                direction: request.direction,
                protocol: request.protocol,
                url: &request.url,
                stream: WebhookStream {
                    application: &request.stream.app,
                    name: &request.stream.name,
                },
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| AccessError::WebhookUnreachable(e.to_string()))?;
        let verdict: WebhookResponse = response
            .json()
            .await
            .map_err(|e| AccessError::WebhookUnreachable(e.to_string()))?;
        if verdict.allowed {
            Ok(())
        } else {
            Err(AccessError::Denied(
                verdict.reason.unwrap_or_else(|| "webhook denied".into()),
            ))
        }
    }
}

/// Combined per-application access control: SignedPolicy first (cheap,
/// local), then the webhook.
pub struct AccessController {
    signed_policy: Option<SignedPolicyValidator>,
    webhook: Option<AdmissionWebhook>,
}

impl AccessController {
    #[must_use]
    pub fn new(
        signed_policy: Option<SignedPolicyValidator>,
        webhook: Option<AdmissionWebhook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signed_policy,
            webhook,
        })
    }

    #[must_use]
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self {
            signed_policy: None,
            webhook: None,
        })
    }
}

#[async_trait]
impl AdmissionPolicy for AccessController {
    async fn admit(&self, request: &AccessRequest) -> Result<(), AccessError> {
        if let Some(validator) = &self.signed_policy {
            validator.verify(&request.url, &request.remote_addr)?;
        }
        if let Some(webhook) = &self.webhook {
            webhook.check(request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_url(secret: &str, expire_ms: u64) -> String {
        let validator = SignedPolicyValidator::new(secret);
        let policy = serde_json::to_vec(&SignedPolicyDocument {
            url_expire: expire_ms,
            url_activate: None,
            allow_ip: None,
        })
        .unwrap();
        let base = format!(
            "rtmp://host:1935/live/key?policy={}",
            URL_SAFE_NO_PAD.encode(&policy)
        );
        let signature = validator.sign(&base);
        format!("{base}&signature={signature}")
    }

    fn far_future_ms() -> u64 {
        (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64)
            + 3_600_000
    }

    #[test]
    fn test_valid_signature_admits() {
        let url = signed_url("s3cret", far_future_ms());
        let validator = SignedPolicyValidator::new("s3cret");
        assert!(validator.verify(&url, "10.0.0.1:4567").is_ok());
    }

    #[test]
    fn test_wrong_secret_denied() {
        let url = signed_url("s3cret", far_future_ms());
        let validator = SignedPolicyValidator::new("other");
        assert!(matches!(
            validator.verify(&url, "10.0.0.1:4567"),
            Err(AccessError::Denied(_))
        ));
    }

    #[test]
    fn test_expired_policy_denied() {
        let url = signed_url("s3cret", 1_000);
        let validator = SignedPolicyValidator::new("s3cret");
        assert!(matches!(
            validator.verify(&url, "10.0.0.1:4567"),
            Err(AccessError::Expired)
        ));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let validator = SignedPolicyValidator::new("s3cret");
        assert!(validator
            .verify("rtmp://host/live/key?policy=abc", "1.2.3.4:1")
            .is_err());
    }

    #[tokio::test]
    async fn test_allow_all() {
        let request = AccessRequest {
            direction: AccessDirection::Publish,
            protocol: "rtmp",
            url: "rtmp://h/live/k".into(),
            stream: StreamKey::default_vhost("live", "k"),
            remote_addr: "1.2.3.4:5".into(),
            user_agent: None,
        };
        assert!(AllowAll.admit(&request).await.is_ok());
        assert!(AccessController::allow_all().admit(&request).await.is_ok());
    }
}
