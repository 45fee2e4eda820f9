//! Azure AD client-credentials (service principal) token exchange.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use azure_core::credentials::Secret;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{diagnostic_body, ArmError, ArmResult};
use crate::http::{HttpRequest, HttpTransport, RequestBody};

/// Scope requested for Azure Resource Manager access.
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Service-principal credentials.  Every field is guaranteed non-empty.
#[derive(Clone)]
pub struct ClientCredentials {
    tenant_id: String,
    client_id: String,
    client_secret: Secret,
    subscription_id: String,
}

impl ClientCredentials {
    /// Validate and build credentials.  No network access happens here.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> ArmResult<Self> {
        let tenant_id = tenant_id.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let subscription_id = subscription_id.into();

        let missing: Vec<&str> = [
            ("AZ_TENANT_ID", &tenant_id),
            ("AZ_CLIENT_ID", &client_id),
            ("AZ_CLIENT_SECRET", &client_secret),
            ("AZ_SUBSCRIPTION_ID", &subscription_id),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| *k)
        .collect();

        if !missing.is_empty() {
            return Err(ArmError::Configuration(format!(
                "missing Azure credentials: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            tenant_id,
            client_id,
            client_secret: Secret::from(client_secret),
            subscription_id,
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// Supplies a bearer token for ARM calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> ArmResult<Secret>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Fetches a fresh token on every call.  No caching, no retry.
pub struct ClientCredentialTokenProvider {
    credentials: ClientCredentials,
    authority_host: String,
    transport: Arc<dyn HttpTransport>,
}

impl ClientCredentialTokenProvider {
    pub fn new(
        credentials: ClientCredentials,
        authority_host: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            credentials,
            authority_host: authority_host.into(),
            transport,
        }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.credentials.tenant_id
        )
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialTokenProvider {
    async fn acquire_token(&self) -> ArmResult<Secret> {
        let url = self.token_url();
        tracing::debug!(%url, "requesting ARM token");

        let form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.credentials.client_id.clone()),
            (
                "client_secret".to_string(),
                self.credentials.client_secret.secret().to_string(),
            ),
            ("scope".to_string(), ARM_SCOPE.to_string()),
        ];
        let req = HttpRequest::new(Method::POST, url).body(RequestBody::Form(form));

        let resp = self.transport.send(req).await.map_err(|e| ArmError::Auth {
            status: 0,
            body: Value::String(e.to_string()),
        })?;

        if !(200..300).contains(&resp.status) {
            return Err(ArmError::Auth {
                status: resp.status,
                body: diagnostic_body(&resp.body),
            });
        }

        let token = serde_json::from_slice::<TokenResponse>(&resp.body)
            .ok()
            .and_then(|t| t.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ArmError::Auth {
                status: resp.status,
                body: Value::String("token endpoint response has no access_token".into()),
            })?;

        Ok(Secret::from(token))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Hands out a constant token without touching the network.
    pub struct StaticToken(pub &'static str);

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn acquire_token(&self) -> ArmResult<Secret> {
            Ok(Secret::from(self.0.to_string()))
        }
    }
}
