use crate::config::{AUTH_CLIENT_ID, AUTH_CLIENT_SECRET, AUTH_TOKEN_URL};
use crate::http::build_client;
use crate::services::{ServiceError, read_json};
use reqwest::Client;
use serde::Deserialize;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Issues the bearer session token a run presents to every collaborator.
/// Without a token endpoint configured, calls go out unauthenticated.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    token_url: Option<String>,
    client_id: String,
    client_secret: String,
    http: Client,
}

impl SessionAuth {
    pub fn new(
        token_url: Option<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            AUTH_TOKEN_URL.clone(),
            AUTH_CLIENT_ID.as_str(),
            AUTH_CLIENT_SECRET.as_str(),
        )
    }

    pub fn disabled() -> Self {
        Self::new(None, "", "")
    }

    pub async fn acquire(&self) -> Result<Option<String>, ServiceError> {
        let Some(url) = &self.token_url else {
            return Ok(None);
        };
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ServiceError::Request(
                "AUTH_CLIENT_ID/AUTH_CLIENT_SECRET missing".into(),
            ));
        }
        let response = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        let payload: TokenResponse = read_json(response).await?;
        Ok(Some(payload.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    #[tokio::test]
    async fn disabled_auth_yields_no_token() {
        assert_eq!(SessionAuth::disabled().acquire().await, Ok(None));
    }

    #[tokio::test]
    async fn exchanges_client_credentials() {
        let server = MockServer::start().await;
        let expected = format!("Basic {}", BASE64.encode("client:secret"));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("Authorization", expected.as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "tok-1", "expires_in": 3600 })),
            )
            .mount(&server)
            .await;
        let auth = SessionAuth::new(Some(format!("{}/token", server.uri())), "client", "secret");
        assert_eq!(auth.acquire().await, Ok(Some("tok-1".to_string())));
    }
}
