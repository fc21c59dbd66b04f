use std::fmt::Write as _;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::credentials::Credentials;
use super::error::{Error, Result};
use super::types::{
    FileMetadata, TokenRequest, TokenResponse, UploadRequest, DEFAULT_AUTH_ENDPOINT,
    DEFAULT_CONTENT_ENDPOINT, SERVICE_API_VERSION,
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const API_ARG_HEADER: &str = "Dropbox-API-Arg";

const OP_TOKEN: &str = "oauth2/token";
const OP_UPLOAD: &str = "files/upload";

/// Dropbox API client. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    auth_endpoint: String,
    content_endpoint: String,
    credentials: Credentials,
}

#[derive(Debug, Default)]
pub struct ClientBuilder {
    http: Option<reqwest::Client>,
    auth_endpoint: Option<String>,
    content_endpoint: Option<String>,
    credentials: Credentials,
}

impl ClientBuilder {
    /// Use a preconfigured transport instead of the default one.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn auth_endpoint(mut self, url: impl Into<String>) -> Self {
        self.auth_endpoint = Some(url.into());
        self
    }

    pub fn content_endpoint(mut self, url: impl Into<String>) -> Self {
        self.content_endpoint = Some(url.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(self) -> Result<Client> {
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .user_agent(concat!("dropbox-cli/", env!("CARGO_PKG_VERSION")))
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|source| Error::Transport {
                    operation: "client",
                    source,
                })?,
        };

        let endpoint = |url: Option<String>, default: &str| {
            url.unwrap_or_else(|| default.to_string())
                .trim_end_matches('/')
                .to_string()
        };

        Ok(Client {
            http,
            auth_endpoint: endpoint(self.auth_endpoint, DEFAULT_AUTH_ENDPOINT),
            content_endpoint: endpoint(self.content_endpoint, DEFAULT_CONTENT_ENDPOINT),
            credentials: self.credentials,
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Authorization-code requests without a PKCE verifier or an explicit
    /// client secret in the body authenticate with HTTP Basic auth built
    /// from the app key and secret.
    pub async fn oauth2_token(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let url = format!("{}/oauth2/token", self.auth_endpoint);
        let mut builder = self.http.post(&url).form(request);

        if request.is_authorization_code()
            && request.code_verifier.is_none()
            && request.client_secret.is_none()
        {
            builder = builder.basic_auth(
                &self.credentials.app_key,
                Some(&self.credentials.app_secret),
            );
        }

        tracing::debug!(%url, grant_type = %request.grant_type, "requesting token");
        self.send(OP_TOKEN, builder).await
    }

    /// Upload a file in a single request. The API caps these at 150 MiB.
    pub async fn files_upload(&self, request: UploadRequest) -> Result<FileMetadata> {
        let url = format!(
            "{}/{}/files/upload",
            self.content_endpoint, SERVICE_API_VERSION
        );
        let arg = header_safe_json(&request.arg)?;

        tracing::debug!(%url, path = %request.arg.path, "uploading");
        let builder = self
            .http
            .post(&url)
            .bearer_auth(&self.credentials.access_token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(API_ARG_HEADER, arg)
            .body(request.body);

        self.send(OP_UPLOAD, builder).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<T> {
        let transport = |source| Error::Transport { operation, source };

        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        tracing::debug!(operation, %status, "response received");

        let body = response.text().await.map_err(transport)?;
        if status.as_u16() >= 400 {
            return Err(Error::Api {
                operation,
                status,
                body,
            });
        }

        serde_json::from_str(&body).map_err(|source| Error::Decode { operation, source })
    }
}

/// Serialize `value` as JSON that is safe to put in an HTTP header: every
/// character above U+007E is written as a `\uXXXX` escape.
pub fn header_safe_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if (c as u32) > 0x7e {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04x}", unit);
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropbox::types::{UploadArg, WriteMode};
    use httpmock::prelude::*;

    fn credentials() -> Credentials {
        Credentials {
            app_key: "key".into(),
            app_secret: "secret".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
        }
    }

    fn client(server: &MockServer) -> Client {
        Client::builder()
            .auth_endpoint(server.base_url())
            .content_endpoint(format!("{}/", server.base_url()))
            .credentials(credentials())
            .build()
            .unwrap()
    }

    #[test]
    fn test_header_safe_json_escapes_non_ascii() {
        let arg = UploadArg {
            path: "/caf\u{e9}/\u{1f600}\u{7f}.txt".into(),
            ..Default::default()
        };
        let json = header_safe_json(&arg).unwrap();
        assert!(json.is_ascii());
        assert!(json.contains(r#""/caf\u00e9/\ud83d\ude00\u007f.txt""#));

        // still valid JSON with the same content
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["path"], "/caf\u{e9}/\u{1f600}\u{7f}.txt");
    }

    #[tokio::test]
    async fn test_oauth2_token_uses_basic_auth_and_form_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .header("Authorization", "Basic a2V5OnNlY3JldA==")
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body_includes("code=the-code")
                    .body_includes("grant_type=authorization_code")
                    .body_includes("redirect_uri=http%3A%2F%2Flocalhost%3A8080");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "expires_in": 14400,
                    "token_type": "bearer",
                    "scope": "files.content.write",
                    "account_id": "dbid:abc",
                    "uid": "12345"
                }));
            })
            .await;

        let out = client(&server)
            .oauth2_token(&TokenRequest::authorization_code(
                "the-code",
                "http://localhost:8080",
            ))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(out.access_token, "new-access");
        assert_eq!(out.refresh_token, "new-refresh");
        assert_eq!(out.expires_in, 14400);
        assert_eq!(out.account_id, "dbid:abc");
    }

    #[tokio::test]
    async fn test_oauth2_token_pkce_sends_verifier_without_basic_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .header_missing("Authorization")
                    .body_includes("client_id=key")
                    .body_includes("code_verifier=verifier123");
                then.status(200)
                    .json_body(serde_json::json!({ "access_token": "pkce-access" }));
            })
            .await;

        let request = TokenRequest::authorization_code("c", "http://localhost:1")
            .with_client("key", "")
            .with_code_verifier("verifier123");
        let out = client(&server).oauth2_token(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(out.access_token, "pkce-access");
        assert!(out.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_embeds_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(400)
                    .body(r#"{"error": "invalid_grant", "error_description": "code doesn't exist or has expired"}"#);
            })
            .await;

        let err = client(&server)
            .oauth2_token(&TokenRequest::authorization_code("stale", "http://localhost:8080"))
            .await
            .unwrap_err();

        match &err {
            Error::Api {
                operation,
                status,
                body,
            } => {
                assert_eq!(*operation, "oauth2/token");
                assert_eq!(status.as_u16(), 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_files_upload_sends_arg_header_and_bearer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/files/upload")
                    .header("Authorization", "Bearer access")
                    .header("Content-Type", "application/octet-stream")
                    .header(
                        "Dropbox-API-Arg",
                        r#"{"path":"/backup/a.txt","mode":"overwrite","autorename":false,"mute":false,"strict_conflict":false}"#,
                    )
                    .body("hello");
                then.status(200).json_body(serde_json::json!({
                    "name": "a.txt",
                    "id": "id:1",
                    "path_display": "/backup/a.txt",
                    "path_lower": "/backup/a.txt",
                    "rev": "015f",
                    "size": 5,
                    "is_downloadable": true
                }));
            })
            .await;

        let meta = client(&server)
            .files_upload(UploadRequest {
                body: "hello".into(),
                arg: UploadArg {
                    path: "/backup/a.txt".into(),
                    mode: WriteMode::Overwrite,
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(meta.path_display, "/backup/a.txt");
        assert_eq!(meta.size, 5);
    }

    #[tokio::test]
    async fn test_files_upload_server_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/2/files/upload");
                then.status(409)
                    .body(r#"{"error_summary": "path/conflict/file/..", "error": {".tag": "path"}}"#);
            })
            .await;

        let err = client(&server)
            .files_upload(UploadRequest {
                body: "".into(),
                arg: UploadArg {
                    path: "/x".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path/conflict/file"));
    }

    #[tokio::test]
    async fn test_success_with_unexpected_body_is_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200).body("<html>not json</html>");
            })
            .await;

        let err = client(&server)
            .oauth2_token(&TokenRequest::authorization_code("c", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let client = Client::builder()
            .content_endpoint("http://127.0.0.1:1")
            .credentials(credentials())
            .build()
            .unwrap();
        let err = client
            .files_upload(UploadRequest {
                body: "".into(),
                arg: UploadArg::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                operation: "files/upload",
                ..
            }
        ));
    }
}
