use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_AUTH_ENDPOINT: &str = "https://api.dropbox.com";
pub const DEFAULT_CONTENT_ENDPOINT: &str = "https://content.dropboxapi.com";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";

pub const SERVICE_API_VERSION: &str = "2";

pub const RESPONSE_TYPE_CODE: &str = "code";
pub const TOKEN_ACCESS_TYPE_OFFLINE: &str = "offline";
pub const GRANT_TYPE_AUTHORIZATION_CODE: &str = "authorization_code";

/// Form body of `POST /oauth2/token`. `None` fields are left out of the body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    pub grant_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl TokenRequest {
    /// Exchange of an authorization code obtained through `redirect_uri`.
    pub fn authorization_code(code: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            grant_type: GRANT_TYPE_AUTHORIZATION_CODE.to_string(),
            redirect_uri: Some(redirect_uri.into()),
            ..Default::default()
        }
    }

    pub fn with_client(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_id = non_empty(client_id);
        self.client_secret = non_empty(client_secret);
        self
    }

    pub fn with_code_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.code_verifier = Some(verifier.into());
        self
    }

    pub(crate) fn is_authorization_code(&self) -> bool {
        self.grant_type == GRANT_TYPE_AUTHORIZATION_CODE
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenResponse {
    pub account_id: String,
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: String,
    pub token_type: String,
    pub uid: String,
}

/// What to do when a file already exists at the upload path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Never overwrite; conflicts are resolved by `autorename` or rejected.
    #[default]
    Add,
    Overwrite,
    /// Overwrite only if the current revision matches.
    Update(String),
}

impl Serialize for WriteMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WriteMode::Add => serializer.serialize_str("add"),
            WriteMode::Overwrite => serializer.serialize_str("overwrite"),
            WriteMode::Update(rev) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(".tag", "update")?;
                map.serialize_entry("update", rev)?;
                map.end()
            }
        }
    }
}

/// JSON argument sent in the `Dropbox-API-Arg` header of an upload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadArg {
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
    pub strict_conflict: bool,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_client_modified"
    )]
    pub client_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

// The API only accepts second precision with a literal `Z`.
fn serialize_client_modified<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        None => serializer.serialize_none(),
    }
}

/// A single-request upload. `body` may be a stream, e.g. built from an open
/// `tokio::fs::File`, so the contents never need to be buffered whole.
#[derive(Debug)]
pub struct UploadRequest {
    pub body: reqwest::Body,
    pub arg: UploadArg,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharingInfo {
    pub read_only: bool,
    pub parent_shared_folder_id: Option<String>,
    pub modified_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileLockInfo {
    pub is_lockholder: Option<bool>,
    pub lockholder_name: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PropertyField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PropertyGroup {
    pub template_id: String,
    pub fields: Vec<PropertyField>,
}

/// Metadata of a stored file, as returned by `files/upload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub name: String,
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
    pub rev: String,
    pub size: u64,
    pub client_modified: Option<DateTime<Utc>>,
    pub server_modified: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub is_downloadable: bool,
    pub has_explicit_shared_members: Option<bool>,
    pub sharing_info: Option<SharingInfo>,
    pub file_lock_info: Option<FileLockInfo>,
    pub property_groups: Vec<PropertyGroup>,
}
