// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! App Store Connect integration for the Notary API.

Implements the production [NotaryService]: JWT-authenticated requests
against the Notary API, archive upload to the service-issued S3
location, and ticket retrieval from Apple's public ticket lookup
service.

See <https://developer.apple.com/documentation/notaryapi> for the API
this speaks.
*/

use {
    crate::{
        archiving::SubmissionArchive,
        error::PipelineError,
        notary::{NotaryService, ServiceStatus, StatusResponse},
    },
    jsonwebtoken::{Algorithm, EncodingKey, Header},
    log::{error, info, warn},
    reqwest::blocking::{Client, ClientBuilder},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{
        collections::HashMap,
        fs::Permissions,
        io::Write,
        path::Path,
        sync::Mutex,
        time::{Instant, SystemTime},
    },
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const APPLE_NOTARY_SUBMIT_SOFTWARE_URL: &str =
    "https://appstoreconnect.apple.com/notary/v2/submissions";

/// URL of HTTP service where Apple publishes stapling tickets.
pub const APPLE_TICKET_LOOKUP_URL: &str = "https://api.apple-cloudkit.com/database/1/com.apple.gk.ticket-delivery/production/public/records/lookup";

/// Issued tokens are valid for this many seconds.
const TOKEN_DURATION: u64 = 300;

#[cfg(unix)]
fn set_permissions_private(p: &mut Permissions) {
    p.set_mode(0o600);
}

#[cfg(windows)]
fn set_permissions_private(_: &mut Permissions) {}

/// Represents all metadata for an App Store Connect API Key.
///
/// This is a convenience type to aid in the generic representation of all the
/// components of an App Store Connect API Key. The type supports serialization
/// so we save as a single file or payload to enhance usability (so people
/// don't need to provide all 3 pieces of the API Key for all operations).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UnifiedApiKey {
    /// Who issued the key.
    ///
    /// Likely a UUID.
    issuer_id: String,

    /// Key identifier.
    ///
    /// An alphanumeric string like `DEADBEEF42`.
    key_id: String,

    /// Base64 encoded DER of ECDSA private key material.
    private_key: String,
}

impl UnifiedApiKey {
    /// Construct an instance from constitute parts and a PEM encoded ECDSA private key.
    ///
    /// This is what you want to use if importing a private key from the file
    /// downloaded from the App Store Connect web interface.
    pub fn from_ecdsa_pem_path(
        issuer_id: impl ToString,
        key_id: impl ToString,
        path: impl AsRef<Path>,
    ) -> Result<Self, PipelineError> {
        let pem_data = std::fs::read(path.as_ref())?;

        let parsed = pem::parse(pem_data)
            .map_err(|e| PipelineError::ApiKey(format!("error parsing PEM: {}", e)))?;

        if parsed.tag != "PRIVATE KEY" {
            return Err(PipelineError::ApiKey(
                "does not look like a PRIVATE KEY".to_string(),
            ));
        }

        let private_key = base64::encode(parsed.contents);

        Ok(Self {
            issuer_id: issuer_id.to_string(),
            key_id: key_id.to_string(),
            private_key,
        })
    }

    /// Construct an instance from serialized JSON.
    pub fn from_json(data: impl AsRef<[u8]>) -> Result<Self, PipelineError> {
        Ok(serde_json::from_slice(data.as_ref())?)
    }

    /// Construct an instance from a JSON file.
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_json(data)
    }

    /// Serialize this instance to a JSON object.
    pub fn to_json_string(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// Write this instance to a JSON file.
    ///
    /// Since the file contains sensitive data, it will have limited read
    /// permissions on platforms where this is implemented. Parent directories
    /// will be created if missing using default permissions for created
    /// directories.
    pub fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = self.to_json_string()?;

        let mut fh = std::fs::File::create(path)?;
        let mut permissions = fh.metadata()?.permissions();
        set_permissions_private(&mut permissions);
        fh.set_permissions(permissions)?;
        fh.write_all(data.as_bytes())?;

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ConnectTokenRequest {
    iss: String,
    iat: u64,
    exp: u64,
    aud: String,
}

/// A JWT Token for use with App Store Connect API.
pub type AppStoreConnectToken = String;

/// Represents a private key used to create JWT tokens for use with App Store Connect.
///
/// See <https://developer.apple.com/documentation/appstoreconnectapi/generating_tokens_for_api_requests>
/// for more details.
///
/// App Store Connect API tokens/JWTs are derived from:
///
/// * A key identifier. This is a short alphanumeric string like `DEADBEEF42`.
/// * An issuer ID. This is likely a UUID.
/// * A private key. Likely ECDSA.
///
/// All these are issued by Apple. You can log in to App Store Connect and
/// see/manage your keys at <https://appstoreconnect.apple.com/access/api>.
#[derive(Clone)]
pub struct ConnectTokenEncoder {
    key_id: String,
    issuer_id: String,
    encoding_key: EncodingKey,
}

impl TryFrom<UnifiedApiKey> for ConnectTokenEncoder {
    type Error = PipelineError;

    fn try_from(value: UnifiedApiKey) -> Result<Self, Self::Error> {
        let der = base64::decode(value.private_key).map_err(|e| {
            PipelineError::ApiKey(format!("failed to base64 decode private key: {}", e))
        })?;

        Self::from_ecdsa_der(value.key_id, value.issuer_id, &der)
    }
}

impl ConnectTokenEncoder {
    /// Construct an instance from an [EncodingKey] instance.
    ///
    /// This is the lowest level API and ultimately what all constructors use.
    pub fn from_jwt_encoding_key(
        key_id: String,
        issuer_id: String,
        encoding_key: EncodingKey,
    ) -> Self {
        Self {
            key_id,
            issuer_id,
            encoding_key,
        }
    }

    /// Construct an instance from a DER encoded ECDSA private key.
    pub fn from_ecdsa_der(
        key_id: String,
        issuer_id: String,
        der_data: &[u8],
    ) -> Result<Self, PipelineError> {
        let encoding_key = EncodingKey::from_ec_der(der_data);

        Ok(Self::from_jwt_encoding_key(key_id, issuer_id, encoding_key))
    }

    /// Create a token from a PEM encoded ECDSA private key.
    pub fn from_ecdsa_pem(
        key_id: String,
        issuer_id: String,
        pem_data: &[u8],
    ) -> Result<Self, PipelineError> {
        let encoding_key = EncodingKey::from_ec_pem(pem_data)?;

        Ok(Self::from_jwt_encoding_key(key_id, issuer_id, encoding_key))
    }

    /// Create a token from a PEM encoded ECDSA private key in a filesystem path.
    pub fn from_ecdsa_pem_path(
        key_id: String,
        issuer_id: String,
        path: impl AsRef<Path>,
    ) -> Result<Self, PipelineError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_ecdsa_pem(key_id, issuer_id, &data)
    }

    /// Attempt to construct an instance from an API Key ID.
    ///
    /// e.g. `DEADBEEF42`. This looks for an `AuthKey_<id>.p8` file in default
    /// search locations like `~/.appstoreconnect/private_keys`.
    pub fn from_api_key_id(key_id: String, issuer_id: String) -> Result<Self, PipelineError> {
        let mut search_paths = vec![std::env::current_dir()?.join("private_keys")];

        if let Some(home) = dirs::home_dir() {
            search_paths.extend([
                home.join("private_keys"),
                home.join(".private_keys"),
                home.join(".appstoreconnect").join("private_keys"),
            ]);
        }

        // AuthKey_<apiKey>.p8
        let filename = format!("AuthKey_{}.p8", key_id);

        for path in search_paths {
            let candidate = path.join(&filename);

            if candidate.exists() {
                return Self::from_ecdsa_pem_path(key_id, issuer_id, candidate);
            }
        }

        Err(PipelineError::ApiKeyNotFound)
    }

    /// Mint a new JWT token.
    ///
    /// Using the private key and key metadata bound to this instance, we issue
    /// a new JWT for the requested duration.
    pub fn new_token(&self, duration: u64) -> Result<AppStoreConnectToken, PipelineError> {
        let header = Header {
            kid: Some(self.key_id.clone()),
            alg: Algorithm::ES256,
            ..Default::default()
        };

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|_| PipelineError::ApiKey("system time before UNIX epoch".to_string()))?
            .as_secs();

        let claims = ConnectTokenRequest {
            iss: self.issuer_id.clone(),
            iat: now,
            exp: now + duration,
            aud: "appstoreconnect-v1".to_string(),
        };

        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)?;

        Ok(token)
    }
}

// The following structs are related to the Notary API, as documented at
// https://developer.apple.com/documentation/notaryapi.

/// Data that you provide when starting a submission to the notary service.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionRequest {
    pub sha256: String,
    pub submission_name: String,
}

/// Information that you use to upload your software for notarization.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseDataAttributes {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: String,
    pub bucket: String,
    pub object: String,
}

/// Information that the notary service provides for uploading your software
/// for notarization and tracking the submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseData {
    pub attributes: NewSubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service's response to a software submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponse {
    pub data: NewSubmissionResponseData,
    pub meta: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum SubmissionResponseStatus {
    Accepted,
    #[serde(rename = "In Progress")]
    InProgress,
    Invalid,
    Rejected,
    #[serde(other)]
    Unknown,
}

/// Information about the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseDataAttributes {
    pub created_date: String,
    pub name: String,
    pub status: SubmissionResponseStatus,
}

/// Information that the service provides about the status of a notarization submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseData {
    pub attributes: SubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service's response to a request for the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    pub data: SubmissionResponseData,
    pub meta: Value,
}

/// Information about the log associated with the submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseDataAttributes {
    developer_log_url: String,
}

/// Data that indicates how to get the log information for a particular submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseData {
    pub attributes: SubmissionLogResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service's response to a request for the log information about a
/// completed submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponse {
    pub data: SubmissionLogResponseData,
    pub meta: Value,
}

// Ticket lookup speaks to a separate, unauthenticated CloudKit service.

/// Main JSON request object for ticket lookup requests.
#[derive(Clone, Debug, Serialize)]
pub struct TicketLookupRequest {
    pub records: Vec<TicketLookupRequestRecord>,
}

/// Represents a single record to look up in a ticket lookup request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupRequestRecord {
    pub record_name: String,
}

/// Main JSON response object to ticket lookup requests.
#[derive(Clone, Debug, Deserialize)]
pub struct TicketLookupResponse {
    pub records: Vec<TicketLookupResponseRecord>,
}

impl TicketLookupResponse {
    /// Obtain the signed ticket for a given record name.
    ///
    /// `record_name` is of the form `2/<digest_type>/<digest>`. e.g.
    /// `2/2/deadbeefdeadbeef....`.
    ///
    /// Returns an `Err` if a signed ticket could not be found.
    pub fn signed_ticket(&self, record_name: &str) -> Result<Vec<u8>, PipelineError> {
        let record = self
            .records
            .iter()
            .find(|r| r.record_name() == record_name)
            .ok_or_else(|| PipelineError::TicketRecordNotFound(record_name.to_string()))?;

        match record {
            TicketLookupResponseRecord::Success(r) => r
                .signed_ticket_data()
                .ok_or_else(|| PipelineError::TicketRecordNotFound(record_name.to_string()))?,
            TicketLookupResponseRecord::Failure(r) => Err(PipelineError::TicketLookupFailure(
                r.server_error_code.clone(),
                r.reason.clone(),
            )),
        }
    }
}

/// Describes the results of a ticket lookup for a specific record.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TicketLookupResponseRecord {
    /// Ticket was found.
    Success(TicketLookupResponseRecordSuccess),

    /// Some error occurred.
    Failure(TicketLookupResponseRecordFailure),
}

impl TicketLookupResponseRecord {
    /// Obtain the record name associated with this record.
    pub fn record_name(&self) -> &str {
        match self {
            Self::Success(r) => &r.record_name,
            Self::Failure(r) => &r.record_name,
        }
    }
}

/// Represents a successful ticket lookup response record.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordSuccess {
    /// Name of record that was looked up.
    pub record_name: String,

    /// Holds data.
    ///
    /// The `signedTicket` key holds the ticket.
    pub fields: HashMap<String, TicketLookupField>,

    /// A value like `DeveloperIDTicket`.
    pub record_type: String,
}

impl TicketLookupResponseRecordSuccess {
    /// Obtain the raw signed ticket data in this record.
    ///
    /// Evaluates to `Some` if there appears to be a signed ticket and `None`
    /// otherwise. There can be an inner `Err` if the field could not be
    /// decoded.
    pub fn signed_ticket_data(&self) -> Option<Result<Vec<u8>, PipelineError>> {
        match self.fields.get("signedTicket") {
            Some(field) => {
                if field.typ == "BYTES" {
                    Some(base64::decode(&field.value).map_err(PipelineError::TicketDecode))
                } else {
                    Some(Err(PipelineError::TicketLookupFailure(
                        "BAD_FIELD_TYPE".to_string(),
                        format!("signedTicket field has type {}", field.typ),
                    )))
                }
            }
            None => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordFailure {
    pub record_name: String,
    pub reason: String,
    pub server_error_code: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TicketLookupField {
    #[serde(rename = "type")]
    pub typ: String,
    pub value: String,
}

/// Obtain the default [Client] to use for HTTP requests.
pub fn default_client() -> Result<Client, PipelineError> {
    Ok(ClientBuilder::default()
        .user_agent("apple-sign-notarize crate (https://crates.io/crates/apple-sign-notarize)")
        .build()?)
}

/// Classify a transport-level HTTP failure.
///
/// Connection and timeout failures are worth retrying. Everything else is
/// propagated as-is so callers see the underlying error.
fn classify_transport_error(error: reqwest::Error) -> PipelineError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        PipelineError::SubmissionTransient(error.to_string())
    } else {
        PipelineError::Reqwest(error)
    }
}

/// Classify a non-success HTTP response from the Notary API.
///
/// Authentication failures will never heal on retry. Server errors and rate
/// limiting are worth retrying.
fn classify_response_status(status: reqwest::StatusCode, context: &str) -> PipelineError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        PipelineError::SubmissionFatal(format!("{}: authentication failed (HTTP {})", context, status))
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        PipelineError::SubmissionTransient(format!("{}: HTTP {}", context, status))
    } else {
        PipelineError::SubmissionFatal(format!("{}: HTTP {}", context, status))
    }
}

/// A client for App Store Connect API.
///
/// The client isn't generic. Don't get any ideas.
pub struct AppStoreConnectClient {
    client: Client,
    connect_token: ConnectTokenEncoder,
    token: Mutex<Option<(AppStoreConnectToken, Instant)>>,
}

impl AppStoreConnectClient {
    pub fn new(connect_token: ConnectTokenEncoder) -> Result<Self, PipelineError> {
        Ok(Self {
            client: default_client()?,
            connect_token,
            token: Mutex::new(None),
        })
    }

    fn get_token(&self) -> Result<String, PipelineError> {
        let mut token = self.token.lock().map_err(|_| {
            PipelineError::SubmissionFatal("API token state poisoned".to_string())
        })?;

        // Re-mint before the old token expires so a long poll never sends a
        // stale token.
        let stale = match token.as_ref() {
            Some((_, minted)) => minted.elapsed().as_secs() >= TOKEN_DURATION - 60,
            None => true,
        };

        if stale {
            token.replace((self.connect_token.new_token(TOKEN_DURATION)?, Instant::now()));
        }

        Ok(token
            .as_ref()
            .map(|(value, _)| value.clone())
            .unwrap_or_default())
    }

    /// Create a submission to the Notary API.
    pub fn create_submission(
        &self,
        sha256: &str,
        submission_name: &str,
    ) -> Result<NewSubmissionResponse, PipelineError> {
        let token = self.get_token()?;

        let body = NewSubmissionRequest {
            sha256: sha256.to_string(),
            submission_name: submission_name.to_string(),
        };
        let req = self
            .client
            .post(APPLE_NOTARY_SUBMIT_SOFTWARE_URL)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(&body);

        let response = req.send().map_err(classify_transport_error)?;

        if response.status() == 200 {
            let res_data = response.json::<NewSubmissionResponse>()?;

            Ok(res_data)
        } else {
            let status = response.status();
            error!("non-200 from Notary API NewSubmissionRequest");
            if let Ok(body) = response.text() {
                error!("{}", body);
            }

            Err(classify_response_status(status, "creating submission"))
        }
    }

    /// Fetch the status of a Notary API submission.
    pub fn get_submission(&self, submission_id: &str) -> Result<SubmissionResponse, PipelineError> {
        let token = self.get_token()?;

        let req = self
            .client
            .get(format!(
                "{}/{}",
                APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id
            ))
            .bearer_auth(token)
            .header("Accept", "application/json");

        let response = req.send().map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(classify_response_status(
                response.status(),
                "fetching submission status",
            ));
        }

        let res_data = response.json::<SubmissionResponse>()?;

        Ok(res_data)
    }

    /// Fetch the developer log for a completed notarization.
    pub fn get_submission_log(&self, submission_id: &str) -> Result<Value, PipelineError> {
        let token = self.get_token()?;

        let req = self
            .client
            .get(format!(
                "{}/{}/logs",
                APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id
            ))
            .bearer_auth(token)
            .header("Accept", "application/json");

        let response = req.send().map_err(classify_transport_error)?;

        let res_data = response.json::<SubmissionLogResponse>()?;

        let url = res_data.data.attributes.developer_log_url;

        let logs = self.client.get(url).send()?.json::<Value>()?;

        Ok(logs)
    }

    /// Look up a notarization ticket by record name.
    ///
    /// The record name is of the form `2/<digest_type>/<code_directory_digest>`.
    pub fn lookup_notarization_ticket(
        &self,
        record_name: &str,
    ) -> Result<TicketLookupResponse, PipelineError> {
        warn!("looking up notarization ticket for {}", record_name);

        let body = TicketLookupRequest {
            records: vec![TicketLookupRequestRecord {
                record_name: record_name.to_string(),
            }],
        };

        let req = self
            .client
            .post(APPLE_TICKET_LOOKUP_URL)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(&body);

        let response = req.send()?;

        let body = response.bytes()?;

        let response = serde_json::from_slice::<TicketLookupResponse>(&body)?;

        Ok(response)
    }
}

/// Upload an archive to the S3 location issued by the Notary API.
///
/// The Notary API hands out short-lived credentials scoped to a single
/// object. Upload failures are transient from the submitter's point of
/// view since a retried submission obtains fresh credentials.
fn upload_archive_s3(
    path: &Path,
    attributes: &NewSubmissionResponseDataAttributes,
) -> Result<(), PipelineError> {
    let credentials = aws_sdk_s3::Credentials::new(
        attributes.aws_access_key_id.clone(),
        attributes.aws_secret_access_key.clone(),
        Some(attributes.aws_session_token.clone()),
        None,
        "notary-api",
    );

    let config = aws_sdk_s3::Config::builder()
        .credentials_provider(credentials)
        .region(aws_sdk_s3::Region::new("us-west-2"))
        .build();

    let client = aws_sdk_s3::Client::from_conf(config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let body = aws_sdk_s3::types::ByteStream::from_path(path).await.map_err(|e| {
            PipelineError::Archive(format!("unable to read archive for upload: {}", e))
        })?;

        info!(
            "uploading archive to s3://{}/{}",
            attributes.bucket, attributes.object
        );

        client
            .put_object()
            .bucket(&attributes.bucket)
            .key(&attributes.object)
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::SubmissionTransient(format!("S3 upload: {}", e)))?;

        Ok(())
    })
}

/// Extract the hex code directory digest from `codesign --display` output.
fn parse_cdhash(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("CDHash=")
            .map(|digest| digest.trim().to_lowercase())
    })
}

/// Obtain the code directory digest of a signed artifact.
///
/// The ticket lookup service keys records by this digest, so we capture it
/// while the signed artifact is still on disk.
fn signed_artifact_cdhash(path: &Path) -> Result<String, PipelineError> {
    let exe = which::which("codesign")
        .map_err(|_| PipelineError::ToolNotFound("codesign".to_string()))?;

    // codesign emits display output on stderr.
    let output = duct::cmd(
        exe,
        vec!["--display".to_string(), "-vvv".to_string(), path.display().to_string()],
    )
    .stderr_to_stdout()
    .stdout_capture()
    .unchecked()
    .run()?;

    let text = String::from_utf8_lossy(&output.stdout);

    parse_cdhash(&text).ok_or_else(|| {
        PipelineError::Staple(format!(
            "unable to determine code directory digest of {}",
            path.display()
        ))
    })
}

/// [NotaryService] backed by the production Notary API.
pub struct AppStoreConnectNotary {
    client: AppStoreConnectClient,
    /// Ticket lookup record name for each submission we created.
    record_names: Mutex<HashMap<String, String>>,
}

impl AppStoreConnectNotary {
    pub fn new(connect_token: ConnectTokenEncoder) -> Result<Self, PipelineError> {
        Ok(Self {
            client: AppStoreConnectClient::new(connect_token)?,
            record_names: Mutex::new(HashMap::new()),
        })
    }

    fn format_developer_log(&self, submission_id: &str) -> Option<String> {
        match self.client.get_submission_log(submission_id) {
            Ok(value) => serde_json::to_string_pretty(&value).ok(),
            Err(error) => {
                warn!(
                    "unable to fetch developer log for {}: {}",
                    submission_id, error
                );
                None
            }
        }
    }
}

impl NotaryService for AppStoreConnectNotary {
    fn submit(&self, archive: &SubmissionArchive) -> Result<String, PipelineError> {
        let submission_name = archive
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "submission.zip".to_string());

        // Capture the primary artifact's digest before upload so the
        // stapling ticket can be located later without re-signing state.
        let record_name = archive
            .primary_artifact
            .as_deref()
            .map(|primary| -> Result<String, PipelineError> {
                Ok(format!("2/2/{}", signed_artifact_cdhash(primary)?))
            })
            .transpose()?;

        let response = self.client.create_submission(&archive.sha256, &submission_name)?;
        let id = response.data.id.clone();

        upload_archive_s3(&archive.path, &response.data.attributes)?;

        if let Some(record_name) = record_name {
            self.record_names
                .lock()
                .map_err(|_| {
                    PipelineError::SubmissionFatal("record name state poisoned".to_string())
                })?
                .insert(id.clone(), record_name);
        }

        Ok(id)
    }

    fn status(&self, submission_id: &str) -> Result<StatusResponse, PipelineError> {
        let response = self.client.get_submission(submission_id)?;

        match response.data.attributes.status {
            SubmissionResponseStatus::InProgress => Ok(StatusResponse {
                status: ServiceStatus::InProgress,
                log: None,
            }),
            SubmissionResponseStatus::Accepted => Ok(StatusResponse {
                status: ServiceStatus::Accepted,
                log: None,
            }),
            SubmissionResponseStatus::Invalid | SubmissionResponseStatus::Rejected => {
                Ok(StatusResponse {
                    status: ServiceStatus::Rejected,
                    log: self.format_developer_log(submission_id),
                })
            }
            SubmissionResponseStatus::Unknown => {
                // New statuses the service may grow are treated as still
                // processing rather than aborting the wait.
                warn!("service reported unrecognized status; continuing to poll");
                Ok(StatusResponse {
                    status: ServiceStatus::InProgress,
                    log: None,
                })
            }
        }
    }

    fn fetch_ticket(&self, submission_id: &str) -> Result<Vec<u8>, PipelineError> {
        let record_name = self
            .record_names
            .lock()
            .map_err(|_| PipelineError::SubmissionFatal("record name state poisoned".to_string()))?
            .get(submission_id)
            .cloned()
            .ok_or_else(|| PipelineError::TicketRecordNotFound(submission_id.to_string()))?;

        let response = self.client.lookup_notarization_ticket(&record_name)?;

        response.signed_ticket(&record_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn submission_status_deserializes_service_strings() {
        let json = r#"{
            "data": {
                "attributes": {
                    "createdDate": "2022-06-08T01:38:09.498Z",
                    "name": "app.zip",
                    "status": "In Progress"
                },
                "id": "2efe2717-52ef-43a5-96dc-0797e4ca1041",
                "type": "submissions"
            },
            "meta": {}
        }"#;

        let response = serde_json::from_str::<SubmissionResponse>(json).unwrap();
        assert_eq!(
            response.data.attributes.status,
            SubmissionResponseStatus::InProgress
        );

        let json = json.replace("In Progress", "SomeFutureStatus");
        let response = serde_json::from_str::<SubmissionResponse>(&json).unwrap();
        assert_eq!(
            response.data.attributes.status,
            SubmissionResponseStatus::Unknown
        );
    }

    #[test]
    fn ticket_lookup_success_and_failure_records() {
        let json = r#"{
            "records": [
                {
                    "recordName": "2/2/deadbeef",
                    "recordType": "DeveloperIDTicket",
                    "fields": {
                        "signedTicket": {"type": "BYTES", "value": "czhjaA=="}
                    }
                },
                {
                    "recordName": "2/2/feedface",
                    "reason": "Record not found",
                    "serverErrorCode": "NOT_FOUND"
                }
            ]
        }"#;

        let response = serde_json::from_str::<TicketLookupResponse>(json).unwrap();

        let ticket = response.signed_ticket("2/2/deadbeef").unwrap();
        assert_eq!(&ticket, b"s8ch");

        assert!(matches!(
            response.signed_ticket("2/2/feedface"),
            Err(PipelineError::TicketLookupFailure(_, _))
        ));
        assert!(matches!(
            response.signed_ticket("2/2/00000000"),
            Err(PipelineError::TicketRecordNotFound(_))
        ));
    }

    #[test]
    fn cdhash_parsing() {
        let output = "Executable=/tmp/app\nIdentifier=com.example.app\nCDHash=1B747FAF223750de74febed7929f14a73af8c933\nSignature size=8968\n";
        assert_eq!(
            parse_cdhash(output).as_deref(),
            Some("1b747faf223750de74febed7929f14a73af8c933")
        );

        assert!(parse_cdhash("code object is not signed at all").is_none());
    }

    #[test]
    fn unified_api_key_json_round_trip() -> Result<(), PipelineError> {
        let key = UnifiedApiKey {
            issuer_id: "issuer".to_string(),
            key_id: "DEADBEEF42".to_string(),
            private_key: base64::encode(b"not really a key"),
        };

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys").join("unified.json");
        key.write_json_file(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = UnifiedApiKey::from_json_path(&path)?;
        assert_eq!(loaded.key_id, key.key_id);
        assert_eq!(loaded.issuer_id, key.issuer_id);
        assert_eq!(loaded.private_key, key.private_key);

        Ok(())
    }
}
