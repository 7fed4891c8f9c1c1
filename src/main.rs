use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use fs2::FileExt;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = ".platform";
const CONFIG_LOCK_FILE_NAME: &str = ".platform.lock";
const OAUTH_CLIENT_ID: &str = "platform-cli";
const TOKEN_ENDPOINT: &str = "https://marketplace.commerceguys.com/oauth2/token";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const TOKEN_EXPIRY_LEEWAY_SECS: i64 = 10;
const USER_AGENT: &str = "platform-cli/0.1";
const ACCOUNTS_DESCRIPTION: &str = include_str!("../services/accounts.json");
const PLATFORM_DESCRIPTION: &str = include_str!("../services/platform.json");

type GrantClient = Arc<dyn Fn(&GrantRequest) -> CliResult<TokenPayload> + Send + Sync>;
type HttpTransport = Arc<dyn Fn(&PreparedRequest, &str) -> CliResult<RawResponse> + Send + Sync>;

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read {}: {source}", .path.display())]
    ConfigUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is malformed ({message}); fix or delete it", .path.display())]
    ConfigMalformed { path: PathBuf, message: String },
    #[error("authentication failed: {0}; check the email and password in ~/.platform")]
    AuthFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote service error ({status}): {message}")]
    RemoteService { status: u16, message: String },
    #[error("token request rejected ({status}): {message}")]
    GrantRejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("failed to write config: {0}")]
    Persist(String),
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::AuthFailed(_) | Self::GrantRejected { .. } => 3,
            _ => 1,
        }
    }

    fn is_config_missing(&self) -> bool {
        matches!(
            self,
            Self::ConfigUnreadable { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, PartialEq)]
enum CliCommand {
    Help,
    Projects {
        refresh: bool,
    },
    Status,
    Operations(ServiceKind),
    Init(String),
    Call {
        operation: String,
        project: Option<String>,
        params: BTreeMap<String, Value>,
    },
}

impl CliCommand {
    fn parse(args: &[String]) -> CliResult<Self> {
        let Some(first) = args.first() else {
            return Ok(Self::Projects { refresh: false });
        };

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Self::Help),
            "projects" | "ls" => match &args[1..] {
                [] => Ok(Self::Projects { refresh: false }),
                [flag] if flag == "--refresh" => Ok(Self::Projects { refresh: true }),
                _ => Err(CliError::Usage(
                    "usage: platform projects [--refresh]".to_string(),
                )),
            },
            "status" => {
                if args.len() != 1 {
                    return Err(CliError::Usage("usage: platform status".to_string()));
                }
                Ok(Self::Status)
            }
            "operations" => match &args[1..] {
                [] => Ok(Self::Operations(ServiceKind::Accounts)),
                [kind] if kind == "accounts" => Ok(Self::Operations(ServiceKind::Accounts)),
                [kind] if kind == "platform" => Ok(Self::Operations(ServiceKind::Platform)),
                _ => Err(CliError::Usage(
                    "usage: platform operations [accounts|platform]".to_string(),
                )),
            },
            "init" => {
                if args.len() != 2 {
                    return Err(CliError::Usage("usage: platform init <email>".to_string()));
                }
                Ok(Self::Init(args[1].clone()))
            }
            "call" => Self::parse_call(&args[1..]),
            _ => Err(CliError::Usage(format!("unknown command: {}", first))),
        }
    }

    fn parse_call(args: &[String]) -> CliResult<Self> {
        let usage = || {
            CliError::Usage(
                "usage: platform call <operation> [--project <name>] [key=value ...]".to_string(),
            )
        };
        let Some(operation) = args.first() else {
            return Err(usage());
        };

        let mut project = None;
        let mut params = BTreeMap::new();
        let mut i = 1;
        while i < args.len() {
            if args[i] == "--project" {
                i += 1;
                let name = args.get(i).ok_or_else(usage)?;
                project = Some(name.clone());
            } else {
                let (key, raw) = args[i].split_once('=').ok_or_else(usage)?;
                if key.is_empty() {
                    return Err(usage());
                }
                let value = serde_json::from_str::<Value>(raw)
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                params.insert(key.to_string(), value);
            }
            i += 1;
        }

        Ok(Self::Call {
            operation: operation.clone(),
            project,
            params,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Config {
    email: String,
    password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    projects: BTreeMap<String, ProjectRecord>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    fn new(email: &str, password: &str) -> Self {
        Self {
            email: email.to_string(),
            password: password.to_string(),
            access_token: None,
            refresh_token: None,
            projects: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ProjectRecord {
    name: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl ProjectRecord {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let name = object.get("name")?.as_str()?.to_string();
        let mut fields = object.clone();
        fields.remove("name");
        Some(Self { name, fields })
    }

    fn endpoint(&self) -> Option<&str> {
        self.fields
            .get("endpoint")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    config: Option<Config>,
}

impl ConfigStore {
    fn new(home_dir: &Path) -> Self {
        Self {
            path: home_dir.join(CONFIG_FILE_NAME),
            lock_path: home_dir.join(CONFIG_LOCK_FILE_NAME),
            config: None,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn has_configuration(&self) -> bool {
        self.path.is_file()
    }

    fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    // Reads the file on first use only; later calls return the in-memory copy.
    fn load(&mut self) -> CliResult<&mut Config> {
        let config = match self.config.take() {
            Some(config) => config,
            None => self.read()?,
        };
        Ok(self.config.insert(config))
    }

    fn seed(&mut self, config: Config) {
        self.config = Some(config);
    }

    fn discard(&mut self) {
        self.config = None;
    }

    fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    fn config_mut(&mut self) -> Option<&mut Config> {
        self.config.as_mut()
    }

    fn read(&self) -> CliResult<Config> {
        let data = fs::read_to_string(&self.path).map_err(|source| CliError::ConfigUnreadable {
            path: self.path.clone(),
            source,
        })?;
        serde_yaml::from_str::<Config>(&data).map_err(|err| CliError::ConfigMalformed {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn persist(&self) -> CliResult<bool> {
        let Some(config) = &self.config else {
            return Ok(false);
        };

        let data = serde_yaml::to_string(config)
            .map_err(|err| CliError::Persist(format!("failed to encode config: {}", err)))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| {
                CliError::Persist(format!(
                    "failed to open lock file {}: {}",
                    self.lock_path.display(),
                    err
                ))
            })?;
        let _ = lock_file.set_permissions(fs::Permissions::from_mode(0o600));
        FileExt::lock_exclusive(&lock_file).map_err(|err| {
            CliError::Persist(format!(
                "failed to acquire lock {}: {}",
                self.lock_path.display(),
                err
            ))
        })?;

        let result = write_file_atomic(&self.path, data.as_bytes());
        let _ = FileExt::unlock(&lock_file);
        result.map(|_| true)
    }
}

struct ActivityLog {
    log_dir: PathBuf,
    log_file: PathBuf,
    max_log_bytes: u64,
    trace_id: String,
}

impl ActivityLog {
    fn new(log_dir: PathBuf) -> Self {
        let log_file = log_dir.join("activity.log");
        Self {
            log_dir,
            log_file,
            max_log_bytes: 5 * 1024 * 1024,
            trace_id: new_trace_id(),
        }
    }

    fn write(&self, event: &str, fields: &[(&str, Option<String>)]) {
        let _ = self.write_inner(event, fields);
    }

    fn write_inner(&self, event: &str, fields: &[(&str, Option<String>)]) -> std::io::Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        self.rotate_if_needed()?;

        let mut payload = Map::new();
        payload.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        payload.insert("event".to_string(), Value::String(event.to_string()));
        payload.insert("trace_id".to_string(), Value::String(self.trace_id.clone()));
        for (key, value) in fields {
            let Some(value) = value else { continue };
            let trimmed = value.trim();
            if trimmed.is_empty() {
                continue;
            }
            payload.insert((*key).to_string(), Value::String(trimmed.to_string()));
        }

        let line = match serde_json::to_string(&Value::Object(payload)) {
            Ok(value) => format!("{}\n", value),
            Err(_) => return Ok(()),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        file.write_all(line.as_bytes())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.log_file) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_log_bytes {
            return Ok(());
        }

        let rotated = self.log_dir.join("activity.log.1");
        if rotated.exists() {
            let _ = fs::remove_file(&rotated);
        }
        fs::rename(&self.log_file, rotated)
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    token_endpoint: String,
    accounts_url: Option<String>,
    client_id: String,
    timeout: Duration,
    services_dir: Option<PathBuf>,
}

impl Endpoints {
    fn from_env() -> Self {
        let timeout_secs = env_override("PLATFORM_CLI_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        Self {
            token_endpoint: env_override("PLATFORM_CLI_TOKEN_URL")
                .unwrap_or_else(|| TOKEN_ENDPOINT.to_string()),
            accounts_url: env_override("PLATFORM_CLI_ACCOUNTS_URL"),
            client_id: OAUTH_CLIENT_ID.to_string(),
            timeout: Duration::from_secs(timeout_secs),
            services_dir: env_override("PLATFORM_CLI_SERVICES_DIR").map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    Password { username: String, password: String },
    RefreshToken { refresh_token: String },
}

impl Grant {
    fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }
}

#[derive(Debug, Clone)]
struct GrantRequest {
    token_endpoint: String,
    client_id: String,
    grant: Grant,
}

impl GrantRequest {
    fn form_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![("grant_type", self.grant.kind())];
        match &self.grant {
            Grant::Password { username, password } => {
                fields.push(("username", username.as_str()));
                fields.push(("password", password.as_str()));
            }
            Grant::RefreshToken { refresh_token } => {
                fields.push(("refresh_token", refresh_token.as_str()));
            }
        }
        fields.push(("client_id", self.client_id.as_str()));
        fields
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TokenPayload {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Uninitialized,
    Valid,
    Refreshing,
    AuthFailed,
}

struct TokenProvider {
    token_endpoint: String,
    client_id: String,
    username: String,
    password: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    state: TokenState,
    grant_client: GrantClient,
    log: Arc<ActivityLog>,
}

impl TokenProvider {
    fn initialize(
        config: &Config,
        endpoints: &Endpoints,
        grant_client: GrantClient,
        log: Arc<ActivityLog>,
    ) -> Self {
        let access_token = non_blank(config.access_token.as_deref());
        let refresh_token = non_blank(config.refresh_token.as_deref());
        let expires_at = access_token.as_deref().and_then(jwt_expiry);
        let state = if access_token.is_some() {
            TokenState::Valid
        } else {
            TokenState::Uninitialized
        };

        log.write(
            "token_seeded",
            &[
                ("access_token", token_fingerprint(access_token.as_deref())),
                ("refresh_token", token_fingerprint(refresh_token.as_deref())),
                ("expires_at", expires_at.map(|at| at.to_rfc3339())),
            ],
        );

        Self {
            token_endpoint: endpoints.token_endpoint.clone(),
            client_id: endpoints.client_id.clone(),
            username: config.email.clone(),
            password: config.password.clone(),
            access_token,
            refresh_token,
            expires_at,
            state,
            grant_client,
            log,
        }
    }

    fn state(&self) -> TokenState {
        self.state
    }

    fn current_access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    fn access_token(&mut self) -> CliResult<String> {
        self.token_for_request().map(|(token, _)| token)
    }

    // The flag is true when a grant ran to produce the token.
    fn token_for_request(&mut self) -> CliResult<(String, bool)> {
        self.ensure_not_failed()?;
        if let Some(token) = &self.access_token {
            if !self.is_expired(Utc::now()) {
                return Ok((token.clone(), false));
            }
            return self.renew().map(|token| (token, true));
        }
        self.password_grant().map(|token| (token, true))
    }

    fn renew(&mut self) -> CliResult<String> {
        self.ensure_not_failed()?;
        self.state = TokenState::Refreshing;
        self.log.write(
            "token_renew",
            &[
                ("access_token", token_fingerprint(self.access_token.as_deref())),
                ("has_refresh_token", Some(self.refresh_token.is_some().to_string())),
            ],
        );

        if let Some(refresh_token) = self.refresh_token.clone() {
            match self.execute(Grant::RefreshToken { refresh_token }) {
                Ok(token) => return Ok(token),
                Err(CliError::GrantRejected { .. }) => {}
                Err(err) => {
                    self.settle_state();
                    return Err(err);
                }
            }
        }
        self.password_grant()
    }

    fn password_grant(&mut self) -> CliResult<String> {
        let grant = Grant::Password {
            username: self.username.clone(),
            password: self.password.clone(),
        };
        match self.execute(grant) {
            Ok(token) => Ok(token),
            Err(CliError::GrantRejected { status, message }) => {
                self.state = TokenState::AuthFailed;
                self.access_token = None;
                self.refresh_token = None;
                self.expires_at = None;
                Err(CliError::AuthFailed(format!(
                    "the token endpoint rejected the credentials ({}): {}",
                    status, message
                )))
            }
            Err(err) => {
                self.settle_state();
                Err(err)
            }
        }
    }

    fn execute(&mut self, grant: Grant) -> CliResult<String> {
        let kind = grant.kind();
        let request = GrantRequest {
            token_endpoint: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            grant,
        };

        match (self.grant_client)(&request) {
            Ok(payload) => {
                let token = self.apply(payload);
                self.log.write(
                    "token_grant",
                    &[
                        ("grant", Some(kind.to_string())),
                        ("outcome", Some("success".to_string())),
                        ("access_token", token_fingerprint(Some(token.as_str()))),
                        ("expires_at", self.expires_at.map(|at| at.to_rfc3339())),
                    ],
                );
                Ok(token)
            }
            Err(err) => {
                let outcome = if matches!(err, CliError::GrantRejected { .. }) {
                    "rejected"
                } else {
                    "error"
                };
                self.log.write(
                    "token_grant",
                    &[
                        ("grant", Some(kind.to_string())),
                        ("outcome", Some(outcome.to_string())),
                        ("error", Some(truncate_chars(&err.to_string(), 200))),
                    ],
                );
                Err(err)
            }
        }
    }

    fn apply(&mut self, payload: TokenPayload) -> String {
        let now = Utc::now();
        self.expires_at = match payload.expires_in {
            Some(seconds) => expiry_after(now, seconds),
            None => jwt_expiry(&payload.access_token),
        };
        if let Some(refresh_token) = non_blank(payload.refresh_token.as_deref()) {
            self.refresh_token = Some(refresh_token);
        }
        self.access_token = Some(payload.access_token.clone());
        self.state = TokenState::Valid;
        payload.access_token
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now + chrono::Duration::seconds(TOKEN_EXPIRY_LEEWAY_SECS))
    }

    fn ensure_not_failed(&self) -> CliResult<()> {
        if self.state == TokenState::AuthFailed {
            return Err(CliError::AuthFailed(
                "an earlier token request in this command was rejected".to_string(),
            ));
        }
        Ok(())
    }

    fn settle_state(&mut self) {
        self.state = if self.access_token.is_some() {
            TokenState::Valid
        } else {
            TokenState::Uninitialized
        };
    }
}

fn lock_provider(tokens: &Mutex<TokenProvider>) -> CliResult<MutexGuard<'_, TokenProvider>> {
    tokens
        .lock()
        .map_err(|_| CliError::AuthFailed("token state is unavailable".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceKind {
    Accounts,
    Platform,
}

impl ServiceKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::Accounts => "accounts.json",
            Self::Platform => "platform.json",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Self::Accounts => ACCOUNTS_DESCRIPTION,
            Self::Platform => PLATFORM_DESCRIPTION,
        }
    }

    fn load_description(self, override_dir: Option<&Path>) -> CliResult<ServiceDescription> {
        let override_path = override_dir
            .map(|dir| dir.join(self.file_name()))
            .filter(|path| path.is_file());
        match override_path {
            Some(path) => {
                let raw = fs::read_to_string(&path).map_err(|err| {
                    CliError::InvalidRequest(format!(
                        "failed to read service description {}: {}",
                        path.display(),
                        err
                    ))
                })?;
                ServiceDescription::parse(&raw, &path.display().to_string())
            }
            None => ServiceDescription::parse(self.builtin(), self.file_name()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDescription {
    name: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    operations: BTreeMap<String, OperationSpec>,
}

impl ServiceDescription {
    fn parse(raw: &str, source: &str) -> CliResult<Self> {
        serde_json::from_str::<Self>(raw).map_err(|err| {
            CliError::InvalidRequest(format!("invalid service description {}: {}", source, err))
        })
    }

    fn operation(&self, name: &str) -> CliResult<&OperationSpec> {
        self.operations.get(name).ok_or_else(|| {
            CliError::InvalidRequest(format!(
                "the {} service has no operation named {}",
                self.name, name
            ))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationSpec {
    http_method: String,
    uri: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    response_model: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, ParameterSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParameterSpec {
    location: ParameterLocation,
    #[serde(default, rename = "type")]
    kind: Option<ParameterType>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ParameterLocation {
    Uri,
    Query,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    fn name(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
        }
    }

    fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(raw)) => Some(Value::String(raw)),
            (Self::String, value @ (Value::Number(_) | Value::Bool(_))) => {
                Some(Value::String(value.to_string()))
            }
            (Self::Integer, Value::Number(number)) if number.is_i64() || number.is_u64() => {
                Some(Value::Number(number))
            }
            (Self::Integer, Value::String(raw)) => raw.trim().parse::<i64>().ok().map(Value::from),
            (Self::Number, Value::Number(number)) => Some(Value::Number(number)),
            (Self::Number, Value::String(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::Bool(flag)) => Some(Value::Bool(flag)),
            (Self::Boolean, Value::String(raw)) => match raw.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::Array, Value::Array(items)) => Some(Value::Array(items)),
            (Self::Object, Value::Object(object)) => Some(Value::Object(object)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PreparedRequest {
    method: String,
    url: String,
    body: Option<Value>,
}

#[derive(Debug, Clone)]
struct RawResponse {
    status: u16,
    body: String,
}

struct ServiceClient {
    base_url: Url,
    description: ServiceDescription,
    tokens: Arc<Mutex<TokenProvider>>,
    transport: HttpTransport,
    log: Arc<ActivityLog>,
}

impl ServiceClient {
    fn new(
        base_url: &str,
        description: ServiceDescription,
        tokens: Arc<Mutex<TokenProvider>>,
        transport: HttpTransport,
        log: Arc<ActivityLog>,
    ) -> CliResult<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            description,
            tokens,
            transport,
            log,
        })
    }

    fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn call(&self, operation: &str, params: &BTreeMap<String, Value>) -> CliResult<Value> {
        let request = self.prepare(operation, params)?;
        let (token, fresh) = lock_provider(&self.tokens)?.token_for_request()?;
        let response = (self.transport)(&request, &token)?;

        if response.status == 401 && fresh {
            self.log_failure(operation, &request, response.status);
            return Err(CliError::AuthFailed(format!(
                "{} was rejected with a newly issued access token",
                operation
            )));
        }
        let response = if response.status == 401 {
            self.log.write(
                "request_retry_after_auth",
                &[
                    ("operation", Some(operation.to_string())),
                    ("url", Some(request.url.clone())),
                ],
            );
            let token = lock_provider(&self.tokens)?.renew()?;
            let retried = (self.transport)(&request, &token)?;
            if retried.status == 401 {
                self.log_failure(operation, &request, retried.status);
                return Err(CliError::AuthFailed(format!(
                    "{} was rejected again after renewing the access token",
                    operation
                )));
            }
            retried
        } else {
            response
        };

        if !(200..300).contains(&response.status) {
            self.log_failure(operation, &request, response.status);
            return Err(CliError::RemoteService {
                status: response.status,
                message: error_message_from_body(&response.body),
            });
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str::<Value>(&response.body).map_err(|err| {
            CliError::MalformedResponse(format!("{} returned a non-JSON body: {}", operation, err))
        })
    }

    fn prepare(&self, operation: &str, params: &BTreeMap<String, Value>) -> CliResult<PreparedRequest> {
        let op = self.description.operation(operation)?;
        if let Some(unknown) = params.keys().find(|name| !op.parameters.contains_key(*name)) {
            return Err(CliError::InvalidRequest(format!(
                "operation {} has no parameter named {}",
                operation, unknown
            )));
        }

        let mut uri_values = HashMap::new();
        let mut query = Vec::new();
        let mut body = Map::new();
        for (name, parameter) in &op.parameters {
            let value = match params.get(name).cloned().or_else(|| parameter.default.clone()) {
                Some(value) => value,
                None if parameter.required => {
                    return Err(CliError::InvalidRequest(format!(
                        "operation {} requires parameter {}",
                        operation, name
                    )));
                }
                None => continue,
            };
            let value = match parameter.kind {
                Some(kind) => kind.coerce(value).ok_or_else(|| {
                    CliError::InvalidRequest(format!(
                        "parameter {} of {} must be {}",
                        name,
                        operation,
                        kind.name()
                    ))
                })?,
                None => value,
            };
            match parameter.location {
                ParameterLocation::Uri => {
                    uri_values.insert(name.as_str(), scalar_text(&value));
                }
                ParameterLocation::Query => query.push((name.as_str(), scalar_text(&value))),
                ParameterLocation::Json => {
                    body.insert(name.clone(), value);
                }
            }
        }

        let mut url = expand_uri(&self.base_url, &op.uri, &uri_values)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &query {
                pairs.append_pair(name, value);
            }
        }

        Ok(PreparedRequest {
            method: op.http_method.to_ascii_uppercase(),
            url: url.to_string(),
            body: if body.is_empty() {
                None
            } else {
                Some(Value::Object(body))
            },
        })
    }

    fn log_failure(&self, operation: &str, request: &PreparedRequest, status: u16) {
        self.log.write(
            "request_failed",
            &[
                ("operation", Some(operation.to_string())),
                ("url", Some(request.url.clone())),
                ("status", Some(status.to_string())),
            ],
        );
    }
}

struct Session {
    store: ConfigStore,
    endpoints: Endpoints,
    log: Arc<ActivityLog>,
    grant_client: GrantClient,
    transport: HttpTransport,
    tokens: Option<Arc<Mutex<TokenProvider>>>,
    account_client: Option<Arc<ServiceClient>>,
    platform_clients: HashMap<String, Arc<ServiceClient>>,
}

impl Session {
    fn new(home_dir: PathBuf) -> CliResult<Self> {
        let endpoints = Endpoints::from_env();
        let http = reqwest::blocking::Client::builder()
            .timeout(endpoints.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| CliError::Network(format!("failed to build HTTP client: {}", err)))?;

        let grant_http = http.clone();
        let grant_client: GrantClient =
            Arc::new(move |request: &GrantRequest| default_grant_client(&grant_http, request));
        let transport: HttpTransport = Arc::new(move |request: &PreparedRequest, token: &str| {
            default_transport(&http, request, token)
        });

        Ok(Self::with_clients(home_dir, endpoints, grant_client, transport))
    }

    fn with_clients(
        home_dir: PathBuf,
        endpoints: Endpoints,
        grant_client: GrantClient,
        transport: HttpTransport,
    ) -> Self {
        Self {
            store: ConfigStore::new(&home_dir),
            endpoints,
            log: Arc::new(ActivityLog::new(home_dir.join(".platform-cli").join("logs"))),
            grant_client,
            transport,
            tokens: None,
            account_client: None,
            platform_clients: HashMap::new(),
        }
    }

    fn run<T, F>(mut self, body: F) -> CliResult<T>
    where
        F: FnOnce(&mut Session) -> CliResult<T>,
    {
        let result = body(&mut self);
        self.finalize();
        result
    }

    fn ensure_config_loaded(&mut self) -> CliResult<()> {
        if self.store.is_loaded() {
            return Ok(());
        }
        let config = self.store.load()?;
        let projects = config.projects.len();
        self.log.write(
            "config_loaded",
            &[
                ("path", Some(self.store.path().display().to_string())),
                ("projects", Some(projects.to_string())),
            ],
        );
        Ok(())
    }

    fn token_provider(&mut self) -> CliResult<Arc<Mutex<TokenProvider>>> {
        if let Some(tokens) = &self.tokens {
            return Ok(Arc::clone(tokens));
        }
        self.ensure_config_loaded()?;
        let config = self.store.load()?;
        let provider = TokenProvider::initialize(
            config,
            &self.endpoints,
            Arc::clone(&self.grant_client),
            Arc::clone(&self.log),
        );
        let tokens = Arc::new(Mutex::new(provider));
        self.tokens = Some(Arc::clone(&tokens));
        Ok(tokens)
    }

    fn account_client(&mut self) -> CliResult<Arc<ServiceClient>> {
        if let Some(client) = &self.account_client {
            return Ok(Arc::clone(client));
        }
        let description =
            ServiceKind::Accounts.load_description(self.endpoints.services_dir.as_deref())?;
        let base_url = self
            .endpoints
            .accounts_url
            .clone()
            .or_else(|| description.base_url.clone())
            .ok_or_else(|| {
                CliError::InvalidRequest("the accounts service has no base URL".to_string())
            })?;
        let tokens = self.token_provider()?;
        let client = Arc::new(ServiceClient::new(
            &base_url,
            description,
            tokens,
            Arc::clone(&self.transport),
            Arc::clone(&self.log),
        )?);
        self.account_client = Some(Arc::clone(&client));
        Ok(client)
    }

    // Keyed by normalized base URL, not first-built-wins.
    fn platform_client(&mut self, base_url: &str) -> CliResult<Arc<ServiceClient>> {
        let key = base_url_key(&parse_base_url(base_url)?);
        if let Some(client) = self.platform_clients.get(&key) {
            return Ok(Arc::clone(client));
        }
        let description =
            ServiceKind::Platform.load_description(self.endpoints.services_dir.as_deref())?;
        let tokens = self.token_provider()?;
        let client = Arc::new(ServiceClient::new(
            &key,
            description,
            tokens,
            Arc::clone(&self.transport),
            Arc::clone(&self.log),
        )?);
        self.log.write(
            "platform_client_built",
            &[("base_url", Some(client.base_url().to_string()))],
        );
        self.platform_clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    fn projects(&mut self, refresh: bool) -> CliResult<BTreeMap<String, ProjectRecord>> {
        self.ensure_config_loaded()?;
        let cached = self.store.load()?.projects.clone();
        if !refresh && !cached.is_empty() {
            return Ok(cached);
        }

        let client = self.account_client()?;
        let data = client.call("getProjects", &BTreeMap::new())?;
        let projects = index_projects(&machine_name_pattern()?, &data, &self.log)?;
        self.store.load()?.projects = projects.clone();
        self.log.write(
            "projects_refreshed",
            &[
                ("previous", Some(cached.len().to_string())),
                ("current", Some(projects.len().to_string())),
            ],
        );
        Ok(projects)
    }

    fn project_endpoint(&mut self, machine_name: &str) -> CliResult<String> {
        self.ensure_config_loaded()?;
        let fetched = self.store.load()?.projects.is_empty();
        let mut projects = self.projects(false)?;
        if !fetched && !projects.contains_key(machine_name) {
            projects = self.projects(true)?;
        }
        let project = projects
            .get(machine_name)
            .ok_or_else(|| CliError::Usage(format!("unknown project: {}", machine_name)))?;
        project.endpoint().map(str::to_string).ok_or_else(|| {
            CliError::MalformedResponse(format!("project {} has no endpoint", machine_name))
        })
    }

    fn call(
        &mut self,
        operation: &str,
        project: Option<&str>,
        params: &BTreeMap<String, Value>,
    ) -> CliResult<Value> {
        let client = match project {
            Some(machine_name) => {
                let endpoint = self.project_endpoint(machine_name)?;
                self.platform_client(&endpoint)?
            }
            None => self.account_client()?,
        };
        client.call(operation, params)
    }

    fn init(&mut self, email: &str, password: &str) -> CliResult<()> {
        if self.store.has_configuration() {
            return Err(CliError::Usage(format!(
                "{} already exists; delete it to set up again",
                self.store.path().display()
            )));
        }
        if email.trim().is_empty() || password.is_empty() {
            return Err(CliError::Usage(
                "an email and PLATFORM_CLI_PASSWORD are required".to_string(),
            ));
        }

        self.store.seed(Config::new(email.trim(), password));
        let verified = self.token_provider().and_then(|tokens| {
            lock_provider(&tokens).and_then(|mut provider| provider.access_token())
        });
        if let Err(err) = verified {
            self.store.discard();
            self.tokens = None;
            return Err(err);
        }
        Ok(())
    }

    fn status_lines(&mut self) -> CliResult<Vec<String>> {
        let mut lines = vec![format!("Config: {}", self.store.path().display())];
        if !self.store.has_configuration() && !self.store.is_loaded() {
            lines.push("Configured: no".to_string());
            return Ok(lines);
        }
        self.ensure_config_loaded()?;
        let config = self.store.load()?;
        lines.push("Configured: yes".to_string());
        lines.push(format!("Email: {}", config.email));
        lines.push(format!(
            "Access token: {}",
            describe_token(config.access_token.as_deref())
        ));
        lines.push(format!(
            "Refresh token: {}",
            describe_token(config.refresh_token.as_deref())
        ));
        lines.push(format!("Cached projects: {}", config.projects.len()));
        Ok(lines)
    }

    fn finalize(&mut self) {
        if let Some(tokens) = &self.tokens {
            let snapshot = tokens.lock().map(|provider| {
                (
                    provider.current_access_token().map(str::to_string),
                    provider.refresh_token().map(str::to_string),
                )
            });
            if let (Ok((access_token, refresh_token)), Some(config)) =
                (snapshot, self.store.config_mut())
            {
                config.access_token = access_token;
                config.refresh_token = refresh_token;
            }
        }

        let token_state = self
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.lock().ok().map(|provider| provider.state()));
        match self.store.persist() {
            Ok(true) => {
                let config = self.store.config();
                self.log.write(
                    "config_persisted",
                    &[
                        ("path", Some(self.store.path().display().to_string())),
                        ("token_state", token_state.map(|state| format!("{:?}", state))),
                        (
                            "access_token",
                            token_fingerprint(config.and_then(|c| c.access_token.as_deref())),
                        ),
                    ],
                );
            }
            Ok(false) => {}
            Err(err) => {
                self.log.write(
                    "config_persist_failed",
                    &[("error", Some(err.to_string()))],
                );
                eprintln!("platform: warning: {}", err);
            }
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("platform: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> CliResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;
    if command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    if let CliCommand::Operations(kind) = command {
        let services_dir = env_override("PLATFORM_CLI_SERVICES_DIR").map(PathBuf::from);
        for line in operation_lines(kind, services_dir.as_deref())? {
            println!("{}", line);
        }
        return Ok(());
    }

    let session = Session::new(default_home_dir()?)?;
    session
        .run(|session| execute(session, command))
        .map_err(|err| {
            if err.is_config_missing() {
                CliError::Usage(
                    "platform is not configured yet; run `platform init <email>` first"
                        .to_string(),
                )
            } else {
                err
            }
        })
}

fn execute(session: &mut Session, command: CliCommand) -> CliResult<()> {
    match command {
        CliCommand::Help => {
            print_usage();
            Ok(())
        }
        CliCommand::Projects { refresh } => {
            let projects = session.projects(refresh)?;
            if projects.is_empty() {
                println!("No projects found.");
            }
            for (machine_name, project) in &projects {
                println!("{}\t{}", machine_name, project.name);
            }
            Ok(())
        }
        CliCommand::Status => {
            for line in session.status_lines()? {
                println!("{}", line);
            }
            Ok(())
        }
        CliCommand::Operations(kind) => {
            for line in operation_lines(kind, session.endpoints.services_dir.as_deref())? {
                println!("{}", line);
            }
            Ok(())
        }
        CliCommand::Init(email) => {
            let password = std::env::var("PLATFORM_CLI_PASSWORD").unwrap_or_default();
            session.init(&email, &password)?;
            println!("Saved credentials for {}.", email.trim());
            Ok(())
        }
        CliCommand::Call {
            operation,
            project,
            params,
        } => {
            let value = session.call(&operation, project.as_deref(), &params)?;
            let rendered = serde_json::to_string_pretty(&value)
                .map_err(|err| CliError::MalformedResponse(err.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

fn operation_lines(kind: ServiceKind, services_dir: Option<&Path>) -> CliResult<Vec<String>> {
    let description = kind.load_description(services_dir)?;
    let mut lines = vec![format!("{} operations:", description.name)];
    for (name, operation) in &description.operations {
        let mut line = format!(
            "  {}\t{} {}",
            name,
            operation.http_method.to_ascii_uppercase(),
            operation.uri
        );
        if let Some(summary) = &operation.summary {
            line.push_str(&format!("\t{}", summary));
        }
        if let Some(model) = &operation.response_model {
            line.push_str(&format!(" -> {}", model));
        }
        lines.push(line);
        for (parameter_name, parameter) in &operation.parameters {
            let kind = parameter.kind.map(ParameterType::name).unwrap_or("any value");
            lines.push(format!(
                "      {} ({:?}, {}{})",
                parameter_name,
                parameter.location,
                kind,
                if parameter.required { ", required" } else { "" }
            ));
        }
    }
    Ok(lines)
}

fn print_usage() {
    println!(
        "platform - project management client\n\n\
         Usage:\n\
           platform projects [--refresh]                  List projects (cached unless --refresh)\n\
           platform call <operation> [key=value ...]      Call an accounts service operation\n\
           platform call <operation> --project <name> ... Call a platform operation on a project\n\
           platform status                                Show config and token state\n\
           platform operations [accounts|platform]        List the operations a service offers\n\
           platform init <email>                          Save credentials (password from PLATFORM_CLI_PASSWORD)\n\
           platform help                                  Show this help"
    );
}

fn default_home_dir() -> CliResult<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| CliError::Usage("cannot determine the home directory".to_string()))
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_grant_client(
    http: &reqwest::blocking::Client,
    request: &GrantRequest,
) -> CliResult<TokenPayload> {
    let response = http
        .post(&request.token_endpoint)
        .header("Accept", "application/json")
        .form(&request.form_fields())
        .send()
        .map_err(|err| CliError::Network(format!("token request failed: {}", err)))?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|err| CliError::Network(format!("failed to read token response: {}", err)))?;

    if status.is_client_error() {
        return Err(CliError::GrantRejected {
            status: status.as_u16(),
            message: error_message_from_body(&text),
        });
    }
    if !status.is_success() {
        return Err(CliError::RemoteService {
            status: status.as_u16(),
            message: error_message_from_body(&text),
        });
    }

    let root: Value = serde_json::from_str(&text).map_err(|err| {
        CliError::MalformedResponse(format!("token response is not JSON: {}", err))
    })?;
    let access_token = token_value(root.get("access_token")).ok_or_else(|| {
        CliError::MalformedResponse("token response missing access_token".to_string())
    })?;

    Ok(TokenPayload {
        access_token,
        refresh_token: token_value(root.get("refresh_token")),
        expires_in: root.get("expires_in").and_then(value_as_f64),
    })
}

fn default_transport(
    http: &reqwest::blocking::Client,
    request: &PreparedRequest,
    access_token: &str,
) -> CliResult<RawResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
        CliError::InvalidRequest(format!("unsupported HTTP method {}", request.method))
    })?;
    let mut builder = http
        .request(method, &request.url)
        .header("Accept", "application/json")
        .bearer_auth(access_token);
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let response = builder.send().map_err(|err| {
        CliError::Network(format!("{} {} failed: {}", request.method, request.url, err))
    })?;
    let status = response.status().as_u16();
    let body = response.text().map_err(|err| {
        CliError::Network(format!("failed to read response from {}: {}", request.url, err))
    })?;
    Ok(RawResponse { status, body })
}

fn parse_base_url(raw: &str) -> CliResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|err| CliError::InvalidRequest(format!("invalid base URL {}: {}", raw, err)))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(CliError::InvalidRequest(format!(
            "base URL must be http(s): {}",
            raw
        )));
    }
    Ok(url)
}

fn base_url_key(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

fn expand_uri(base: &Url, template: &str, values: &HashMap<&str, String>) -> CliResult<Url> {
    let mut url = base.clone();
    url.set_query(None);
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            CliError::InvalidRequest(format!("{} cannot be used as a base URL", base))
        })?;
        segments.pop_if_empty();
        for raw in template.split('/').filter(|segment| !segment.is_empty()) {
            segments.push(&substitute_placeholders(raw, values)?);
        }
    }
    Ok(url)
}

fn substitute_placeholders(segment: &str, values: &HashMap<&str, String>) -> CliResult<String> {
    let mut output = String::new();
    let mut rest = segment;
    while let Some(start) = rest.find('{') {
        let Some(length) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + length];
        let value = values.get(name).ok_or_else(|| {
            CliError::InvalidRequest(format!("missing value for URI parameter {}", name))
        })?;
        output.push_str(&rest[..start]);
        output.push_str(value);
        rest = &rest[start + length + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn error_message_from_body(body: &str) -> String {
    if let Ok(root) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error_description", "error"] {
            if let Some(message) = value_as_string(root.get(key)) {
                return message;
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        truncate_chars(trimmed, 200)
    }
}

fn machine_name_pattern() -> CliResult<Regex> {
    Regex::new("[^a-z0-9-]+")
        .map_err(|err| CliError::InvalidRequest(format!("invalid machine name pattern: {}", err)))
}

// Runs are collapsed, not trimmed: "My Project!" -> "my-project-".
fn machine_name(pattern: &Regex, name: &str) -> String {
    pattern
        .replace_all(&name.to_ascii_lowercase(), "-")
        .into_owned()
}

fn index_projects(
    pattern: &Regex,
    data: &Value,
    log: &ActivityLog,
) -> CliResult<BTreeMap<String, ProjectRecord>> {
    let entries = data
        .get("projects")
        .and_then(Value::as_array)
        .or_else(|| data.as_array())
        .ok_or_else(|| {
            CliError::MalformedResponse("getProjects returned no projects list".to_string())
        })?;

    let mut projects = BTreeMap::new();
    for entry in entries {
        let Some(project) = ProjectRecord::from_value(entry) else {
            log.write("project_skipped", &[("reason", Some("missing_name".to_string()))]);
            continue;
        };
        let key = machine_name(pattern, &project.name);
        if let Some(previous) = projects.insert(key.clone(), project) {
            log.write(
                "project_skipped",
                &[
                    ("reason", Some("name_collision".to_string())),
                    ("machine_name", Some(key)),
                    ("name", Some(previous.name)),
                ],
            );
        }
    }
    Ok(projects)
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let claims = serde_json::from_slice::<Value>(&decoded).ok()?;
    let exp = claims.get("exp").and_then(value_as_f64)?;
    Utc.timestamp_opt(exp as i64, 0).single()
}

fn expiry_after(now: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    let delta = chrono::Duration::try_milliseconds(millis as i64)?;
    now.checked_add_signed(delta)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

fn describe_token(token: Option<&str>) -> String {
    let Some(fingerprint) = token_fingerprint(token) else {
        return "none".to_string();
    };
    match token.and_then(jwt_expiry) {
        Some(expires_at) if expires_at <= Utc::now() => format!("{} (expired)", fingerprint),
        Some(expires_at) => format!(
            "{} (expires {})",
            fingerprint,
            expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        None => fingerprint,
    }
}

fn short_hash_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..16].to_string()
}

fn token_fingerprint(token: Option<&str>) -> Option<String> {
    let raw = token?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(short_hash_hex(raw.as_bytes()))
}

fn new_trace_id() -> String {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
    let seed = format!("{}:{}", now, std::process::id());
    short_hash_hex(seed.as_bytes())
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

fn token_value(value: Option<&Value>) -> Option<String> {
    non_blank(value.and_then(Value::as_str))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn write_file_atomic(path: &Path, data: &[u8]) -> CliResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CliError::Persist(format!("invalid target path: {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| {
        CliError::Persist(format!("failed to create dir {}: {}", parent.display(), err))
    })?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| CliError::Persist(format!("failed to create temp file: {}", err)))?;
    temp_file
        .write_all(data)
        .map_err(|err| CliError::Persist(format!("failed to write temp file: {}", err)))?;
    let _ = temp_file
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o600));

    temp_file
        .persist(path)
        .map_err(|err| CliError::Persist(format!("failed to persist {}: {}", path.display(), err)))?;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    Ok(())
}

fn truncate_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect::<String>()
}
