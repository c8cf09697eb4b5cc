use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_IDENTITY_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
pub const DEFAULT_CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://zipper.dataspace.copernicus.eu/odata/v1";
pub const DEFAULT_CLIENT_ID: &str = "cdse-public";

/// Largest `$top` the CDSE OData catalog accepts.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Service endpoints. Overridable for staging or tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrls {
    /// OpenID Connect token endpoint.
    pub identity: String,
    /// OData catalog root, `Products` is appended.
    pub catalog: String,
    /// Download root, `Products(<id>)/$value` is appended.
    pub download: String,
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY_URL.to_string(),
            catalog: DEFAULT_CATALOG_URL.to_string(),
            download: DEFAULT_DOWNLOAD_URL.to_string(),
        }
    }
}

impl BaseUrls {
    /// Points all three endpoints at one server, using the same paths as CDSE.
    pub fn from_root(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            identity: format!("{root}/auth/realms/CDSE/protocol/openid-connect/token"),
            catalog: format!("{root}/odata/v1"),
            download: format!("{root}/download/odata/v1"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub urls: BaseUrls,
    /// OAuth client id sent with every token request.
    pub client_id: String,
    /// Per-request timeout (auth, search, download).
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: usize,
    /// First backoff delay; doubles on every retry up to `max_backoff`.
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Catalog page size (`$top` per request).
    pub page_size: usize,
}

impl ClientConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            urls: BaseUrls::default(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_urls(mut self, urls: BaseUrls) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.credentials.username.trim().is_empty() || self.credentials.password.is_empty() {
            return Err(Error::Config("username and password must not be empty".into()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be greater than zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq)]
struct RcConfig {
    username: Option<String>,
    password: Option<String>,
    identity_url: Option<String>,
    catalog_url: Option<String>,
    download_url: Option<String>,
    timeout: Option<String>,
    max_retries: Option<String>,
    backoff: Option<String>,
    page_size: Option<String>,
}

impl RcConfig {
    fn set(&mut self, key: &str, value: &str) {
        let key = key.trim().to_ascii_lowercase();
        let key = key.strip_prefix("copernicus_").unwrap_or(&key);
        let slot = match key {
            "username" | "user" => &mut self.username,
            "password" => &mut self.password,
            "identity_url" => &mut self.identity_url,
            "catalog_url" => &mut self.catalog_url,
            "download_url" => &mut self.download_url,
            "timeout" => &mut self.timeout,
            "max_retries" => &mut self.max_retries,
            "backoff" => &mut self.backoff,
            "page_size" => &mut self.page_size,
            _ => return,
        };
        let value = strip_quotes(value);
        if !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    /// Fills every unset field from `other`.
    fn or(self, other: RcConfig) -> RcConfig {
        RcConfig {
            username: self.username.or(other.username),
            password: self.password.or(other.password),
            identity_url: self.identity_url.or(other.identity_url),
            catalog_url: self.catalog_url.or(other.catalog_url),
            download_url: self.download_url.or(other.download_url),
            timeout: self.timeout.or(other.timeout),
            max_retries: self.max_retries.or(other.max_retries),
            backoff: self.backoff.or(other.backoff),
            page_size: self.page_size.or(other.page_size),
        }
    }
}

/// Resolves configuration from (in order of precedence) explicit arguments,
/// `COPERNICUS_*` environment variables and the first rc file found.
pub(crate) fn load_config(username: Option<String>, password: Option<String>) -> Result<ClientConfig> {
    let explicit = RcConfig {
        username,
        password,
        ..RcConfig::default()
    };
    let mut merged = explicit.or(env_config());

    let rc_candidates = rc_candidates();
    for rc_path in &rc_candidates {
        if rc_path.is_file() {
            let cfg = read_rc(rc_path)?;
            tracing::debug!(path = %rc_path.display(), "loaded configuration file");
            merged = merged.or(cfg);
            break;
        }
    }

    let searched = rc_candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let username = merged.username.ok_or_else(|| {
        Error::Config(format!(
            "missing username (set COPERNICUS_USERNAME or put `username:` in one of: {searched})"
        ))
    })?;
    let password = merged.password.ok_or_else(|| {
        Error::Config(format!(
            "missing password (set COPERNICUS_PASSWORD or put `password:` in one of: {searched})"
        ))
    })?;

    let mut cfg = ClientConfig::new(Credentials::new(username, password));
    if let Some(v) = merged.identity_url {
        cfg.urls.identity = v;
    }
    if let Some(v) = merged.catalog_url {
        cfg.urls.catalog = v;
    }
    if let Some(v) = merged.download_url {
        cfg.urls.download = v;
    }
    if let Some(v) = merged.timeout {
        cfg.timeout = parse_seconds("timeout", &v)?;
    }
    if let Some(v) = merged.max_retries {
        cfg.max_retries = parse_number("max_retries", &v)?;
    }
    if let Some(v) = merged.backoff {
        cfg.backoff = parse_seconds("backoff", &v)?;
    }
    if let Some(v) = merged.page_size {
        cfg.page_size = parse_number("page_size", &v)?;
    }

    cfg.validate()?;
    Ok(cfg)
}

fn env_config() -> RcConfig {
    let mut cfg = RcConfig::default();
    for key in [
        "USERNAME",
        "PASSWORD",
        "IDENTITY_URL",
        "CATALOG_URL",
        "DOWNLOAD_URL",
        "TIMEOUT",
        "MAX_RETRIES",
        "BACKOFF",
        "PAGE_SIZE",
    ] {
        if let Ok(v) = std::env::var(format!("COPERNICUS_{key}")) {
            cfg.set(key, &v);
        }
    }
    cfg
}

fn read_rc(path: &Path) -> Result<RcConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read configuration file {}: {e}", path.display()))
    })?;
    Ok(parse_rc(&text))
}

/// Parses `key: value` lines (rc style) as well as `KEY=VALUE` lines
/// (`.env` style). Keys may carry a `COPERNICUS_` prefix.
fn parse_rc(text: &str) -> RcConfig {
    let mut cfg = RcConfig::default();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        // Whichever separator comes first; values (URLs) may contain either.
        let split_at = match (line.find(':'), line.find('=')) {
            (Some(c), Some(e)) => c.min(e),
            (Some(c), None) => c,
            (None, Some(e)) => e,
            (None, None) => continue,
        };
        let (k, v) = (&line[..split_at], &line[split_at + 1..]);
        cfg.set(k, v.trim());
    }
    cfg
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a number of seconds, got {value:?}")))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative number, got {value:?}")))
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got {value:?}")))
}

fn rc_candidates() -> Vec<PathBuf> {
    // 1) COPERNICUS_RC (explicit)
    // 2) ./.cdserc, then ./.env
    // 3) ~/.cdserc
    if let Ok(p) = std::env::var("COPERNICUS_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".cdserc"));
        v.push(cwd.join(".env"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".cdserc"));
    }
    v
}
