use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use fhirgate_client::DEFAULT_RETAINED_HEADERS;

/// Processor names resolvable from configuration.
pub const KNOWN_PRE_PROCESSORS: &[&str] =
    &["transform_bundle", "patient_everything", "profile_validation"];
pub const KNOWN_POST_PROCESSORS: &[&str] = &["participant_filter"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub everything: EverythingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.backend.base_url.is_empty() {
            return Err("backend.base_url must be set".into());
        }
        if self.backend.timeout_secs == 0 {
            return Err("backend.timeout_secs must be > 0".into());
        }
        if self.backend.auth.is_none() && self.backend.static_token.is_none() {
            return Err("backend requires either auth or static_token".into());
        }
        for name in &self.pipeline.pre_processors {
            if !KNOWN_PRE_PROCESSORS.contains(&name.as_str()) {
                return Err(format!("unknown pre-processor: {name}"));
            }
        }
        for name in &self.pipeline.post_processors {
            if !KNOWN_POST_PROCESSORS.contains(&name.as_str()) {
                return Err(format!("unknown post-processor: {name}"));
            }
        }
        if self.everything.page_size == 0 {
            return Err("everything.page_size must be > 0".into());
        }
        for entry in &self.everything.resources {
            if !entry.contains(':') {
                return Err(format!(
                    "everything.resources entry must be Type:query, got {entry}"
                ));
            }
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Externally visible base address of the proxied FHIR surface, used for
    /// response address rewriting.
    pub fn proxy_base_url(&self) -> String {
        let root = self
            .server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port));
        format!("{}/fhir", root.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this proxy, for links and Location rewriting.
    /// If not set, defaults to http://{host}:{port}
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Fully qualified URL of the backend FHIR service.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    /// Backend response headers echoed to the caller.
    #[serde(default = "default_response_headers")]
    pub response_headers: Vec<String>,
    /// OAuth2 client-credentials settings for backend authentication.
    #[serde(default)]
    pub auth: Option<BackendAuthConfig>,
    /// Fixed bearer token; development/testing alternative to `auth`.
    #[serde(default)]
    pub static_token: Option<String>,
}

fn default_backend_timeout_secs() -> u64 {
    30
}

fn default_response_headers() -> Vec<String> {
    DEFAULT_RETAINED_HEADERS.iter().map(|s| s.to_string()).collect()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_backend_timeout_secs(),
            response_headers: default_response_headers(),
            auth: None,
            static_token: None,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Audience/resource identifier of the backend service.
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pre-processors, run in order.
    #[serde(default = "default_pre_processors")]
    pub pre_processors: Vec<String>,
    /// Post-processors, run in order.
    #[serde(default)]
    pub post_processors: Vec<String>,
}

fn default_pre_processors() -> Vec<String> {
    vec!["transform_bundle".into(), "patient_everything".into()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pre_processors: default_pre_processors(),
            post_processors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Roles with unrestricted access to all operations.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
    #[serde(default = "default_reader_roles")]
    pub reader_roles: Vec<String>,
    #[serde(default = "default_writer_roles")]
    pub writer_roles: Vec<String>,
    /// Roles exempt from participant filtering.
    #[serde(default)]
    pub global_roles: Vec<String>,
    /// Roles named after the resource type they link the principal to,
    /// e.g. `Practitioner` or `RelatedPerson`.
    #[serde(default = "default_participant_roles")]
    pub participant_roles: Vec<String>,
    /// Roles linking the principal to a Patient resource.
    #[serde(default = "default_patient_roles")]
    pub patient_roles: Vec<String>,
}

fn default_admin_roles() -> Vec<String> {
    vec!["admin".into()]
}
fn default_reader_roles() -> Vec<String> {
    vec!["reader".into()]
}
fn default_writer_roles() -> Vec<String> {
    vec!["writer".into()]
}
fn default_participant_roles() -> Vec<String> {
    vec!["Practitioner".into()]
}
fn default_patient_roles() -> Vec<String> {
    vec!["Patient".into()]
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            admin_roles: default_admin_roles(),
            reader_roles: default_reader_roles(),
            writer_roles: default_writer_roles(),
            global_roles: Vec::new(),
            participant_roles: default_participant_roles(),
            patient_roles: default_patient_roles(),
        }
    }
}

impl AccessConfig {
    /// Roles that may anchor a linked Patient or Practitioner identity.
    pub fn identity_roles(&self) -> Vec<String> {
        let mut roles = self.participant_roles.clone();
        roles.extend(self.patient_roles.iter().cloned());
        roles
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EverythingConfig {
    /// Page bound applied to each per-type query.
    #[serde(default = "default_everything_page_size")]
    pub page_size: usize,
    /// `Type:queryTemplate` pairs fanned out per $everything call; `{id}` is
    /// replaced with the patient id.
    #[serde(default = "default_everything_resources")]
    pub resources: Vec<String>,
}

fn default_everything_page_size() -> usize {
    100
}

fn default_everything_resources() -> Vec<String> {
    [
        "Appointment:patient={id}",
        "CarePlan:patient={id}",
        "Condition:patient={id}",
        "DiagnosticReport:subject={id}",
        "Encounter:patient={id}",
        "Immunization:patient={id}",
        "MedicationRequest:patient={id}",
        "Observation:patient={id}",
        "Procedure:patient={id}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for EverythingConfig {
    fn default() -> Self {
        Self {
            page_size: default_everything_page_size(),
            resources: default_everything_resources(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationConfig {
    /// URL of the external profile-validation service; unset disables the
    /// processor (it logs and passes through).
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("fhirgate.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment overrides, e.g. FHIRGATE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("FHIRGATE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            backend: BackendConfig {
                base_url: "http://fhir.internal".into(),
                static_token: Some("t".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn default_config_needs_backend() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn unknown_processor_names_are_rejected() {
        let mut cfg = valid_config();
        cfg.pipeline.pre_processors.push("no_such_processor".into());
        assert!(cfg.validate().unwrap_err().contains("no_such_processor"));

        let mut cfg = valid_config();
        cfg.pipeline.post_processors.push("transform_bundle".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn everything_defaults_are_well_formed() {
        let cfg = valid_config();
        assert_eq!(cfg.everything.page_size, 100);
        assert_eq!(cfg.everything.resources.len(), 9);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn proxy_base_url_prefers_configured_base() {
        let mut cfg = valid_config();
        cfg.server.base_url = Some("https://gateway.example.org".into());
        assert_eq!(cfg.proxy_base_url(), "https://gateway.example.org/fhir");

        cfg.server.base_url = None;
        cfg.server.host = "127.0.0.1".into();
        cfg.server.port = 8080;
        assert_eq!(cfg.proxy_base_url(), "http://127.0.0.1:8080/fhir");
    }

    #[test]
    fn toml_parse_round_trip() {
        let raw = r#"
            [server]
            port = 9090

            [backend]
            base_url = "https://fs.example.com"
            static_token = "dev"

            [pipeline]
            pre_processors = ["transform_bundle"]
            post_processors = ["participant_filter"]
        "#;
        let cfg: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.pipeline.post_processors, vec!["participant_filter"]);
        assert!(cfg.validate().is_ok());
    }
}
