use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub email: String,
    pub server_url: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub email: Option<String>,
    pub server_url: Option<String>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".syftbox").join("logs").join("syftbox.log")
}

impl Config {
    pub fn default_data_dir() -> PathBuf {
        home_dir().join("SyftBox")
    }

    pub fn default_server_url() -> &'static str {
        "https://syftbox.net"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".syftbox").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("SYFTBOX_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir()
                .join(".config")
                .join("syftbox")
                .join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    /// Precedence per field: CLI flag, then environment, then config file,
    /// then built-in default.
    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let data_dir = overrides
            .data_dir
            .or(env_cfg.data_dir)
            .or(file_cfg.data_dir)
            .unwrap_or_else(Self::default_data_dir);
        let email = overrides
            .email
            .or(env_cfg.email)
            .or(file_cfg.email)
            .unwrap_or_default();
        let server_url = overrides
            .server_url
            .or(env_cfg.server_url)
            .or(file_cfg.server_url)
            .unwrap_or_else(|| Self::default_server_url().to_string());
        let refresh_token = env_cfg.refresh_token.or(file_cfg.refresh_token);
        let access_token = env_cfg.access_token.or(file_cfg.access_token);

        let mut cfg = Config {
            data_dir,
            email,
            server_url,
            refresh_token,
            access_token,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }

    fn normalize(&mut self) -> Result<()> {
        self.email = self.email.to_lowercase();
        self.data_dir = absolutize_path(&self.data_dir);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_email(&self.email)?;
        validate_url(&self.server_url).context("server_url")?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    data_dir: &'a PathBuf,
    email: &'a str,
    server_url: &'a str,
    #[serde(skip_serializing_if = "is_none_or_empty")]
    refresh_token: &'a Option<String>,
}

fn is_none_or_empty(v: &Option<String>) -> bool {
    v.as_deref().unwrap_or("").trim().is_empty()
}

fn save_config_file(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    // The short-lived access token is never persisted.
    let persisted = PersistedConfig {
        data_dir: &cfg.data_dir,
        email: &cfg.email,
        server_url: &cfg.server_url,
        refresh_token: &cfg.refresh_token,
    };
    let data = serde_json::to_vec(&persisted).context("serialize config")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    // Simple RFC5322-ish check.
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap()
    });
    if PATTERN.is_match(email) {
        Ok(())
    } else {
        anyhow::bail!("invalid email: {email}")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    // On macOS, /tmp is a symlink to /private/tmp. Canonicalize to resolve
    // symlinks so all path comparisons use consistent forms; fall back to
    // the cleaned path when the target does not exist yet.
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    // Lexical normalization without requiring the path to exist.
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) | Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("SYFTBOX_EMAIL") {
        let v = v.trim();
        if !v.is_empty() {
            out.email = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_DATA_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            out.data_dir = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_SERVER_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.server_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_REFRESH_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.refresh_token = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_ACCESS_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.access_token = Some(v.to_string());
        }
    }
    out
}
