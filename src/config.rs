#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8091;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ASSETS_ROOT: &str = "./assets";
pub const DEFAULT_DB_PATH: &str = "./tubely.db";

/// Everything the backend needs to know before it binds a socket.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub assets_root: PathBuf,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub assets_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub jwt_secret: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

/// Resolves the runtime configuration. Precedence is CLI overrides, then the
/// process environment, then the `.env` file, then built-in defaults.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let assets_root = overrides
        .assets_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("ASSETS_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_ASSETS_ROOT.to_string());
    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DB_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let jwt_secret = non_blank(overrides.jwt_secret)
        .or_else(|| lookup_value("JWT_SECRET", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("JWT_SECRET not set"))?;
    let port = match overrides.port {
        Some(port) => port,
        None => match lookup_value("PORT", file_vars, &env_lookup) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("PORT must be a number between 0 and 65535, got {raw:?}"))?,
            None => DEFAULT_PORT,
        },
    };
    let host = non_blank(overrides.host)
        .or_else(|| lookup_value("TUBELY_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    Ok(RuntimeConfig {
        assets_root: PathBuf::from(assets_root),
        db_path: PathBuf::from(db_path),
        jwt_secret,
        port,
        host,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a dotenv-style file. Missing files yield an empty map; comments,
/// blank lines and lines without `=` are skipped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn applies_defaults_when_only_secret_is_set() {
        let runtime = runtime_from("JWT_SECRET=\"s3cret\"\n");
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(runtime.assets_root, PathBuf::from(DEFAULT_ASSETS_ROOT));
        assert_eq!(runtime.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(runtime.jwt_secret, "s3cret");
    }

    #[test]
    fn reads_every_key_from_file() {
        let runtime = runtime_from(
            "JWT_SECRET=\"k\"\nPORT=\"4242\"\nASSETS_ROOT=\"/srv/assets\"\nDB_PATH=\"/srv/t.db\"\nTUBELY_HOST=\"0.0.0.0\"\n",
        );
        assert_eq!(runtime.port, 4242);
        assert_eq!(runtime.assets_root, PathBuf::from("/srv/assets"));
        assert_eq!(runtime.db_path, PathBuf::from("/srv/t.db"));
        assert_eq!(runtime.host, "0.0.0.0");
    }

    #[test]
    fn missing_secret_is_an_error() {
        let vars = read_env_file(make_config("PORT=\"8000\"\n").path()).unwrap();
        let err = build_runtime_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn blank_secret_is_an_error() {
        let vars = read_env_file(make_config("JWT_SECRET=\"   \"\n").path()).unwrap();
        assert!(build_runtime_config(&vars, |_| None).is_err());
    }

    #[test]
    fn invalid_port_is_an_error() {
        let vars =
            read_env_file(make_config("JWT_SECRET=\"k\"\nPORT=\"nope\"\n").path()).unwrap();
        let err = build_runtime_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(
            make_config("JWT_SECRET=\"file\"\nASSETS_ROOT=\"/file-assets\"\n").path(),
        )
        .unwrap();
        let runtime = build_runtime_config(&vars, |key| {
            if key == "ASSETS_ROOT" {
                Some("/env-assets".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(runtime.assets_root, PathBuf::from("/env-assets"));
        assert_eq!(runtime.jwt_secret, "file");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export ASSETS_ROOT="/media"
            DB_PATH='/db/tubely.db'
            TUBELY_HOST =  "0.0.0.0"
            PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("ASSETS_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("DB_PATH").unwrap(), "/db/tubely.db");
        assert_eq!(vars.get("TUBELY_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("ASSETS_ROOT".to_string(), "/file-assets".to_string());
        vars.insert("DB_PATH".to_string(), "/file.db".to_string());
        vars.insert("JWT_SECRET".to_string(), "file-secret".to_string());
        vars.insert("TUBELY_HOST".to_string(), "file-host".to_string());
        vars.insert("PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            assets_root: Some(PathBuf::from("/override-assets")),
            db_path: None,
            jwt_secret: Some("override-secret".into()),
            port: Some(9000),
            host: Some("override-host".into()),
            env_path: None,
        };

        let runtime = build_runtime_config_with_overrides(
            &vars,
            |key| match key {
                "DB_PATH" => Some("/env.db".to_string()),
                "PORT" => Some("8000".to_string()),
                _ => None,
            },
            overrides,
        )
        .unwrap();

        assert_eq!(runtime.assets_root, PathBuf::from("/override-assets"));
        assert_eq!(runtime.db_path, PathBuf::from("/env.db"));
        assert_eq!(runtime.jwt_secret, "override-secret");
        assert_eq!(runtime.port, 9000);
        assert_eq!(runtime.host, "override-host");
    }

    #[test]
    fn blank_host_override_falls_back() {
        let vars = read_env_file(make_config("JWT_SECRET=\"k\"\n").path()).unwrap();
        let runtime = build_runtime_config_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(runtime.host, DEFAULT_HOST);
    }

    #[test]
    fn resolve_reads_custom_env_path() {
        let cfg = make_config("JWT_SECRET=\"from-file\"\nPORT=\"6060\"\n");
        let runtime = resolve_runtime_config(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            port: Some(6061),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        assert_eq!(runtime.port, 6061);
    }
}
