use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::ManagerError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub ipc_socket_path: Option<PathBuf>,
    pub autostart: Vec<String>,
    pub autostart_always: Vec<String>,
}

pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: RuntimeConfig,
}

/// Load the config at `override_path`, or at the default location. A missing
/// default file yields the defaults; a missing explicit file is an error.
pub fn load(override_path: Option<&Path>) -> Result<LoadedConfig, ManagerError> {
    let (path, explicit) = match override_path {
        Some(path) => (path.to_path_buf(), true),
        None => (config_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(ManagerError::Config {
                path,
                message: "file not found".to_owned(),
            });
        }
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(LoadedConfig {
            path,
            config: RuntimeConfig::default(),
        });
    }

    let config = load_from_path(&path)?;
    Ok(LoadedConfig { path, config })
}

/// [`load`], with any failure logged and replaced by the defaults.
pub fn load_or_default(override_path: Option<&Path>) -> LoadedConfig {
    match load(override_path) {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!("{err}, continuing with the default config");
            let path = override_path
                .map(Path::to_path_buf)
                .or_else(|| config_path().ok())
                .unwrap_or_default();
            LoadedConfig {
                path,
                config: RuntimeConfig::default(),
            }
        }
    }
}

pub fn load_from_path(path: &Path) -> Result<RuntimeConfig, ManagerError> {
    let content = fs::read_to_string(path).map_err(|err| ManagerError::Config {
        path: path.to_path_buf(),
        message: format!("failed to read: {err}"),
    })?;
    parse(&content).map_err(|message| ManagerError::Config {
        path: path.to_path_buf(),
        message,
    })
}

fn parse(content: &str) -> Result<RuntimeConfig, String> {
    let values = parse_key_value_lines(content)?;

    let ipc_socket_path = values
        .get("ipc_socket")
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .map(expand_home_path);

    for key in values.keys() {
        let known = key == "ipc_socket" || key.starts_with("exec.") || key.starts_with("exec_always.");
        if !known {
            tracing::warn!(key, "ignoring unknown config key");
        }
    }

    Ok(RuntimeConfig {
        ipc_socket_path,
        autostart: collect_indexed_values(&values, "exec.")?,
        autostart_always: collect_indexed_values(&values, "exec_always.")?,
    })
}

fn config_path() -> Result<PathBuf, ManagerError> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("kestrel").join("config"));
    }

    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home)
            .join(".config")
            .join("kestrel")
            .join("config"));
    }

    Err(ManagerError::Config {
        path: PathBuf::new(),
        message: "unable to resolve config path: HOME and XDG_CONFIG_HOME are unset".to_owned(),
    })
}

fn parse_key_value_lines(content: &str) -> Result<HashMap<String, String>, String> {
    let mut values = HashMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {}: expected `key = value`, got `{line}`", number + 1));
        };
        values.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(values)
}

fn collect_indexed_values(
    values: &HashMap<String, String>,
    prefix: &str,
) -> Result<Vec<String>, String> {
    let mut indexed = Vec::<(usize, String)>::new();

    for (key, value) in values {
        let Some(index_str) = key.strip_prefix(prefix) else {
            continue;
        };

        let index = index_str
            .parse::<usize>()
            .map_err(|err| format!("invalid indexed key `{key}`: index is not a number ({err})"))?;
        indexed.push((index, value.clone()));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, value)| value).collect())
}

fn expand_home_path(raw_path: &str) -> PathBuf {
    if let Some(rest) = raw_path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(raw_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_and_ordered_autostart() {
        let config = parse(
            "# kestrel\n\
             ipc_socket = /run/user/1000/kestrel.sock\n\
             exec.2 = dunst\n\
             exec.1 = xss-lock -- slock\n\
             exec_always.1 = feh --bg-fill ~/wall.png\n",
        )
        .unwrap();

        assert_eq!(
            config.ipc_socket_path.as_deref(),
            Some(Path::new("/run/user/1000/kestrel.sock"))
        );
        assert_eq!(config.autostart, vec!["xss-lock -- slock", "dunst"]);
        assert_eq!(config.autostart_always, vec!["feh --bg-fill ~/wall.png"]);
    }

    #[test]
    fn empty_socket_value_means_unset() {
        let config = parse("ipc_socket =\n").unwrap();
        assert_eq!(config.ipc_socket_path, None);
    }

    #[test]
    fn rejects_lines_without_equals() {
        let err = parse("exec.1 dunst\n").unwrap_err();
        assert!(err.contains("line 1"), "{err}");
    }

    #[test]
    fn rejects_non_numeric_index() {
        let err = parse("exec.first = dunst\n").unwrap_err();
        assert!(err.contains("exec.first"), "{err}");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            load(Some(&missing)),
            Err(ManagerError::Config { .. })
        ));
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "exec_always.1 = true\n").unwrap();
        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.config.autostart_always, vec!["true"]);
    }

    #[test]
    fn broken_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "exec.1 = dunst\nthis line has no separator\n").unwrap();

        let loaded = load_or_default(Some(&path));
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.config, RuntimeConfig::default());

        let missing = dir.path().join("removed-since");
        let loaded = load_or_default(Some(&missing));
        assert_eq!(loaded.path, missing);
        assert_eq!(loaded.config, RuntimeConfig::default());
    }
}
