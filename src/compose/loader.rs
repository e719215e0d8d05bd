//! Docker Compose file loader
//!
//! Reads one or more Compose documents, resolves `include:` recursively,
//! interpolates variables and folds everything into a single
//! [`ComposeFile`]. Later definitions replace earlier ones by name; the
//! including document is applied after the documents it includes.

use super::config::{ComposeFile, EnvironmentConfig, ScalarValue, ServiceConfig};
use crate::error::{NomadicError, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file loader
#[derive(Debug, Clone, Default)]
pub struct ComposeLoader {
    /// Variables used for interpolation; take precedence over `.env`
    env: BTreeMap<String, String>,
}

impl ComposeLoader {
    /// Create a loader with an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Add interpolation variables (typically the process environment)
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Load a file, or the default compose file when given a directory
    pub fn load_path(&self, path: &Path) -> Result<ComposeFile> {
        if path.is_dir() {
            let file = Self::find_compose_file(path).ok_or_else(|| {
                NomadicError::Reference(vec![format!(
                    "no compose file found in {}",
                    path.display()
                )])
            })?;
            return self.load_file(&file);
        }
        self.load_file(path)
    }

    /// Load one root document with everything it includes
    pub fn load_file(&self, path: &Path) -> Result<ComposeFile> {
        self.load_files(&[path])
    }

    /// Load several root documents (like repeated `-f` flags) and merge them in order
    pub fn load_files(&self, paths: &[&Path]) -> Result<ComposeFile> {
        let mut config = ComposeFile::default();
        let Some(first) = paths.first() else {
            return Ok(config);
        };

        let project_dir = first
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let env = self.project_env(&project_dir)?;

        for path in paths {
            let mut stack = Vec::new();
            let file_config = self.load_document(path, &env, &mut stack)?;
            config = Self::merge_configs(config, file_config)?;
        }

        if config.name.is_none() {
            config.name = default_project_name(&project_dir);
        }

        Ok(config)
    }

    /// Parse compose text; `include:` and `env_file:` resolve against `base_dir`
    pub fn parse_str(&self, content: &str, source_name: &str, base_dir: &Path) -> Result<ComposeFile> {
        let env = self.project_env(base_dir)?;
        let mut stack = Vec::new();
        self.parse_document(content, source_name, base_dir, &env, &mut stack)
    }

    /// Merge two compose configurations; overlay wins by name, whole entries replaced
    pub fn merge_configs(base: ComposeFile, overlay: ComposeFile) -> Result<ComposeFile> {
        let mut result = base;

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            if result.services.insert(name.clone(), service).is_some() {
                tracing::debug!("Service '{}' replaced by a later definition", name);
            }
        }

        for (name, network) in overlay.networks {
            let existing_driver = result
                .networks
                .get(&name)
                .and_then(|n| n.as_ref())
                .and_then(|n| n.driver.clone());
            let incoming_driver = network.as_ref().and_then(|n| n.driver.clone());

            if let (Some(first), Some(second)) = (existing_driver, incoming_driver) {
                if first != second {
                    return Err(NomadicError::DuplicateNetwork {
                        name,
                        first,
                        second,
                    });
                }
            }
            result.networks.insert(name, network);
        }

        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }

        for (name, secret) in overlay.secrets {
            result.secrets.insert(name, secret);
        }

        for (key, value) in overlay.extra {
            result.extra.insert(key, value);
        }

        Ok(result)
    }

    /// Interpolation variables for a project: `.env` overlaid by the loader's env
    fn project_env(&self, project_dir: &Path) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        let dotenv = project_dir.join(".env");
        if dotenv.is_file() {
            env.extend(read_env_file(&dotenv)?);
        }
        env.extend(self.env.clone());
        Ok(env)
    }

    fn load_document(
        &self,
        path: &Path,
        env: &BTreeMap<String, String>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<ComposeFile> {
        let canonical = path.canonicalize().map_err(|e| {
            NomadicError::Reference(vec![format!("{}: {}", path.display(), e)])
        })?;

        if stack.contains(&canonical) {
            let mut chain: Vec<String> = stack.iter().map(|p| p.display().to_string()).collect();
            chain.push(canonical.display().to_string());
            return Err(NomadicError::Reference(vec![format!(
                "include cycle: {}",
                chain.join(" -> ")
            )]));
        }

        tracing::debug!("Loading compose document {}", canonical.display());
        let content = std::fs::read_to_string(&canonical)?;
        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        stack.push(canonical);
        let result = self.parse_document(&content, &path.display().to_string(), &dir, env, stack);
        stack.pop();
        result
    }

    fn parse_document(
        &self,
        content: &str,
        source_name: &str,
        dir: &Path,
        env: &BTreeMap<String, String>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<ComposeFile> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| {
            NomadicError::parse(source_name, format!("Failed to parse YAML: {}", e))
        })?;
        if value.is_null() {
            value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }

        let mut unset = Vec::new();
        interpolate_value(&mut value, env, &mut unset)
            .map_err(|message| NomadicError::parse(source_name, message))?;
        for var in unset {
            tracing::warn!(
                "{}: variable '{}' is not set, defaulting to a blank string",
                source_name,
                var
            );
        }

        let mut doc: ComposeFile = serde_yaml::from_value(value)
            .map_err(|e| NomadicError::parse(source_name, format!("Invalid compose file: {}", e)))?;

        let mut missing = Vec::new();

        for (name, service) in doc.services.iter_mut() {
            normalize_environment(name, service, dir, env, &mut missing)?;
        }

        let mut includes = Vec::new();
        for entry in std::mem::take(&mut doc.include) {
            for p in entry.paths() {
                let resolved = dir.join(&p);
                if resolved.is_file() {
                    includes.push(resolved);
                } else {
                    missing.push(format!("{}: include '{}' does not resolve", source_name, p));
                }
            }
        }

        if !missing.is_empty() {
            return Err(NomadicError::Reference(missing));
        }

        let mut merged = ComposeFile::default();
        for include in includes {
            let included = self.load_document(&include, env, stack)?;
            merged = Self::merge_configs(merged, included)?;
        }
        // Included documents do not name the including project
        merged.name = None;

        Self::merge_configs(merged, doc)
    }
}

/// Fold `env_file` and list-form `environment` into one map, resolving
/// pass-through variables from the interpolation environment
fn normalize_environment(
    service_name: &str,
    service: &mut ServiceConfig,
    dir: &Path,
    env: &BTreeMap<String, String>,
    missing: &mut Vec<String>,
) -> Result<()> {
    let mut merged: BTreeMap<String, Option<ScalarValue>> = BTreeMap::new();

    if let Some(files) = service.env_file.take() {
        for file in files.to_vec() {
            let path = dir.join(&file);
            if !path.is_file() {
                missing.push(format!(
                    "service '{}': env_file '{}' does not resolve",
                    service_name, file
                ));
                continue;
            }
            for (k, v) in read_env_file(&path)? {
                merged.insert(k, Some(ScalarValue::Text(v)));
            }
        }
    }

    match service.environment.take() {
        Some(EnvironmentConfig::Array(items)) => {
            for item in items {
                match item.split_once('=') {
                    Some((k, v)) => {
                        merged.insert(k.to_string(), Some(ScalarValue::Text(v.to_string())));
                    }
                    None => {
                        merged.insert(item, None);
                    }
                }
            }
        }
        Some(EnvironmentConfig::Map(map)) => merged.extend(map),
        None => {}
    }

    for (key, value) in merged.iter_mut() {
        if value.is_none() {
            if let Some(v) = env.get(key) {
                *value = Some(ScalarValue::Text(v.clone()));
            }
        }
    }

    if !merged.is_empty() {
        service.environment = Some(EnvironmentConfig::Map(merged));
    }
    Ok(())
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        NomadicError::parse(path.display().to_string(), format!("Failed to read env file: {}", e))
    })?;

    iter.map(|item| {
        item.map_err(|e| {
            NomadicError::parse(path.display().to_string(), format!("Invalid env file: {}", e))
        })
    })
    .collect()
}

fn default_project_name(dir: &Path) -> Option<String> {
    let dir = dir.canonicalize().ok()?;
    let base = dir.file_name()?.to_str()?;
    let name: String = base
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn interpolation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("valid interpolation pattern")
    })
}

/// Interpolate every string scalar in a YAML tree (mapping keys are left alone)
fn interpolate_value(
    value: &mut serde_yaml::Value,
    env: &BTreeMap<String, String>,
    unset: &mut Vec<String>,
) -> std::result::Result<(), String> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate_string(s, env, unset)?;
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                interpolate_value(item, env, unset)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, env, unset)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => {
            interpolate_value(&mut tagged.value, env, unset)?;
        }
        _ => {}
    }
    Ok(())
}

/// Interpolate `${VAR}`, `$VAR`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?message}` and `$$` in a string
fn interpolate_string(
    s: &str,
    env: &BTreeMap<String, String>,
    unset: &mut Vec<String>,
) -> std::result::Result<String, String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut errors = Vec::new();
    let result = interpolation_pattern().replace_all(s, |caps: &Captures| {
        if &caps[0] == "$$" {
            return "$".to_string();
        }

        let (var, op, arg) = match caps.get(1) {
            Some(var) => (
                var.as_str(),
                caps.get(2).map(|m| m.as_str()),
                caps.get(3).map(|m| m.as_str()).unwrap_or(""),
            ),
            None => (caps.get(4).map(|m| m.as_str()).unwrap_or(""), None, ""),
        };

        let value = env.get(var);
        let is_empty = value.map(|v| v.is_empty()).unwrap_or(true);

        match op {
            Some(":-") if is_empty => arg.to_string(),
            Some("-") if value.is_none() => arg.to_string(),
            Some(":?") if is_empty => {
                errors.push(format!("required variable '{}' is missing: {}", var, arg));
                String::new()
            }
            Some("?") if value.is_none() => {
                errors.push(format!("required variable '{}' is missing: {}", var, arg));
                String::new()
            }
            _ => match value {
                Some(v) => v.clone(),
                None => {
                    unset.push(var.to_string());
                    String::new()
                }
            },
        }
    });

    if errors.is_empty() {
        Ok(result.into_owned())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = ComposeLoader::new()
            .parse_str(yaml, "compose.yaml", Path::new("."))
            .unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("web"));
        assert!(config.services.contains_key("db"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = ComposeLoader::new()
            .parse_str("services:\n  web: [unterminated\n", "bad.yaml", Path::new("."))
            .unwrap_err();
        assert!(matches!(err, NomadicError::Parse { .. }));
    }

    #[test]
    fn test_repeated_environment_keys() {
        let list = "services:\n  app:\n    image: x\n    environment:\n      - K=one\n      - K=two\n";
        let config = ComposeLoader::new()
            .parse_str(list, "compose.yaml", Path::new("."))
            .unwrap();
        assert!(config.services.contains_key("app"));

        let map = "services:\n  app:\n    image: x\n    environment:\n      K: one\n      K: two\n";
        let err = ComposeLoader::new()
            .parse_str(map, "compose.yaml", Path::new("."))
            .unwrap_err();
        assert!(matches!(err, NomadicError::Parse { .. }));
    }

    #[test]
    fn test_unknown_keys_are_kept_for_reporting() {
        let yaml = r#"
services:
  app:
    build: .
    privileged: true
"#;
        let config = ComposeLoader::new()
            .parse_str(yaml, "compose.yaml", Path::new("."))
            .unwrap();
        let app = &config.services["app"];
        assert!(app.extra.contains_key("build"));
        assert!(app.extra.contains_key("privileged"));
    }

    #[test]
    fn test_interpolate() {
        let vars = env(&[("TAG", "1.0.0"), ("EMPTY", "")]);
        let mut unset = Vec::new();

        assert_eq!(
            interpolate_string("nginx:${TAG}", &vars, &mut unset).unwrap(),
            "nginx:1.0.0"
        );
        assert_eq!(
            interpolate_string("nginx:$TAG", &vars, &mut unset).unwrap(),
            "nginx:1.0.0"
        );
        assert_eq!(
            interpolate_string("${EMPTY:-fallback}", &vars, &mut unset).unwrap(),
            "fallback"
        );
        assert_eq!(
            interpolate_string("${EMPTY-fallback}", &vars, &mut unset).unwrap(),
            ""
        );
        assert_eq!(
            interpolate_string("cost: $$5", &vars, &mut unset).unwrap(),
            "cost: $5"
        );
        assert!(unset.is_empty());

        assert_eq!(
            interpolate_string("${MISSING}", &vars, &mut unset).unwrap(),
            ""
        );
        assert_eq!(unset, vec!["MISSING".to_string()]);

        assert!(interpolate_string("${MISSING:?must be set}", &vars, &mut unset).is_err());
    }

    #[test]
    fn test_interpolation_applies_to_document() {
        let yaml = r#"
services:
  web:
    image: "nginx:${TAG:-latest}"
    environment:
      - MODE=${MODE}
      - PASSTHROUGH
"#;
        let config = ComposeLoader::new()
            .with_env([("MODE", "prod"), ("PASSTHROUGH", "yes")])
            .parse_str(yaml, "compose.yaml", Path::new("."))
            .unwrap();

        let web = &config.services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:latest"));
        match web.environment.as_ref().unwrap() {
            EnvironmentConfig::Map(map) => {
                assert_eq!(map["MODE"], Some(ScalarValue::Text("prod".to_string())));
                assert_eq!(
                    map["PASSTHROUGH"],
                    Some(ScalarValue::Text("yes".to_string()))
                );
            }
            other => panic!("expected map form, got {:?}", other),
        }
    }

    #[test]
    fn test_include_merges_last_wins() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("base.yaml"),
            "services:\n  db:\n    image: postgres:13\n  cache:\n    image: redis:6\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("override.yaml"),
            "services:\n  cache:\n    image: redis:7\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "name: demo\ninclude:\n  - base.yaml\n  - path: override.yaml\nservices:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        let config = ComposeLoader::new()
            .load_file(&temp.path().join("compose.yaml"))
            .unwrap();

        assert_eq!(config.name.as_deref(), Some("demo"));
        assert_eq!(config.services.len(), 3);
        assert_eq!(config.services["cache"].image.as_deref(), Some("redis:7"));
        assert_eq!(config.services["db"].image.as_deref(), Some("postgres:13"));
    }

    #[test]
    fn test_including_document_overrides_included() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("base.yaml"),
            "services:\n  web:\n    image: nginx:1.24\n    ports: [\"80:80\"]\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "include: [base.yaml]\nservices:\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let config = ComposeLoader::new()
            .load_file(&temp.path().join("compose.yaml"))
            .unwrap();

        let web = &config.services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
        // Whole-service replacement: the included ports do not survive
        assert!(web.ports.is_none());
    }

    #[test]
    fn test_missing_includes_are_all_reported() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "include:\n  - missing-a.yaml\n  - missing-b.yaml\nservices: {}\n",
        )
        .unwrap();

        let err = ComposeLoader::new()
            .load_file(&temp.path().join("compose.yaml"))
            .unwrap_err();
        match err {
            NomadicError::Reference(problems) => {
                assert_eq!(problems.len(), 2);
                assert!(problems[0].contains("missing-a.yaml"));
                assert!(problems[1].contains("missing-b.yaml"));
            }
            other => panic!("expected reference error, got {:?}", other),
        }
    }

    #[test]
    fn test_include_cycle_detected() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.yaml"), "include: [b.yaml]\n").unwrap();
        std::fs::write(temp.path().join("b.yaml"), "include: [a.yaml]\n").unwrap();

        let err = ComposeLoader::new()
            .load_file(&temp.path().join("a.yaml"))
            .unwrap_err();
        match err {
            NomadicError::Reference(problems) => assert!(problems[0].contains("include cycle")),
            other => panic!("expected reference error, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_network_drivers() {
        let base = ComposeLoader::new()
            .parse_str(
                "networks:\n  backend:\n    driver: bridge\n",
                "a.yaml",
                Path::new("."),
            )
            .unwrap();
        let overlay = ComposeLoader::new()
            .parse_str(
                "networks:\n  backend:\n    driver: overlay\n",
                "b.yaml",
                Path::new("."),
            )
            .unwrap();

        let err = ComposeLoader::merge_configs(base, overlay).unwrap_err();
        assert!(matches!(err, NomadicError::DuplicateNetwork { ref name, .. } if name == "backend"));
    }

    #[test]
    fn test_same_network_driver_merges() {
        let base = ComposeLoader::new()
            .parse_str("networks:\n  backend:\n    driver: bridge\n", "a.yaml", Path::new("."))
            .unwrap();
        let overlay = ComposeLoader::new()
            .parse_str("networks:\n  backend:\n", "b.yaml", Path::new("."))
            .unwrap();

        let merged = ComposeLoader::merge_configs(base, overlay).unwrap();
        assert!(merged.networks.contains_key("backend"));
    }

    #[test]
    fn test_env_file_and_dotenv() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(".env"), "TAG=7.2\n").unwrap();
        std::fs::write(temp.path().join("app.env"), "LOG_LEVEL=debug\nMODE=file\n").unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "services:\n  app:\n    image: \"redis:${TAG}\"\n    env_file: app.env\n    environment:\n      MODE: inline\n",
        )
        .unwrap();

        let config = ComposeLoader::new()
            .load_file(&temp.path().join("compose.yaml"))
            .unwrap();

        let app = &config.services["app"];
        assert_eq!(app.image.as_deref(), Some("redis:7.2"));
        match app.environment.as_ref().unwrap() {
            EnvironmentConfig::Map(map) => {
                assert_eq!(map["LOG_LEVEL"], Some(ScalarValue::Text("debug".to_string())));
                assert_eq!(map["MODE"], Some(ScalarValue::Text("inline".to_string())));
            }
            other => panic!("expected map form, got {:?}", other),
        }
    }

    #[test]
    fn test_find_compose_file() {
        let temp = tempdir().unwrap();
        assert!(ComposeLoader::find_compose_file(temp.path()).is_none());

        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let found = ComposeLoader::find_compose_file(temp.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }
}
