//! Secret files injected into a service's environment at launch
//!
//! A secret file is newline-delimited `KEY=VALUE`. It is read once, right
//! before the consuming service is spawned, and never handed to a build step.
//! Any problem with the file aborts the launch: no process, no listener.

use crate::config::Config;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Directory secret files are mounted under inside containers
pub const CONTAINER_SECRETS_DIR: &str = "/run/secrets";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret '{name}' is not declared")]
    Undeclared { name: String },
    #[error("Secret '{name}' file not found: {}", .path.display())]
    Missing { name: String, path: PathBuf },
    #[error("Secret '{name}' could not be read from {}: {source}", .path.display())]
    Unreadable {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Secret '{name}' line {line}: expected KEY=VALUE")]
    Malformed { name: String, line: usize },
    /// The offending text is not echoed; a mistyped line may hold the value
    #[error("Secret '{name}' line {line}: invalid key")]
    InvalidKey { name: String, line: usize },
    #[error("Secret '{name}' line {line}: duplicate key '{key}'")]
    DuplicateKey { name: String, line: usize, key: String },
    #[error("Key '{key}' is defined by both secret '{first}' and secret '{second}'")]
    Conflict { key: String, first: String, second: String },
}

/// A logical secret name and the file backing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub path: PathBuf,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Look up a declared secret by name
    pub fn from_config(config: &Config, name: &str) -> Result<Self, SecretError> {
        config
            .secrets
            .get(name)
            .map(|s| Self::new(name, &s.file))
            .ok_or_else(|| SecretError::Undeclared {
                name: name.to_string(),
            })
    }

    /// Where the file is mounted inside a container
    pub fn container_path(&self) -> String {
        format!("{}/{}", CONTAINER_SECRETS_DIR, self.name)
    }

    /// Read and parse the secret file
    pub fn load(&self) -> Result<SecretSet, SecretError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SecretError::Missing {
                    name: self.name.clone(),
                    path: self.path.clone(),
                }
            } else {
                SecretError::Unreadable {
                    name: self.name.clone(),
                    path: self.path.clone(),
                    source: e,
                }
            }
        })?;
        SecretSet::parse(&self.name, &content)
    }
}

/// Parsed secret values. `Debug` never prints the values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretSet {
    values: BTreeMap<String, String>,
    /// Secret each key came from, for conflict reporting
    origins: BTreeMap<String, String>,
}

impl SecretSet {
    /// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped,
    /// a leading `export ` is accepted, and matching outer quotes are removed.
    pub fn parse(name: &str, content: &str) -> Result<Self, SecretError> {
        let mut set = SecretSet::default();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
            let (key, value) = line.split_once('=').ok_or_else(|| SecretError::Malformed {
                name: name.to_string(),
                line: line_no,
            })?;

            let key = key.trim();
            if !is_valid_key(key) {
                return Err(SecretError::InvalidKey {
                    name: name.to_string(),
                    line: line_no,
                });
            }

            if set.values.contains_key(key) {
                return Err(SecretError::DuplicateKey {
                    name: name.to_string(),
                    line: line_no,
                    key: key.to_string(),
                });
            }

            set.values.insert(key.to_string(), unquote(value.trim()).to_string());
            set.origins.insert(key.to_string(), name.to_string());
        }

        Ok(set)
    }

    /// Merge another set in; the same key from two secrets is an error
    pub fn merge(&mut self, other: SecretSet) -> Result<(), SecretError> {
        for (key, value) in other.values {
            let origin = other.origins.get(&key).cloned().unwrap_or_default();
            if let Some(first) = self.origins.get(&key) {
                return Err(SecretError::Conflict {
                    key,
                    first: first.clone(),
                    second: origin,
                });
            }
            self.origins.insert(key.clone(), origin);
            self.values.insert(key, value);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Load every referenced secret into one set, failing on the first problem
pub fn resolve_all(refs: &[SecretRef]) -> Result<SecretSet, SecretError> {
    let mut set = SecretSet::default();
    for secret in refs {
        set.merge(secret.load()?)?;
    }
    Ok(set)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_basic() {
        let set = SecretSet::parse("api", "DATABASE_URL=postgres://db/app\nAPI_KEY=abc123\n").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("DATABASE_URL"), Some("postgres://db/app"));
        assert_eq!(set.get("API_KEY"), Some("abc123"));
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let content = "# backend secrets\n\n   \nTOKEN=xyz\n  # indented comment\n";
        let set = SecretSet::parse("api", content).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("TOKEN"), Some("xyz"));
    }

    #[test]
    fn test_parse_shell_forms() {
        let content = "export A=1\nB=\"two words\"\nC='single'\nD=\nE=a=b\nF = spaced \n";
        let set = SecretSet::parse("api", content).unwrap();
        assert_eq!(set.get("A"), Some("1"));
        assert_eq!(set.get("B"), Some("two words"));
        assert_eq!(set.get("C"), Some("single"));
        assert_eq!(set.get("D"), Some(""));
        assert_eq!(set.get("E"), Some("a=b"));
        assert_eq!(set.get("F"), Some("spaced"));
    }

    #[test]
    fn test_mismatched_quotes_are_kept() {
        let set = SecretSet::parse("api", "A=\"open\nB='x\"\n").unwrap();
        assert_eq!(set.get("A"), Some("\"open"));
        assert_eq!(set.get("B"), Some("'x\""));
    }

    #[test]
    fn test_malformed_line() {
        let err = SecretSet::parse("api", "A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, SecretError::Malformed { line: 2, .. }));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_invalid_key() {
        for content in ["1ABC=x", "MY-KEY=x", "=x", "A B=x"] {
            let err = SecretSet::parse("api", content).unwrap_err();
            assert!(
                matches!(err, SecretError::InvalidKey { line: 1, .. }),
                "content {:?} gave {:?}",
                content,
                err
            );
        }
    }

    #[test]
    fn test_duplicate_key() {
        let err = SecretSet::parse("api", "A=1\nA=2\n").unwrap_err();
        assert!(matches!(err, SecretError::DuplicateKey { line: 2, .. }));
    }

    #[test]
    fn test_errors_never_contain_values() {
        let err = SecretSet::parse("api", "PASSWORD=hunter2\nPASSWORD=hunter3\n").unwrap_err();
        assert!(!err.to_string().contains("hunter"));

        let err = SecretSet::parse("api", "USER=admin\nPASSWORD hunter2=x\n").unwrap_err();
        assert!(matches!(err, SecretError::InvalidKey { line: 2, .. }));
        let message = err.to_string();
        assert!(message.contains("line 2"));
        assert!(!message.contains("hunter2"));
        assert!(!format!("{:?}", err).contains("hunter2"));
    }

    #[test]
    fn test_debug_redacts_values() {
        let set = SecretSet::parse("api", "PASSWORD=hunter2\n").unwrap();
        let debug = format!("{:?}", set);
        assert!(debug.contains("PASSWORD"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_load_missing_file_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SecretRef::new("backend_env", dir.path().join("backend.env"));

        let err = secret.load().unwrap_err();
        assert!(matches!(err, SecretError::Missing { .. }));
        assert!(err.to_string().contains("backend_env"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY=s3cret").unwrap();
        let secret = SecretRef::new("backend_env", file.path());

        let set = secret.load().unwrap();
        assert_eq!(set.get("API_KEY"), Some("s3cret"));
    }

    #[test]
    fn test_load_directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SecretRef::new("backend_env", dir.path());
        let err = secret.load().unwrap_err();
        assert!(matches!(err, SecretError::Unreadable { .. }));
    }

    #[test]
    fn test_resolve_all_merges_and_detects_conflicts() {
        let mut a = tempfile::NamedTempFile::new().unwrap();
        writeln!(a, "A=1").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        writeln!(b, "B=2").unwrap();
        let mut c = tempfile::NamedTempFile::new().unwrap();
        writeln!(c, "A=3").unwrap();

        let set = resolve_all(&[SecretRef::new("a", a.path()), SecretRef::new("b", b.path())]).unwrap();
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["A", "B"]);

        let err = resolve_all(&[SecretRef::new("a", a.path()), SecretRef::new("c", c.path())]).unwrap_err();
        match err {
            SecretError::Conflict { key, first, second } => {
                assert_eq!(key, "A");
                assert_eq!(first, "a");
                assert_eq!(second, "c");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_from_config() {
        let config: Config = toml::from_str(
            r#"
[secrets.backend_env]
file = "/etc/tiergate/backend.env"
"#,
        )
        .unwrap();

        let secret = SecretRef::from_config(&config, "backend_env").unwrap();
        assert_eq!(secret.path, PathBuf::from("/etc/tiergate/backend.env"));
        assert_eq!(secret.container_path(), "/run/secrets/backend_env");

        assert!(matches!(
            SecretRef::from_config(&config, "other"),
            Err(SecretError::Undeclared { .. })
        ));
    }
}
