//! Access token lookup for the command-line tool.
//!
//! Order: explicit flag, `DROPBOX_ACCESS_TOKEN`, then a one-shot `token.txt`
//! which is consumed and persisted into the env file for later runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const TOKEN_ENV: &str = "DROPBOX_ACCESS_TOKEN";
pub const TOKEN_FILE: &str = "token.txt";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no access token: pass --token, set DROPBOX_ACCESS_TOKEN, or create {0:?}")]
    Missing(PathBuf),
    #[error("token file {0:?} is empty")]
    EmptyFile(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Flag,
    Environment,
    TokenFile,
}

pub struct TokenResolver {
    env_file: PathBuf,
    token_file: PathBuf,
}

impl TokenResolver {
    pub fn new(env_file: impl Into<PathBuf>, token_file: impl Into<PathBuf>) -> Self {
        Self {
            env_file: env_file.into(),
            token_file: token_file.into(),
        }
    }

    /// `env_value` is the current value of [`TOKEN_ENV`], read by the caller.
    pub fn resolve(
        &self,
        flag: Option<String>,
        env_value: Option<String>,
    ) -> Result<(String, TokenSource), TokenError> {
        if let Some(token) = non_empty(flag) {
            return Ok((token, TokenSource::Flag));
        }
        if let Some(token) = non_empty(env_value) {
            return Ok((token, TokenSource::Environment));
        }
        if !self.token_file.exists() {
            return Err(TokenError::Missing(self.token_file.clone()));
        }

        let token = read(&self.token_file)?.trim().to_string();
        fs::remove_file(&self.token_file).map_err(|source| TokenError::Io {
            path: self.token_file.clone(),
            source,
        })?;
        if token.is_empty() {
            return Err(TokenError::EmptyFile(self.token_file.clone()));
        }
        self.persist(&token)?;
        Ok((token, TokenSource::TokenFile))
    }

    fn persist(&self, token: &str) -> Result<(), TokenError> {
        let current = match fs::read_to_string(&self.env_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(TokenError::Io {
                    path: self.env_file.clone(),
                    source,
                });
            }
        };
        fs::write(&self.env_file, upsert_env_line(&current, TOKEN_ENV, token)).map_err(
            |source| TokenError::Io {
                path: self.env_file.clone(),
                source,
            },
        )?;
        tracing::info!(path = %self.env_file.display(), "saved access token");
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, TokenError> {
    fs::read_to_string(path).map_err(|source| TokenError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Sets `key=value` in dotenv-formatted `contents`, replacing an existing
/// assignment (with or without `export`) or appending a new line.
pub fn upsert_env_line(contents: &str, key: &str, value: &str) -> String {
    let assignment = format!("{key}={value}");
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            let bare = line.trim_start();
            let bare = bare.strip_prefix("export ").unwrap_or(bare).trim_start();
            let matches = bare
                .strip_prefix(key)
                .is_some_and(|rest| rest.trim_start().starts_with('='));
            if matches && !replaced {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flag_wins_over_environment() {
        let dir = tempdir().unwrap();
        let resolver = TokenResolver::new(dir.path().join(".env"), dir.path().join(TOKEN_FILE));
        let (token, source) = resolver
            .resolve(Some("from-flag".into()), Some("from-env".into()))
            .unwrap();
        assert_eq!(token, "from-flag");
        assert_eq!(source, TokenSource::Flag);

        let (token, source) = resolver
            .resolve(Some("   ".into()), Some("from-env\n".into()))
            .unwrap();
        assert_eq!(token, "from-env");
        assert_eq!(source, TokenSource::Environment);
    }

    #[test]
    fn token_file_is_consumed_and_persisted() {
        let dir = tempdir().unwrap();
        let env_file = dir.path().join(".env");
        let token_file = dir.path().join(TOKEN_FILE);
        fs::write(&env_file, "DROPBOX_FOLDER=/Invoices\nDROPBOX_ACCESS_TOKEN=old\n").unwrap();
        fs::write(&token_file, "  sl.fresh-token \n").unwrap();

        let (token, source) = TokenResolver::new(&env_file, &token_file)
            .resolve(None, None)
            .unwrap();

        assert_eq!(token, "sl.fresh-token");
        assert_eq!(source, TokenSource::TokenFile);
        assert!(!token_file.exists());
        assert_eq!(
            fs::read_to_string(&env_file).unwrap(),
            "DROPBOX_FOLDER=/Invoices\nDROPBOX_ACCESS_TOKEN=sl.fresh-token\n"
        );
    }

    #[test]
    fn empty_token_file_is_rejected_and_removed() {
        let dir = tempdir().unwrap();
        let token_file = dir.path().join(TOKEN_FILE);
        fs::write(&token_file, "\n").unwrap();

        let err = TokenResolver::new(dir.path().join(".env"), &token_file)
            .resolve(None, None)
            .expect_err("empty token");
        assert!(matches!(err, TokenError::EmptyFile(_)));
        assert!(!token_file.exists());
        assert!(!dir.path().join(".env").exists());
    }

    #[test]
    fn missing_everything_names_the_token_file() {
        let dir = tempdir().unwrap();
        let err = TokenResolver::new(dir.path().join(".env"), dir.path().join(TOKEN_FILE))
            .resolve(None, None)
            .expect_err("no token anywhere");
        assert!(matches!(err, TokenError::Missing(_)));
        assert!(err.to_string().contains("DROPBOX_ACCESS_TOKEN"));
    }

    #[test]
    fn upsert_replaces_or_appends() {
        assert_eq!(upsert_env_line("", "K", "v"), "K=v\n");
        assert_eq!(upsert_env_line("A=1", "K", "v"), "A=1\nK=v\n");
        assert_eq!(
            upsert_env_line("export K = old\nKEY=keep\n", "K", "new"),
            "K=new\nKEY=keep\n"
        );
    }
}
