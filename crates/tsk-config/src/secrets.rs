//! Bearer credential resolution.
//!
//! # Contract
//! - Config YAML stores only the env var NAME (`auth.token_env`).
//! - At startup the composition root calls [`resolve_credential`] once and
//!   hands the result to the transports; nothing else reads the env.
//! - `Debug` redacts the value; errors name the variable, never the value.

use anyhow::{bail, Result};

use crate::ClientConfig;

#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    /// Variable the credential was read from.
    pub env_var: String,
    token: Option<String>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("env_var", &self.env_var)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl ResolvedCredential {
    /// No credential; requests go out unauthenticated.
    pub fn anonymous(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            token: None,
        }
    }

    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_present(&self) -> bool {
        self.token.is_some()
    }

    /// Fail with the variable NAME when no credential was found.
    pub fn require(&self) -> Result<&str> {
        match self.bearer() {
            Some(t) => Ok(t),
            None => bail!(
                "SECRETS_MISSING: required env var '{}' (bearer token) is not set or empty",
                self.env_var
            ),
        }
    }
}

/// Resolve from the process environment.
pub fn resolve_credential(cfg: &ClientConfig) -> ResolvedCredential {
    resolve_credential_with(cfg, |name| std::env::var(name).ok())
}

/// Resolve through `lookup`. Blank values count as absent.
pub fn resolve_credential_with<F>(cfg: &ClientConfig, lookup: F) -> ResolvedCredential
where
    F: Fn(&str) -> Option<String>,
{
    let env_var = cfg.auth.token_env.trim().to_string();
    let token = lookup(&env_var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    ResolvedCredential { env_var, token }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let cfg = ClientConfig::default();
        let cred = resolve_credential_with(&cfg, |_| Some("super-secret-jwt".to_string()));
        let s = format!("{cred:?}");
        assert!(!s.contains("super-secret-jwt"));
        assert!(s.contains("TSK_TOKEN"));
        assert_eq!(cred.bearer(), Some("super-secret-jwt"));
    }

    #[test]
    fn blank_value_is_absent_and_error_names_var() {
        let cfg = ClientConfig::default();
        let cred = resolve_credential_with(&cfg, |_| Some("   ".to_string()));
        assert!(!cred.is_present());
        let err = cred.require().unwrap_err().to_string();
        assert!(err.contains("TSK_TOKEN"));
    }

    #[test]
    fn reads_configured_variable_name() {
        let mut cfg = ClientConfig::default();
        cfg.auth.token_env = "OTHER_TOKEN".to_string();
        let cred = resolve_credential_with(&cfg, |name| {
            (name == "OTHER_TOKEN").then(|| "abc".to_string())
        });
        assert_eq!(cred.bearer(), Some("abc"));
    }
}
