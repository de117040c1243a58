// Data-source names: the pool's partition key
// The password is resolved from the environment at construction time

use crate::config::DatabaseConfig;
use crate::errors::ConfigurationError;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Opaque, immutable database identity (target + credentials)
///
/// Cloning is cheap. `Debug` and `Display` never show the password.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Dsn(Arc<str>);

impl Dsn {
    /// Wrap an already-built connection string verbatim
    pub fn new(dsn: impl Into<String>) -> Self {
        Self(Arc::from(dsn.into()))
    }

    /// Name of the variable holding the password for `dbname`/`user`
    pub fn secret_var(prefix: &str, dbname: &str, user: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            dbname.to_uppercase(),
            user.to_uppercase()
        )
    }

    /// Build a PostgreSQL DSN, resolving the password through `lookup`
    ///
    /// The password is read from `<prefix>_<DBNAME>_<USER>`; a missing or
    /// empty value is a configuration error.
    pub fn build<F>(
        prefix: &str,
        dbname: &str,
        user: &str,
        host: &str,
        port: u16,
        lookup: F,
    ) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = Self::secret_var(prefix, dbname, user);
        let password = lookup(&var)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigurationError::MissingSecret(var.clone()))?;

        let invalid = |reason: String| ConfigurationError::InvalidSetting {
            name: "database".to_string(),
            reason,
        };

        let mut url = Url::parse(&format!("postgres://{}", host))
            .map_err(|e| invalid(format!("bad host {}: {}", host, e)))?;
        url.set_port(Some(port))
            .map_err(|_| invalid(format!("cannot set port {}", port)))?;
        url.set_username(user)
            .map_err(|_| invalid(format!("cannot set user {}", user)))?;
        url.set_password(Some(&password))
            .map_err(|_| invalid("cannot set password".to_string()))?;
        url.set_path(&format!("/{}", dbname));

        Ok(Self::new(String::from(url)))
    }

    /// Build a DSN with the password taken from the process environment
    pub fn from_env(
        prefix: &str,
        dbname: &str,
        user: &str,
        host: &str,
        port: u16,
    ) -> Result<Self, ConfigurationError> {
        Self::build(prefix, dbname, user, host, port, |var| std::env::var(var).ok())
    }

    pub fn from_settings(config: &DatabaseConfig) -> Result<Self, ConfigurationError> {
        Self::from_env(
            &config.password_env_prefix,
            &config.name,
            &config.user,
            &config.host,
            config.port,
        )
    }

    /// The full connection string, including the password
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The connection string with any password removed, safe for logs
    pub fn redacted(&self) -> String {
        match Url::parse(&self.0) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                String::from(url)
            }
            Err(_) => "<opaque dsn>".to_string(),
        }
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dsn").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
