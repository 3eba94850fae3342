//! Rendering and fingerprinting of the Synapse homeserver configuration.
//!
//! The homeserver.yaml template lives in `templates/` and is compiled into
//! the binary by askama, so a malformed template fails the build instead of
//! a reconcile pass.

use askama::Template;
use sha2::{Digest, Sha256};

use crate::keys::random_string;

/// Basic configuration for a Synapse homeserver. Feeds the homeserver.yaml
/// template.
#[derive(Debug, Clone, Default)]
pub struct HomeserverConfig {
    /// Public DNS name.
    pub server_name: String,
    /// Redirect web clients to this URL (probably an Element Web instance).
    pub web_client_location: Option<String>,
    /// URI to reach an admin with (example: `mailto:admin@example.com`).
    pub admin_contact: Option<String>,
    /// Whether to report anonymous usage statistics.
    pub report_stats: bool,

    /// Various secrets Synapse uses. Values left empty are replaced with a
    /// securely generated random string at render time.
    pub registration_shared_secret: String,
    pub macaroon_secret_key: String,
    pub form_secret: String,

    /// If set, configure for Postgres. Otherwise, use sqlite3.
    pub postgres: Option<PostgresConfig>,

    /// Included verbatim at the tail of homeserver.yaml.
    pub include_config_yaml: String,
}

/// Parameters for connecting to a Postgres database. Empty user, database,
/// and port fields fall back to `synapse`, `synapse`, and `5432`.
#[derive(Debug, Clone, Default)]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: String,
}

#[derive(Template)]
#[template(path = "homeserver.yaml", escape = "none")]
struct HomeserverYaml<'a> {
    config: &'a HomeserverConfig,
}

impl HomeserverConfig {
    /// Renders a homeserver.yaml document from this configuration.
    ///
    /// Secrets left at their empty values are substituted with a fresh
    /// 64-character random string for this render only. The substitute is
    /// not written back to `self` and not persisted anywhere; callers that
    /// need stable secrets across renders must fill in the fields first.
    ///
    /// Field values are inserted verbatim. Strings containing YAML syntax
    /// are not escaped beyond the template's own quoting, so this is not
    /// safe for untrusted input.
    pub fn render(&self) -> Result<String, askama::Error> {
        let mut config = self.clone();
        if config.registration_shared_secret.is_empty() {
            config.registration_shared_secret = random_string(64);
        }
        if config.macaroon_secret_key.is_empty() {
            config.macaroon_secret_key = random_string(64);
        }
        if config.form_secret.is_empty() {
            config.form_secret = random_string(64);
        }
        if let Some(pg) = config.postgres.as_mut() {
            if pg.user.is_empty() {
                pg.user = "synapse".to_string();
            }
            if pg.database.is_empty() {
                pg.database = "synapse".to_string();
            }
            if pg.port.is_empty() {
                pg.port = "5432".to_string();
            }
        }

        HomeserverYaml { config: &config }.render()
    }

    /// Computes a hex-encoded SHA-256 digest over the configuration inputs
    /// the reconciler derives from a Synapse resource and its credential
    /// Secret. Attached to the generated ConfigMap, the digest tells us
    /// when homeserver.yaml has become stale relative to those inputs.
    ///
    /// The field list is fixed and explicit. A template field that the
    /// reconciler starts setting must also be added here, or drift
    /// detection will silently miss changes to it. An absent Postgres
    /// sub-record contributes nothing to the digest.
    pub fn fingerprint(&self) -> String {
        let mut hash = Sha256::new();
        hash_field(&mut hash, "server_name", self.server_name.as_bytes());
        hash_field(&mut hash, "report_stats", &[u8::from(self.report_stats)]);
        hash_field(
            &mut hash,
            "registration_shared_secret",
            self.registration_shared_secret.as_bytes(),
        );
        hash_field(
            &mut hash,
            "macaroon_secret_key",
            self.macaroon_secret_key.as_bytes(),
        );
        hash_field(&mut hash, "form_secret", self.form_secret.as_bytes());
        if let Some(pg) = &self.postgres {
            hash.update(b"postgres");
            hash.update(pg.user.as_bytes());
            hash.update(pg.password.as_bytes());
            hash.update(pg.database.as_bytes());
            hash.update(pg.host.as_bytes());
            hash.update(pg.port.as_bytes());
        }
        hex::encode(hash.finalize())
    }
}

fn hash_field(hash: &mut Sha256, name: &str, value: &[u8]) {
    hash.update(name.as_bytes());
    hash.update(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn base_config() -> HomeserverConfig {
        HomeserverConfig {
            server_name: "example.com".to_string(),
            report_stats: false,
            registration_shared_secret: "reg".to_string(),
            macaroon_secret_key: "mac".to_string(),
            form_secret: "form".to_string(),
            ..HomeserverConfig::default()
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let config = base_config();
        assert_eq!(config.fingerprint(), config.fingerprint());
        assert_eq!(config.fingerprint(), config.clone().fingerprint());
    }

    #[test]
    fn fingerprint_ignores_fields_outside_the_enumeration() {
        let a = base_config();
        let mut b = base_config();
        b.web_client_location = Some("https://element.example.com".to_string());
        b.admin_contact = Some("mailto:admin@example.com".to_string());
        b.include_config_yaml = "suppress_key_server_warning: true\n".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_enumerated_fields() {
        let base = base_config();

        let mut other = base_config();
        other.server_name = "example.org".to_string();
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = base_config();
        other.report_stats = true;
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = base_config();
        other.macaroon_secret_key = "different".to_string();
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = base_config();
        other.postgres = Some(PostgresConfig {
            host: "db.example.com".to_string(),
            ..PostgresConfig::default()
        });
        assert_ne!(base.fingerprint(), other.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_postgres_sub_fields() {
        let pg = |password: &str| HomeserverConfig {
            postgres: Some(PostgresConfig {
                user: "synapse".to_string(),
                password: password.to_string(),
                database: "synapse".to_string(),
                host: "db".to_string(),
                port: "5432".to_string(),
            }),
            ..base_config()
        };
        assert_ne!(pg("hunter2").fingerprint(), pg("hunter3").fingerprint());
    }

    // Rendered secrets as Synapse would read them back.
    #[derive(Deserialize)]
    struct RenderedSecrets {
        registration_shared_secret: String,
        macaroon_secret_key: String,
        form_secret: String,
        report_stats: bool,
    }

    #[test]
    fn render_substitutes_empty_secrets() {
        let config = HomeserverConfig {
            server_name: "example.com".to_string(),
            ..HomeserverConfig::default()
        };

        let doc = config.render().expect("render");
        let parsed: RenderedSecrets = serde_yaml::from_str(&doc).expect("valid yaml");

        assert_eq!(parsed.registration_shared_secret.len(), 64);
        assert_eq!(parsed.macaroon_secret_key.len(), 64);
        assert_eq!(parsed.form_secret.len(), 64);
        assert!(!parsed.report_stats);

        // The substitution is per-render: the caller's record stays empty.
        assert!(config.registration_shared_secret.is_empty());
    }

    #[test]
    fn render_keeps_provided_secrets() {
        let config = base_config();
        let doc = config.render().expect("render");
        let parsed: RenderedSecrets = serde_yaml::from_str(&doc).expect("valid yaml");
        assert_eq!(parsed.registration_shared_secret, "reg");
        assert_eq!(parsed.macaroon_secret_key, "mac");
        assert_eq!(parsed.form_secret, "form");
    }

    #[test]
    fn render_defaults_postgres_connection_fields() {
        let mut config = base_config();
        config.postgres = Some(PostgresConfig {
            password: "hunter2".to_string(),
            host: "db.example.com".to_string(),
            ..PostgresConfig::default()
        });

        let doc = config.render().expect("render");
        assert!(doc.contains(r#"name: "psycopg2""#));
        assert!(doc.contains(r#"user: "synapse""#));
        assert!(doc.contains(r#"database: "synapse""#));
        assert!(doc.contains(r#"port: "5432""#));
        assert!(!doc.contains("sqlite3"));
    }

    #[test]
    fn render_without_postgres_uses_sqlite() {
        let doc = base_config().render().expect("render");
        assert!(doc.contains(r#"name: "sqlite3""#));
        assert!(doc.contains("/data/homeserver.db"));
    }
}
