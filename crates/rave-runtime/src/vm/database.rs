use std::time::Duration;

use rave_core::{Error, Result};

use crate::ssh::{self, SshOptions};
use crate::vm::manager::VmManager;

/// Escape a string for inclusion in a single-quoted SQL literal by
/// doubling embedded quotes. Statements reach postgres through a psql
/// heredoc over SSH, where parameter binding is unavailable.
fn sql_quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Services whose database role passwords the manager reconciles.
const SIMPLE_ROLES: [&str; 4] = ["gitlab", "grafana", "penpot", "n8n"];

impl VmManager {
    /// Ensure the Mattermost role and database exist with the given
    /// password, creating both when missing.
    pub async fn ensure_mattermost_database(&self, name: &str, password: &str) -> Result<()> {
        let record = self.load_running(name)?;
        let password_sql = sql_quote_literal(password);

        let remote_script = [
            "set -euo pipefail".to_string(),
            "sudo -u postgres psql postgres <<'SQL'".to_string(),
            "DO $$".to_string(),
            "BEGIN".to_string(),
            "  IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'mattermost') THEN".to_string(),
            format!("    CREATE ROLE mattermost WITH LOGIN PASSWORD '{password_sql}';"),
            "  ELSE".to_string(),
            format!("    ALTER ROLE mattermost WITH LOGIN PASSWORD '{password_sql}';"),
            "  END IF;".to_string(),
            "END".to_string(),
            "$$;".to_string(),
            "SQL".to_string(),
            "sudo -u postgres psql postgres -tc \"SELECT 1 FROM pg_database WHERE datname = 'mattermost';\" | grep -q 1 || sudo -u postgres createdb -O mattermost mattermost".to_string(),
            "sudo -u postgres psql mattermost -c \"GRANT ALL PRIVILEGES ON SCHEMA public TO mattermost;\"".to_string(),
        ]
        .join("\n")
            + "\n";

        let opts = SshOptions::new(
            Duration::from_secs(180),
            "resetting Mattermost database",
        );
        ssh::run_remote_script(&record, &remote_script, &opts).await?;
        Ok(())
    }

    /// Ensure a service role's password matches the injected secret.
    /// Supported roles: gitlab, grafana, penpot, n8n.
    pub async fn ensure_database_password(
        &self,
        name: &str,
        role: &str,
        password: &str,
    ) -> Result<()> {
        if !SIMPLE_ROLES.contains(&role) {
            return Err(Error::validation(format!(
                "unknown database role '{role}'; expected one of {}",
                SIMPLE_ROLES.join(", ")
            )));
        }
        let record = self.load_running(name)?;
        let password_sql = sql_quote_literal(password);

        let remote_script = format!(
            "set -euo pipefail\n\
             sudo -u postgres psql postgres <<'SQL'\n\
             ALTER ROLE {role} WITH LOGIN PASSWORD '{password_sql}';\n\
             SQL\n"
        );

        let opts = SshOptions::new(
            Duration::from_secs(60),
            format!("refreshing {role} database password"),
        );
        ssh::run_remote_script(&record, &remote_script, &opts).await?;
        Ok(())
    }

    /// Ensure the prometheus exporter role password and rewrite its DSN
    /// environment file.
    pub async fn ensure_prometheus_database(&self, name: &str, password: &str) -> Result<()> {
        let record = self.load_running(name)?;
        let password_sql = sql_quote_literal(password);
        let password_arg = shlex::try_quote(password)
            .map_err(|_| Error::validation("password is not shell-safe"))?;

        let remote_script = [
            "set -euo pipefail".to_string(),
            format!("PASSWORD={password_arg}"),
            "sudo -u postgres psql postgres <<'SQL'".to_string(),
            format!("ALTER ROLE prometheus WITH LOGIN PASSWORD '{password_sql}';"),
            "SQL".to_string(),
            "DSN_FILE=/run/secrets/database/prometheus-dsn.env".to_string(),
            "mkdir -p /run/secrets/database".to_string(),
            "printf 'DATA_SOURCE_NAME=postgresql://prometheus:%s@localhost:5432/postgres?sslmode=disable\\n' \"$PASSWORD\" > \"$DSN_FILE\"".to_string(),
            "chown prometheus-postgres-exporter:prometheus-postgres-exporter \"$DSN_FILE\"".to_string(),
            "chmod 0400 \"$DSN_FILE\"".to_string(),
        ]
        .join("\n")
            + "\n";

        let opts = SshOptions::new(
            Duration::from_secs(60),
            "refreshing Prometheus exporter database password",
        );
        ssh::run_remote_script(&record, &remote_script, &opts).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_quote_literal_doubles_quotes() {
        assert_eq!(sql_quote_literal("plain"), "plain");
        assert_eq!(sql_quote_literal("o'brien"), "o''brien");
        assert_eq!(sql_quote_literal("''"), "''''");
    }

    #[test]
    fn test_quoted_literal_cannot_break_out() {
        let hostile = "x'; DROP TABLE users; --";
        let quoted = format!("'{}'", sql_quote_literal(hostile));
        // Every embedded quote stays doubled, so the literal never closes early.
        assert_eq!(quoted, "'x''; DROP TABLE users; --'");
        assert_eq!(quoted.matches("''").count(), 1);
    }
}
