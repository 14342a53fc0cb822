//! SQLite-backed organisation storage.
//!
//! Tokens are sealed with [`TokenCipher`] before they touch the database.

use super::{ConnectionState, Credentials, LifecycleEvent, Organisation, Sealed, TokenCipher};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Encrypted organisation storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE organisations (
///     id TEXT PRIMARY KEY,              -- UUID
///     region TEXT NOT NULL,             -- immutable once set
///     access_token TEXT,                -- sealed
///     access_token_nonce TEXT,
///     refresh_token TEXT,               -- sealed
///     refresh_token_nonce TEXT,
///     expires_at TEXT,                  -- RFC 3339
///     nango_connection_id TEXT,
///     vendor_ids TEXT NOT NULL,         -- JSON object
///     state TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// Every public method runs under one connection lock, so each call is atomic
/// with respect to the others.
pub struct OrganisationStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

const SELECT_COLUMNS: &str = "id, region,
    access_token, access_token_nonce,
    refresh_token, refresh_token_nonce,
    expires_at, nango_connection_id, vendor_ids, state,
    created_at, updated_at";

impl OrganisationStore {
    /// Creates or opens a store.
    ///
    /// `encryption_key` is the base64-encoded 32-byte master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open organisation database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS organisations (
                id TEXT PRIMARY KEY,
                region TEXT NOT NULL,
                access_token TEXT,
                access_token_nonce TEXT,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT,
                nango_connection_id TEXT,
                vendor_ids TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create organisations table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Organisation store lock poisoned"))
    }

    /// Inserts or replaces an organisation.
    ///
    /// Fails when an organisation with the same id exists in another region.
    /// `created_at` of an existing row is preserved.
    pub fn upsert(&self, organisation: &Organisation) -> Result<()> {
        let (access, refresh, expires_at) = self.seal_credentials(organisation.credentials.as_ref())?;
        let vendor_ids = serde_json::to_string(&organisation.vendor_ids)
            .context("Failed to serialize vendor ids")?;
        let id = organisation.id.to_string();

        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let existing_region: Option<String> = tx
            .query_row(
                "SELECT region FROM organisations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read organisation region")?;

        if let Some(region) = existing_region {
            if region != organisation.region {
                bail!(
                    "Organisation {} is bound to region '{}', refusing to move it to '{}'",
                    organisation.id,
                    region,
                    organisation.region
                );
            }
        }

        tx.execute(
            r#"
            INSERT INTO organisations (
                id, region,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                expires_at, nango_connection_id, vendor_ids, state,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                access_token_nonce = excluded.access_token_nonce,
                refresh_token = excluded.refresh_token,
                refresh_token_nonce = excluded.refresh_token_nonce,
                expires_at = excluded.expires_at,
                nango_connection_id = excluded.nango_connection_id,
                vendor_ids = excluded.vendor_ids,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                id,
                organisation.region,
                access.as_ref().map(|s| s.ciphertext.as_str()),
                access.as_ref().map(|s| s.nonce.as_str()),
                refresh.as_ref().map(|s| s.ciphertext.as_str()),
                refresh.as_ref().map(|s| s.nonce.as_str()),
                expires_at,
                organisation.nango_connection_id,
                vendor_ids,
                organisation.state.as_str(),
                organisation.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to upsert organisation")?;

        tx.commit().context("Failed to commit organisation upsert")?;
        Ok(())
    }

    /// Retrieves one organisation with its credentials opened.
    pub fn get(&self, id: Uuid) -> Result<Option<Organisation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM organisations WHERE id = ?1",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![id.to_string()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(self.read_row(row)?)),
            None => Ok(None),
        }
    }

    /// Lists every organisation, ordered by creation time.
    pub fn list(&self) -> Result<Vec<Organisation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM organisations ORDER BY created_at, id",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt.query([]).context("Failed to execute query")?;
        let mut organisations = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            organisations.push(self.read_row(row)?);
        }
        Ok(organisations)
    }

    /// Replaces the stored token pair in a single statement.
    ///
    /// Returns `false` when the organisation no longer exists.
    pub fn update_credentials(&self, id: Uuid, credentials: &Credentials) -> Result<bool> {
        let (access, refresh, expires_at) = self.seal_credentials(Some(credentials))?;

        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE organisations SET
                    access_token = ?2,
                    access_token_nonce = ?3,
                    refresh_token = ?4,
                    refresh_token_nonce = ?5,
                    expires_at = ?6,
                    updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    access.as_ref().map(|s| s.ciphertext.as_str()),
                    access.as_ref().map(|s| s.nonce.as_str()),
                    refresh.as_ref().map(|s| s.ciphertext.as_str()),
                    refresh.as_ref().map(|s| s.nonce.as_str()),
                    expires_at,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update credentials")?;

        Ok(rows > 0)
    }

    /// Applies a lifecycle event to the stored state.
    ///
    /// Returns the new state, or `None` when the organisation does not exist.
    /// An invalid transition is an error and leaves the row untouched.
    pub fn transition(&self, id: Uuid, event: LifecycleEvent) -> Result<Option<ConnectionState>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM organisations WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read organisation state")?;

        let Some(current) = current else {
            return Ok(None);
        };

        let current = ConnectionState::parse(&current)
            .ok_or_else(|| anyhow!("Unknown stored state '{}'", current))?;
        let next = current.apply(event)?;

        if next != current {
            tx.execute(
                "UPDATE organisations SET state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), next.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to update organisation state")?;
        }

        tx.commit().context("Failed to commit state transition")?;
        Ok(Some(next))
    }

    /// Deletes an organisation.
    ///
    /// Returns `false` when nothing was deleted.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "DELETE FROM organisations WHERE id = ?1",
                params![id.to_string()],
            )
            .context("Failed to delete organisation")?;

        Ok(rows > 0)
    }

    #[allow(clippy::type_complexity)]
    fn seal_credentials(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<(Option<Sealed>, Option<Sealed>, Option<String>)> {
        let Some(credentials) = credentials else {
            return Ok((None, None, None));
        };

        let access = self
            .cipher
            .seal(&credentials.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = credentials
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.seal(token))
            .transpose()
            .context("Failed to encrypt refresh token")?;

        Ok((
            Some(access),
            refresh,
            credentials.expires_at.map(|dt| dt.to_rfc3339()),
        ))
    }

    fn open_column(&self, ciphertext: Option<String>, nonce: Option<String>) -> Result<Option<String>> {
        match (ciphertext, nonce) {
            (Some(ciphertext), Some(nonce)) => {
                Ok(Some(self.cipher.open(&Sealed { ciphertext, nonce })?))
            }
            _ => Ok(None),
        }
    }

    fn read_row(&self, row: &Row<'_>) -> Result<Organisation> {
        let id: String = row.get(0)?;
        let id = Uuid::parse_str(&id).context("Stored organisation id is not a UUID")?;

        let access_token = self
            .open_column(row.get(2)?, row.get(3)?)
            .context("Failed to decrypt access token")?;
        let refresh_token = self
            .open_column(row.get(4)?, row.get(5)?)
            .context("Failed to decrypt refresh token")?;
        let expires_at = parse_timestamp(row.get(6)?).context("Failed to parse expires_at")?;

        let credentials = access_token.map(|access_token| Credentials {
            access_token,
            refresh_token,
            expires_at,
        });

        let vendor_ids: String = row.get(8)?;
        let vendor_ids: BTreeMap<String, String> =
            serde_json::from_str(&vendor_ids).context("Failed to parse vendor ids")?;

        let state: String = row.get(9)?;
        let state = ConnectionState::parse(&state)
            .ok_or_else(|| anyhow!("Unknown stored state '{}'", state))?;

        Ok(Organisation {
            id,
            region: row.get(1)?,
            credentials,
            nango_connection_id: row.get(7)?,
            vendor_ids,
            state,
            created_at: parse_timestamp(row.get(10)?)?
                .ok_or_else(|| anyhow!("Missing created_at"))?,
            updated_at: parse_timestamp(row.get(11)?)?
                .ok_or_else(|| anyhow!("Missing updated_at"))?,
        })
    }
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .context("Invalid RFC 3339 timestamp")
}
