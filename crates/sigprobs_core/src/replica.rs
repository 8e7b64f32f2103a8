use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info};

use crate::api::SiteApi;
use crate::error::ReplicaError;
use crate::lint::LintDiagnostic;
use crate::model::UserProps;
use crate::site::SiteInfo;

const BLOCK_COUNT: u32 = 100;

/// Subset of the MediaWiki schema the replica queries read.
pub const REPLICA_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "user" (
    user_id INTEGER PRIMARY KEY,
    user_name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS user_properties (
    up_user INTEGER NOT NULL,
    up_property TEXT NOT NULL,
    up_value TEXT,
    PRIMARY KEY (up_user, up_property)
);
CREATE TABLE IF NOT EXISTS actor (
    actor_id INTEGER PRIMARY KEY,
    actor_name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS revision (
    rev_id INTEGER PRIMARY KEY,
    rev_actor INTEGER NOT NULL,
    rev_timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS revision_actor_timestamp ON revision (rev_actor, rev_timestamp);
"#;

const ACTIVE_SIGNATURES_SQL: &str = r#"
SELECT u.user_name, CAST(nick.up_value AS TEXT)
FROM user_properties AS nick
JOIN "user" AS u ON u.user_id = nick.up_user
WHERE nick.up_user % 100 = ?1
  AND nick.up_property = 'nickname'
  AND nick.up_value != u.user_name
  AND nick.up_user IN (
      SELECT up_user FROM user_properties
      WHERE up_property = 'fancysig' AND CAST(up_value AS INTEGER) = 1
  )
  AND u.user_name IN (
      SELECT actor_name FROM revision
      JOIN actor ON rev_actor = actor_id
      WHERE rev_timestamp > ?2
  )
ORDER BY nick.up_user ASC
"#;

/// Read-only handle on one site's replica database (`<dir>/<dbname>.db`).
pub struct Replica {
    connection: Connection,
    dbname: String,
}

impl Replica {
    pub fn path_for(replica_dir: &Path, dbname: &str) -> PathBuf {
        replica_dir.join(format!("{dbname}.db"))
    }

    pub fn open(replica_dir: Option<&Path>, dbname: &str) -> Result<Self, ReplicaError> {
        let Some(replica_dir) = replica_dir else {
            return Err(ReplicaError::Unavailable(
                "no replica directory configured".to_string(),
            ));
        };
        let path = Self::path_for(replica_dir, dbname);
        if !path.exists() {
            return Err(ReplicaError::Unavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let connection = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|error| ReplicaError::Unavailable(format!("{}: {error}", path.display())))?;
        Ok(Self {
            connection,
            dbname: dbname.to_string(),
        })
    }

    /// Like [`Replica::open`], but an unreachable replica is `None`.
    pub fn open_optional(replica_dir: Option<&Path>, dbname: &str) -> Result<Option<Self>> {
        match Self::open(replica_dir, dbname) {
            Ok(replica) => Ok(Some(replica)),
            Err(ReplicaError::Unavailable(reason)) => {
                debug!(dbname, %reason, "replica unavailable");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Users with a custom signature who edited after `since` (`YYYYMMDDHHMMSS`),
    /// fetched in blocks by the last two digits of the user id.
    pub fn active_signatures(&self, since: &str) -> ActiveSignatures<'_> {
        ActiveSignatures {
            replica: self,
            since: since.to_string(),
            block: 0,
            buffered: VecDeque::new(),
        }
    }

    fn signature_block(&self, block: u32, since: &str) -> Result<Vec<(String, String)>, ReplicaError> {
        let mut statement = self.connection.prepare_cached(ACTIVE_SIGNATURES_SQL)?;
        let rows = statement
            .query_map(params![block, since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn user_properties(&self, username: &str) -> Result<UserProps, ReplicaError> {
        let mut statement = self.connection.prepare_cached(
            r#"SELECT up_property, CAST(up_value AS TEXT)
               FROM user_properties
               WHERE up_user = (SELECT user_id FROM "user" WHERE user_name = ?1)"#,
        )?;
        let rows = statement
            .query_map(params![stored_user_name(username)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut props = UserProps::default();
        for (property, value) in rows {
            match property.as_str() {
                "nickname" => props.nickname = value,
                "fancysig" => {
                    props.fancysig = value.trim().parse::<i64>().is_ok_and(|flag| flag != 0)
                }
                _ => {}
            }
        }
        Ok(props)
    }

    /// Signatures for the given users, skipping those without a custom one.
    pub fn listed_signatures(&self, users: &[String]) -> Result<Vec<(String, String)>, ReplicaError> {
        let mut out = Vec::new();
        for user in users {
            let props = self.user_properties(user)?;
            if props.fancysig && !props.nickname.is_empty() {
                out.push((user.clone(), props.nickname));
            }
        }
        Ok(out)
    }

    pub fn user_exists(&self, username: &str) -> Result<bool, ReplicaError> {
        let found = self
            .connection
            .query_row(
                r#"SELECT user_id FROM "user" WHERE user_name = ?1"#,
                params![stored_user_name(username)],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// `user_name` rows hold the display form, with spaces where titles use `_`.
fn stored_user_name(username: &str) -> String {
    username.replace('_', " ")
}

pub struct ActiveSignatures<'a> {
    replica: &'a Replica,
    since: String,
    block: u32,
    buffered: VecDeque<(String, String)>,
}

impl Iterator for ActiveSignatures<'_> {
    type Item = Result<(String, String), ReplicaError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Some(Ok(row));
            }
            if self.block >= BLOCK_COUNT {
                return None;
            }
            let block = self.block;
            self.block += 1;
            info!(dbname = %self.replica.dbname, block, "reading signature block");
            match self.replica.signature_block(block, &self.since) {
                Ok(rows) => self.buffered = rows.into(),
                Err(error) => {
                    self.block = BLOCK_COUNT;
                    return Some(Err(error));
                }
            }
        }
    }
}

/// Answers user lookups from the replica, falling back to the wrapped API only
/// when the replica is unavailable. Everything else goes straight to the API.
pub struct ReplicaFirst<'a, A: SiteApi + ?Sized> {
    api: &'a mut A,
    replica: Option<&'a Replica>,
}

impl<'a, A: SiteApi + ?Sized> ReplicaFirst<'a, A> {
    pub fn new(api: &'a mut A, replica: Option<&'a Replica>) -> Self {
        Self { api, replica }
    }
}

impl<A: SiteApi + ?Sized> SiteApi for ReplicaFirst<'_, A> {
    fn site_info(&mut self) -> Result<SiteInfo> {
        self.api.site_info()
    }

    fn expand_templates(&mut self, wikitext: &str) -> Result<String> {
        self.api.expand_templates(wikitext)
    }

    fn lint(&mut self, wikitext: &str) -> Result<Vec<LintDiagnostic>> {
        self.api.lint(wikitext)
    }

    fn user_exists(&mut self, username: &str) -> Result<bool> {
        if let Some(replica) = self.replica {
            match replica.user_exists(username) {
                Ok(exists) => return Ok(exists),
                Err(ReplicaError::Unavailable(reason)) => {
                    debug!(username, %reason, "replica unavailable, asking the API");
                }
                Err(error) => return Err(error.into()),
            }
        }
        self.api.user_exists(username)
    }

    fn signature_template(&mut self) -> Result<String> {
        self.api.signature_template()
    }

    fn request_count(&self) -> usize {
        self.api.request_count()
    }
}
