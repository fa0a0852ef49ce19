use super::{RecordStream, SourceAdapter, validated};
use crate::SourceOptions;
use crate::coerce::{self, RowExt};
use crate::db;
use crate::error::{ErrorKind, Result};
use crate::models::{Extracted, Kind, Record, UserAccount};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use serde::Deserialize;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SERVICE: &str = "jellyfin";
const IS_ADMINISTRATOR: i64 = 0;
const IS_DISABLED: i64 = 2;

/// Jellyfin accounts.
///
/// Read from `data/data/jellyfin.db` when it exists; older installs keep one
/// `users/<name>/config.json` per account instead.
pub struct JellyfinUsers {
    db: PathBuf,
    users_dir: PathBuf,
    options: SourceOptions,
}

impl JellyfinUsers {
    pub fn new(dir: impl AsRef<Path>, options: SourceOptions) -> Self {
        let dir = dir.as_ref();
        Self { db: dir.join("data").join("data").join("jellyfin.db"), users_dir: dir.join("users"), options }
    }

    fn from_database(&self) -> RecordStream<'_> {
        Box::pin(stream!({
            let mut conn = match db::open(SERVICE, &self.db, &self.options).await {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            if let Err(e) = db::require_table(&mut conn, SERVICE, "Users").await {
                yield Err(e);
                return;
            }
            let permissions = match permissions(&mut conn).await {
                Ok(permissions) => permissions,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };

            let mut rows = sqlx::query("SELECT * FROM Users ORDER BY rowid").fetch(&mut conn);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Read(SERVICE)) {
                    Ok(row) => {
                        yield Ok(validated(user(&row, &permissions)));
                    },
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                }
            }
        }))
    }

    fn from_legacy_dir(&self) -> RecordStream<'_> {
        Box::pin(stream!({
            let names = match legacy_user_dirs(&self.users_dir).await {
                Ok(names) => names,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            for (name, path) in names {
                let config = path.join("config.json");
                match tokio::fs::read(&config).await {
                    Ok(bytes) => match serde_json::from_slice::<LegacyUser>(&bytes) {
                        Ok(legacy) => {
                            yield Ok(validated(legacy.into_record(name)));
                        },
                        Err(e) => {
                            yield Ok(incomplete(&config, e));
                        },
                    },
                    // A user directory without a config has nothing to back up.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        yield Ok(incomplete(&config, e));
                    },
                }
            }
        }))
    }
}

impl SourceAdapter for JellyfinUsers {
    fn kind(&self) -> Kind {
        Kind::Users
    }

    fn extract(&self) -> RecordStream<'_> {
        if self.db.is_file() || !self.users_dir.is_dir() {
            self.from_database()
        } else {
            tracing::debug!(dir = %self.users_dir.display(), "No Jellyfin database, reading legacy user directory");
            self.from_legacy_dir()
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Permissions {
    administrator: bool,
    disabled: bool,
}

/// Admin and disabled flags per lowercase user id.
async fn permissions(conn: &mut SqliteConnection) -> Result<HashMap<String, Permissions>> {
    let mut map: HashMap<String, Permissions> = HashMap::new();
    if !db::table_exists(conn, "Permissions").await? {
        return Ok(map);
    }
    let rows = sqlx::query("SELECT UserId, Kind, Value FROM Permissions WHERE Kind IN (?, ?)")
        .bind(IS_ADMINISTRATOR)
        .bind(IS_DISABLED)
        .fetch_all(conn)
        .await
        .or_raise(|| ErrorKind::Read(SERVICE))?;
    for row in rows {
        let Some(user) = row.text("UserId") else { continue };
        let entry = map.entry(user.to_lowercase()).or_default();
        match row.opt::<i64>("Kind") {
            Some(IS_ADMINISTRATOR) => entry.administrator = row.flag("Value"),
            Some(IS_DISABLED) => entry.disabled = row.flag("Value"),
            _ => {},
        }
    }
    Ok(map)
}

fn user(row: &SqliteRow, permissions: &HashMap<String, Permissions>) -> std::result::Result<Record, String> {
    let id = row.text("Id").map(|id| id.to_lowercase()).ok_or("user row without an id")?;
    let username = row.text("Username").ok_or_else(|| format!("user {id} has no name"))?;
    let flags = permissions.get(&id).copied().unwrap_or_default();
    Ok(Record::User(UserAccount {
        native_id: id,
        username,
        is_administrator: flags.administrator,
        is_disabled: flags.disabled,
        last_login_at: row.timestamp("LastLoginDate"),
        last_activity_at: row.timestamp("LastActivityDate"),
    }))
}

fn incomplete(path: &Path, reason: impl std::fmt::Display) -> Extracted {
    tracing::warn!(path = %path.display(), reason = %reason, "Skipping unreadable Jellyfin user");
    Extracted::Incomplete { source: path.display().to_string(), reason: reason.to_string() }
}

async fn legacy_user_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let unavailable = || ErrorKind::Unavailable(format!("{SERVICE} has neither a database nor {}", dir.display()));
    let mut entries = tokio::fs::read_dir(dir).await.or_raise(unavailable)?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Read(SERVICE))? {
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
            dirs.push((name.to_string(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    policy: LegacyPolicy,
    #[serde(default)]
    last_login_date: Option<String>,
    #[serde(default)]
    last_activity_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyPolicy {
    #[serde(default)]
    is_administrator: bool,
    #[serde(default)]
    is_disabled: bool,
}

impl LegacyUser {
    fn into_record(self, username: String) -> std::result::Result<Record, String> {
        let id = self
            .id
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("user {username} has no id"))?;
        Ok(Record::User(UserAccount {
            native_id: id,
            username,
            is_administrator: self.policy.is_administrator,
            is_disabled: self.policy.is_disabled,
            last_login_at: self.last_login_date.as_deref().and_then(coerce::timestamp),
            last_activity_at: self.last_activity_date.as_deref().and_then(coerce::timestamp),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixtures;
    use futures::TryStreamExt;
    use std::ops::Deref;

    fn users(items: &[Extracted]) -> Vec<&UserAccount> {
        items
            .iter()
            .filter_map(|item| match item {
                Extracted::Record(Record::User(user)) => Some(user),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_users_with_permissions() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::database(dir.path().join("data/data/jellyfin.db"), &[
            "CREATE TABLE Users (Id TEXT PRIMARY KEY, Username TEXT, LastLoginDate TEXT, LastActivityDate TEXT)",
            "CREATE TABLE Permissions (Id INTEGER PRIMARY KEY, Kind INTEGER, Value INTEGER, UserId TEXT)",
            "INSERT INTO Users VALUES ('5F1C7A2E-0000-4000-8000-000000000001', 'maison', '2024-02-03 04:05:06', NULL)",
            "INSERT INTO Users VALUES ('5F1C7A2E-0000-4000-8000-000000000002', 'guest', NULL, NULL)",
            "INSERT INTO Permissions VALUES (1, 0, 1, '5F1C7A2E-0000-4000-8000-000000000001')",
            "INSERT INTO Permissions VALUES (2, 2, 1, '5F1C7A2E-0000-4000-8000-000000000002')",
            "INSERT INTO Permissions VALUES (3, 1, 1, '5F1C7A2E-0000-4000-8000-000000000002')",
        ])
        .await;

        let items: Vec<Extracted> =
            JellyfinUsers::new(dir.path(), SourceOptions::default()).extract().try_collect().await.unwrap();
        let users = users(&items);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].native_id, "5f1c7a2e-0000-4000-8000-000000000001");
        assert!(users[0].is_administrator && !users[0].is_disabled);
        assert_eq!(users[0].last_login_at.as_deref(), Some("2024-02-03T04:05:06Z"));
        assert!(!users[1].is_administrator && users[1].is_disabled);
    }

    #[tokio::test]
    async fn test_legacy_user_directories() {
        let dir = tempfile::tempdir().unwrap();
        let users_dir = dir.path().join("users");
        for (name, config) in [
            ("alice", Some(r#"{"Id": "AAAA", "Policy": {"IsAdministrator": true}}"#)),
            ("bob", Some(r#"{"Id": "bbbb", "Policy": {"IsDisabled": true}}"#)),
            ("carol", Some("{not json")),
            ("dave", None),
        ] {
            std::fs::create_dir_all(users_dir.join(name)).unwrap();
            if let Some(config) = config {
                std::fs::write(users_dir.join(name).join("config.json"), config).unwrap();
            }
        }

        let items: Vec<Extracted> =
            JellyfinUsers::new(dir.path(), SourceOptions::default()).extract().try_collect().await.unwrap();
        assert_eq!(items.len(), 3);
        let users = users(&items);
        assert_eq!((users[0].native_id.as_str(), users[0].username.as_str()), ("aaaa", "alice"));
        assert!(users[0].is_administrator);
        assert!(users[1].is_disabled);
        assert!(matches!(&items[2], Extracted::Incomplete { source, .. } if source.contains("carol")));
    }

    #[tokio::test]
    async fn test_nothing_installed_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JellyfinUsers::new(dir.path(), SourceOptions::default());
        let mut stream = adapter.extract();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::Unavailable(_)));
    }
}
