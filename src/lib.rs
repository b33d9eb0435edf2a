use std::{cmp::min, fmt, future::Future, str::FromStr};

use chrono::{Days, NaiveDate, Utc};
use nanoid::nanoid;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

pub mod apikeys;
pub mod session;

pub use apikeys::{
    ApiKeysContext, AppUsage, IndexOutcome, Session, api_keys_index, collect_app_stats,
};

const API_KEY_LENGTH: usize = 43;
const API_KEY_PREVIEW_LENGTH: usize = 6;
const STATS_DATE_FORMAT: &str = "%Y-%m-%d";

/// Who an API key acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyType {
    Device,
    Admin,
}

impl ApiKeyType {
    pub fn as_i64(self) -> i64 {
        match self {
            ApiKeyType::Device => 0,
            ApiKeyType::Admin => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ApiKeyType::Device),
            1 => Some(ApiKeyType::Admin),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ApiKeyType::Device => "Device",
            ApiKeyType::Admin => "Admin",
        }
    }
}

impl FromStr for ApiKeyType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(ApiKeyType::Device),
            "admin" => Ok(ApiKeyType::Admin),
            other => Err(format!("unknown API key type '{other}' (expected device or admin)")),
        }
    }
}

impl fmt::Display for ApiKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub system_admin: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// A tenant. Its authorized apps are loaded on demand and kept for the
/// lifetime of the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Realm {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    authorized_apps: Option<Vec<AuthorizedApp>>,
}

impl Realm {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            authorized_apps: None,
        }
    }

    /// Apps from the last successful load, empty if nothing was loaded yet.
    pub fn authorized_apps(&self) -> &[AuthorizedApp] {
        self.authorized_apps.as_deref().unwrap_or(&[])
    }

    pub fn has_loaded_apps(&self) -> bool {
        self.authorized_apps.is_some()
    }

    /// Loads the realm's apps from `source`, or returns the cached list when
    /// one exists and `force_reload` is false. A failed load leaves the cache
    /// untouched.
    pub async fn load_authorized_apps<S>(
        &mut self,
        source: &S,
        force_reload: bool,
    ) -> Result<&[AuthorizedApp], StoreError>
    where
        S: StatsSource,
    {
        if !force_reload && self.authorized_apps.is_some() {
            return Ok(self.authorized_apps());
        }

        let apps = source.load_authorized_apps(self.id).await?;
        self.authorized_apps = Some(apps);
        Ok(self.authorized_apps())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizedApp {
    pub id: i64,
    pub realm_id: i64,
    pub name: String,
    pub api_key_preview: String,
    pub api_key_type: ApiKeyType,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl AuthorizedApp {
    pub fn is_disabled(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A freshly created app together with its plaintext key. The key is not
/// stored and cannot be recovered later.
#[derive(Debug, Clone)]
pub struct NewAuthorizedApp {
    pub app: AuthorizedApp,
    pub api_key: String,
}

/// Verification codes issued by one app over trailing windows ending today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppStatsSummary {
    pub codes_issued_1d: u64,
    pub codes_issued_7d: u64,
    pub codes_issued_30d: u64,
}

/// Read side used by the API key index.
pub trait StatsSource {
    fn load_authorized_apps(
        &self,
        realm_id: i64,
    ) -> impl Future<Output = Result<Vec<AuthorizedApp>, StoreError>> + Send;

    fn authorized_app_stats_summary(
        &self,
        app: &AuthorizedApp,
        realm: &Realm,
    ) -> impl Future<Output = Result<AppStatsSummary, StoreError>> + Send;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("authorized app {app_id} does not belong to realm {realm_id}")]
    AppNotInRealm { app_id: i64, realm_id: i64 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(database_path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                system_admin INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS realms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_realms (
                user_id INTEGER NOT NULL,
                realm_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, realm_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (realm_id) REFERENCES realms(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authorized_apps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                realm_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                api_key_digest TEXT NOT NULL UNIQUE,
                api_key_preview TEXT NOT NULL,
                api_key_type INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER,
                FOREIGN KEY (realm_id) REFERENCES realms(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authorized_app_stats (
                date TEXT NOT NULL,
                authorized_app_id INTEGER NOT NULL,
                codes_issued INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, authorized_app_id),
                FOREIGN KEY (authorized_app_id) REFERENCES authorized_apps(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_user(
        &self,
        email: &str,
        name: &str,
        system_admin: bool,
    ) -> Result<User, StoreError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(StoreError::InvalidInput("user email is required".to_owned()));
        }
        let name = name.trim().to_owned();

        let result = sqlx::query("INSERT INTO users (email, name, system_admin) VALUES (?, ?, ?)")
            .bind(&email)
            .bind(&name)
            .bind(system_admin)
            .execute(&self.pool)
            .await
            .map_err(|err| conflict_or_database(err, format!("user '{email}'")))?;

        Ok(User {
            id: result.last_insert_rowid(),
            email,
            name,
            system_admin,
        })
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, name, system_admin FROM users WHERE email = ? LIMIT 1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| user_from_row(&row)).transpose()?)
    }

    pub async fn create_realm(&self, name: &str) -> Result<Realm, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("realm name is required".to_owned()));
        }

        let result = sqlx::query("INSERT INTO realms (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|err| conflict_or_database(err, format!("realm '{name}'")))?;

        Ok(Realm::new(result.last_insert_rowid(), name))
    }

    pub async fn find_realm_by_name(&self, name: &str) -> Result<Option<Realm>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, name FROM realms WHERE name = ? LIMIT 1",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name)| Realm::new(id, name)))
    }

    pub async fn add_user_to_realm(&self, user_id: i64, realm_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO user_realms (user_id, realm_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(realm_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Realms the user is a member of, ordered by name.
    pub async fn user_realms(&self, user_id: i64) -> Result<Vec<Realm>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT r.id, r.name
            FROM realms r
            JOIN user_realms ur ON ur.realm_id = r.id
            WHERE ur.user_id = ?
            ORDER BY LOWER(r.name) ASC, r.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| Realm::new(id, name))
            .collect())
    }

    /// The realm with `realm_id`, only if `user_id` is a member of it.
    pub async fn find_user_realm(
        &self,
        user_id: i64,
        realm_id: i64,
    ) -> Result<Option<Realm>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT r.id, r.name
            FROM realms r
            JOIN user_realms ur ON ur.realm_id = r.id
            WHERE ur.user_id = ? AND r.id = ?
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(realm_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name)| Realm::new(id, name)))
    }

    /// Finds or creates `realm_name` and `email`, and makes the user a member.
    pub async fn bootstrap(
        &self,
        realm_name: &str,
        email: &str,
        user_name: &str,
    ) -> Result<(Realm, User), StoreError> {
        let realm = match self.find_realm_by_name(realm_name).await? {
            Some(realm) => realm,
            None => self.create_realm(realm_name).await?,
        };
        let user = match self.find_user_by_email(email).await? {
            Some(user) => user,
            None => self.create_user(email, user_name, false).await?,
        };
        self.add_user_to_realm(user.id, realm.id).await?;
        Ok((realm, user))
    }

    pub async fn create_authorized_app(
        &self,
        realm_id: i64,
        name: &str,
        api_key_type: ApiKeyType,
    ) -> Result<NewAuthorizedApp, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("app name is required".to_owned()));
        }

        let realm_exists =
            sqlx::query_scalar::<_, i64>("SELECT 1 FROM realms WHERE id = ? LIMIT 1")
                .bind(realm_id)
                .fetch_optional(&self.pool)
                .await?;
        if realm_exists.is_none() {
            return Err(StoreError::NotFound(format!("realm {realm_id}")));
        }

        let api_key = nanoid!(API_KEY_LENGTH);
        let preview = preview_key(&api_key);
        let created_at = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO authorized_apps (
                realm_id,
                name,
                api_key_digest,
                api_key_preview,
                api_key_type,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(realm_id)
        .bind(name)
        .bind(digest_api_key(&api_key))
        .bind(&preview)
        .bind(api_key_type.as_i64())
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(NewAuthorizedApp {
            app: AuthorizedApp {
                id: result.last_insert_rowid(),
                realm_id,
                name: name.to_owned(),
                api_key_preview: preview,
                api_key_type,
                created_at,
                deleted_at: None,
            },
            api_key,
        })
    }

    /// Marks the app as disabled. Disabling twice keeps the first timestamp.
    pub async fn disable_authorized_app(&self, app_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE authorized_apps
            SET deleted_at = COALESCE(deleted_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(app_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("authorized app {app_id}")));
        }
        Ok(())
    }

    /// All apps of the realm, disabled ones included, ordered by name.
    pub async fn list_authorized_apps(
        &self,
        realm_id: i64,
    ) -> Result<Vec<AuthorizedApp>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, realm_id, name, api_key_preview, api_key_type, created_at, deleted_at
            FROM authorized_apps
            WHERE realm_id = ?
            ORDER BY LOWER(name) ASC, id ASC
            "#,
        )
        .bind(realm_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(authorized_app_from_row).collect()
    }

    pub async fn find_authorized_app(
        &self,
        app_id: i64,
    ) -> Result<Option<AuthorizedApp>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, realm_id, name, api_key_preview, api_key_type, created_at, deleted_at
            FROM authorized_apps
            WHERE id = ?
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(authorized_app_from_row).transpose()
    }

    /// Adds `count` to the app's row for `date`.
    pub async fn record_codes_issued(
        &self,
        app_id: i64,
        date: NaiveDate,
        count: u64,
    ) -> Result<(), StoreError> {
        let count = i64::try_from(count)
            .map_err(|_| StoreError::InvalidInput(format!("code count {count} is too large")))?;

        sqlx::query(
            r#"
            INSERT INTO authorized_app_stats (date, authorized_app_id, codes_issued)
            VALUES (?, ?, ?)
            ON CONFLICT (date, authorized_app_id)
            DO UPDATE SET codes_issued = codes_issued + excluded.codes_issued
            "#,
        )
        .bind(date.format(STATS_DATE_FORMAT).to_string())
        .bind(app_id)
        .bind(count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Summary over the 1, 7 and 30 day windows ending on `today`, inclusive.
    pub async fn stats_summary_as_of(
        &self,
        app: &AuthorizedApp,
        realm: &Realm,
        today: NaiveDate,
    ) -> Result<AppStatsSummary, StoreError> {
        if app.realm_id != realm.id {
            return Err(StoreError::AppNotInRealm {
                app_id: app.id,
                realm_id: realm.id,
            });
        }

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN s.date >= ? THEN s.codes_issued ELSE 0 END), 0) AS codes_issued_1d,
                COALESCE(SUM(CASE WHEN s.date >= ? THEN s.codes_issued ELSE 0 END), 0) AS codes_issued_7d,
                COALESCE(SUM(s.codes_issued), 0) AS codes_issued_30d
            FROM authorized_app_stats s
            JOIN authorized_apps a ON a.id = s.authorized_app_id
            WHERE s.authorized_app_id = ?
              AND a.realm_id = ?
              AND s.date >= ?
              AND s.date <= ?
            "#,
        )
        .bind(window_start(today, 1))
        .bind(window_start(today, 7))
        .bind(app.id)
        .bind(realm.id)
        .bind(window_start(today, 30))
        .bind(today.format(STATS_DATE_FORMAT).to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(AppStatsSummary {
            codes_issued_1d: non_negative(row.try_get("codes_issued_1d")?),
            codes_issued_7d: non_negative(row.try_get("codes_issued_7d")?),
            codes_issued_30d: non_negative(row.try_get("codes_issued_30d")?),
        })
    }
}

impl StatsSource for Store {
    async fn load_authorized_apps(&self, realm_id: i64) -> Result<Vec<AuthorizedApp>, StoreError> {
        self.list_authorized_apps(realm_id).await
    }

    async fn authorized_app_stats_summary(
        &self,
        app: &AuthorizedApp,
        realm: &Realm,
    ) -> Result<AppStatsSummary, StoreError> {
        self.stats_summary_as_of(app, realm, Utc::now().date_naive())
            .await
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        system_admin: row.try_get("system_admin")?,
    })
}

fn authorized_app_from_row(row: &SqliteRow) -> Result<AuthorizedApp, StoreError> {
    let raw_type: i64 = row.try_get("api_key_type")?;
    let api_key_type = ApiKeyType::from_i64(raw_type)
        .ok_or_else(|| StoreError::InvalidInput(format!("unknown api_key_type {raw_type}")))?;

    Ok(AuthorizedApp {
        id: row.try_get("id")?,
        realm_id: row.try_get("realm_id")?,
        name: row.try_get("name")?,
        api_key_preview: row.try_get("api_key_preview")?,
        api_key_type,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn conflict_or_database(err: sqlx::Error, what: String) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Conflict(what),
        _ => StoreError::Database(err),
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn window_start(today: NaiveDate, days: u64) -> String {
    today
        .checked_sub_days(Days::new(days.saturating_sub(1)))
        .unwrap_or(NaiveDate::MIN)
        .format(STATS_DATE_FORMAT)
        .to_string()
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn digest_api_key(api_key: &str) -> String {
    format!("{:x}", Sha256::digest(api_key.as_bytes()))
}

fn preview_key(key: &str) -> String {
    let shown = min(API_KEY_PREVIEW_LENGTH, key.len());
    key[..shown].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn stats_summary_sums_trailing_windows() {
        let (_dir, store) = open_store().await;
        let (realm, _user) = store
            .bootstrap("Example Health", "admin@example.com", "Admin")
            .await
            .unwrap();
        let app = store
            .create_authorized_app(realm.id, "Android", ApiKeyType::Device)
            .await
            .unwrap()
            .app;

        let today = day(2024, 3, 31);
        store.record_codes_issued(app.id, today, 5).await.unwrap();
        store
            .record_codes_issued(app.id, day(2024, 3, 28), 7)
            .await
            .unwrap();
        store
            .record_codes_issued(app.id, day(2024, 3, 11), 11)
            .await
            .unwrap();
        // Outside the 30 day window.
        store
            .record_codes_issued(app.id, day(2024, 3, 1), 100)
            .await
            .unwrap();
        // After `today`.
        store
            .record_codes_issued(app.id, day(2024, 4, 1), 1000)
            .await
            .unwrap();

        let summary = store.stats_summary_as_of(&app, &realm, today).await.unwrap();
        assert_eq!(
            summary,
            AppStatsSummary {
                codes_issued_1d: 5,
                codes_issued_7d: 12,
                codes_issued_30d: 23,
            }
        );
    }

    #[tokio::test]
    async fn stats_windows_start_n_minus_one_days_back() {
        let (_dir, store) = open_store().await;
        let (realm, _user) = store
            .bootstrap("Example Health", "admin@example.com", "Admin")
            .await
            .unwrap();
        let app = store
            .create_authorized_app(realm.id, "Android", ApiKeyType::Device)
            .await
            .unwrap()
            .app;

        let today = day(2024, 3, 31);
        for (days_ago, count) in [(1, 1), (6, 10), (7, 100), (29, 1000), (30, 10000)] {
            let date = today.checked_sub_days(Days::new(days_ago)).unwrap();
            store.record_codes_issued(app.id, date, count).await.unwrap();
        }

        let summary = store.stats_summary_as_of(&app, &realm, today).await.unwrap();
        assert_eq!(
            summary,
            AppStatsSummary {
                codes_issued_1d: 0,
                codes_issued_7d: 11,
                codes_issued_30d: 1111,
            }
        );
    }

    #[tokio::test]
    async fn recording_codes_twice_accumulates() {
        let (_dir, store) = open_store().await;
        let realm = store.create_realm("Example Health").await.unwrap();
        let app = store
            .create_authorized_app(realm.id, "iOS", ApiKeyType::Device)
            .await
            .unwrap()
            .app;

        let today = day(2024, 6, 1);
        store.record_codes_issued(app.id, today, 2).await.unwrap();
        store.record_codes_issued(app.id, today, 3).await.unwrap();

        let summary = store.stats_summary_as_of(&app, &realm, today).await.unwrap();
        assert_eq!(summary.codes_issued_1d, 5);
        assert_eq!(summary.codes_issued_30d, 5);
    }

    #[tokio::test]
    async fn stats_summary_without_rows_is_zero() {
        let (_dir, store) = open_store().await;
        let realm = store.create_realm("Example Health").await.unwrap();
        let app = store
            .create_authorized_app(realm.id, "Portal", ApiKeyType::Admin)
            .await
            .unwrap()
            .app;

        let summary = store
            .stats_summary_as_of(&app, &realm, day(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(summary, AppStatsSummary::default());
    }

    #[tokio::test]
    async fn stats_summary_rejects_app_from_other_realm() {
        let (_dir, store) = open_store().await;
        let first = store.create_realm("First").await.unwrap();
        let second = store.create_realm("Second").await.unwrap();
        let app = store
            .create_authorized_app(first.id, "Android", ApiKeyType::Device)
            .await
            .unwrap()
            .app;

        let err = store
            .stats_summary_as_of(&app, &second, day(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::AppNotInRealm { app_id, realm_id } if app_id == app.id && realm_id == second.id
        ));
    }

    #[tokio::test]
    async fn created_app_keeps_only_a_digest_of_its_key() {
        let (_dir, store) = open_store().await;
        let realm = store.create_realm("Example Health").await.unwrap();
        let created = store
            .create_authorized_app(realm.id, "Android", ApiKeyType::Device)
            .await
            .unwrap();

        assert_eq!(created.api_key.len(), API_KEY_LENGTH);
        assert!(created.api_key.starts_with(&created.app.api_key_preview));

        let stored = sqlx::query_scalar::<_, String>(
            "SELECT api_key_digest FROM authorized_apps WHERE id = ?",
        )
        .bind(created.app.id)
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_ne!(stored, created.api_key);
        assert_eq!(stored, digest_api_key(&created.api_key));
    }

    #[tokio::test]
    async fn apps_are_listed_by_name_including_disabled() {
        let (_dir, store) = open_store().await;
        let realm = store.create_realm("Example Health").await.unwrap();
        let zeta = store
            .create_authorized_app(realm.id, "zeta", ApiKeyType::Device)
            .await
            .unwrap()
            .app;
        store
            .create_authorized_app(realm.id, "Alpha", ApiKeyType::Admin)
            .await
            .unwrap();
        store.disable_authorized_app(zeta.id).await.unwrap();

        let apps = store.list_authorized_apps(realm.id).await.unwrap();
        let names: Vec<_> = apps.iter().map(|app| app.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "zeta"]);
        assert!(apps[1].is_disabled());
        assert!(!apps[0].is_disabled());
        assert_eq!(apps[0].api_key_type, ApiKeyType::Admin);
    }

    #[tokio::test]
    async fn realm_reload_is_forced_or_cached() {
        let (_dir, store) = open_store().await;
        let mut realm = store.create_realm("Example Health").await.unwrap();
        store
            .create_authorized_app(realm.id, "Android", ApiKeyType::Device)
            .await
            .unwrap();

        assert!(!realm.has_loaded_apps());
        assert_eq!(
            realm.load_authorized_apps(&store, false).await.unwrap().len(),
            1
        );

        store
            .create_authorized_app(realm.id, "iOS", ApiKeyType::Device)
            .await
            .unwrap();
        assert_eq!(
            realm.load_authorized_apps(&store, false).await.unwrap().len(),
            1
        );
        assert_eq!(
            realm.load_authorized_apps(&store, true).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn duplicate_user_is_a_conflict() {
        let (_dir, store) = open_store().await;
        store
            .create_user("Admin@Example.com", "Admin", false)
            .await
            .unwrap();
        let err = store
            .create_user("admin@example.com ", "Other", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn user_realm_requires_membership() {
        let (_dir, store) = open_store().await;
        let (realm, user) = store
            .bootstrap("Example Health", "admin@example.com", "Admin")
            .await
            .unwrap();
        let other = store.create_realm("Elsewhere").await.unwrap();

        let found = store.find_user_realm(user.id, realm.id).await.unwrap();
        assert_eq!(found.map(|r| r.name), Some("Example Health".to_owned()));
        assert!(
            store
                .find_user_realm(user.id, other.id)
                .await
                .unwrap()
                .is_none()
        );

        // Bootstrapping again reuses both records.
        let (again, same_user) = store
            .bootstrap("Example Health", "admin@example.com", "Admin")
            .await
            .unwrap();
        assert_eq!(again.id, realm.id);
        assert_eq!(same_user.id, user.id);
        assert_eq!(store.user_realms(user.id).await.unwrap().len(), 1);
    }

    #[test]
    fn api_key_type_parses_and_round_trips() {
        assert_eq!("Admin".parse::<ApiKeyType>(), Ok(ApiKeyType::Admin));
        assert_eq!(" device ".parse::<ApiKeyType>(), Ok(ApiKeyType::Device));
        assert!("robot".parse::<ApiKeyType>().is_err());
        assert_eq!(ApiKeyType::from_i64(ApiKeyType::Admin.as_i64()), Some(ApiKeyType::Admin));
        assert_eq!(ApiKeyType::from_i64(7), None);
    }
}
