use log::{error, info, warn};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::api::{ApiUser, RemoteApi, UserLocation};
use crate::error::AppError;

const CREATE_USERS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL UNIQUE,
        location TEXT NOT NULL,
        access_token TEXT NOT NULL,
        switch_input INTEGER NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#;

/// A user bound to one switch. `switch_input` is the BCM number of that switch pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub switch_input: u32,
    pub location: UserLocation,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Keyed by external user id, with a unique secondary key on `switch_input`.
///
/// An upsert for a known id refreshes token and location only; the switch
/// binding is fixed by the first insert.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert(&self, user: &ApiUser, switch_input: u32) -> Result<UpsertOutcome, AppError>;
    async fn find_by_switch_input(&self, switch_input: u32)
    -> Result<Option<UserRecord>, AppError>;
    async fn all(&self) -> Result<Vec<UserRecord>, AppError>;
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Default)]
pub struct MemoryUserStore {
    inner: RwLock<MemoryIndex>,
}

#[derive(Default)]
struct MemoryIndex {
    by_id: FxHashMap<String, UserRecord>,
    by_switch: FxHashMap<u32, String>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn upsert(&self, user: &ApiUser, switch_input: u32) -> Result<UpsertOutcome, AppError> {
        let mut index = self.inner.write();

        if let Some(record) = index.by_id.get_mut(&user.id) {
            record.access_token = user.access_token.clone();
            record.location = user.location.clone();
            record.updated_at = now_rfc3339();
            return Ok(UpsertOutcome::Updated);
        }

        if let Some(owner) = index.by_switch.get(&switch_input) {
            return Err(AppError::Store(format!(
                "switch input {switch_input} is already bound to user {owner}"
            )));
        }

        let now = now_rfc3339();
        index.by_switch.insert(switch_input, user.id.clone());
        index.by_id.insert(
            user.id.clone(),
            UserRecord {
                user_id: user.id.clone(),
                switch_input,
                location: user.location.clone(),
                access_token: user.access_token.clone(),
                created_at: now.clone(),
                updated_at: now,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_by_switch_input(
        &self,
        switch_input: u32,
    ) -> Result<Option<UserRecord>, AppError> {
        let index = self.inner.read();
        Ok(index
            .by_switch
            .get(&switch_input)
            .and_then(|id| index.by_id.get(id))
            .cloned())
    }

    async fn all(&self) -> Result<Vec<UserRecord>, AppError> {
        let mut users: Vec<UserRecord> = self.inner.read().by_id.values().cloned().collect();
        users.sort_by_key(|u| u.switch_input);
        Ok(users)
    }
}

pub struct SqliteUserStore(SqlitePool);

impl SqliteUserStore {
    /// Opens (creating if needed) the database and ensures the `users` table exists.
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // every connection to an in-memory database is a separate database
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };

        sqlx::query(CREATE_USERS_TABLE).execute(&pool).await?;
        Ok(Self(pool))
    }

    pub fn borrow_pool(&self) -> &SqlitePool {
        &self.0
    }

    fn record_from_row(row: &SqliteRow) -> Result<UserRecord, AppError> {
        let location: String = row.try_get("location")?;
        let location: UserLocation = serde_json::from_str(&location)
            .map_err(|e| AppError::Store(format!("could not decode stored location: {e}")))?;
        let switch_input: i64 = row.try_get("switch_input")?;

        Ok(UserRecord {
            user_id: row.try_get("user_id")?,
            switch_input: u32::try_from(switch_input)
                .map_err(|_| AppError::Store(format!("invalid switch input {switch_input}")))?,
            location,
            access_token: row.try_get("access_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn upsert(&self, user: &ApiUser, switch_input: u32) -> Result<UpsertOutcome, AppError> {
        let location = serde_json::to_string(&user.location)
            .map_err(|e| AppError::Store(format!("could not encode location: {e}")))?;
        let now = now_rfc3339();

        let mut tx = self.0.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM users WHERE user_id = ?;")
            .bind(&user.id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        if exists {
            sqlx::query(
                "UPDATE users SET access_token = ?, location = ?, updated_at = ? WHERE user_id = ?;",
            )
            .bind(&user.access_token)
            .bind(&location)
            .bind(&now)
            .bind(&user.id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"INSERT INTO users (user_id, location, access_token, switch_input, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?);"#,
            )
            .bind(&user.id)
            .bind(&location)
            .bind(&user.access_token)
            .bind(i64::from(switch_input))
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn find_by_switch_input(
        &self,
        switch_input: u32,
    ) -> Result<Option<UserRecord>, AppError> {
        let row = sqlx::query("SELECT * FROM users WHERE switch_input = ?;")
            .bind(i64::from(switch_input))
            .fetch_optional(&self.0)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn all(&self) -> Result<Vec<UserRecord>, AppError> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY switch_input;")
            .fetch_all(&self.0)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }
}

/// `memory` selects the plain in-process store; anything else is a SQLite URL.
pub async fn open_store(database_url: &str) -> Result<Arc<dyn UserStore>, AppError> {
    if database_url.eq_ignore_ascii_case("memory") {
        info!("Using in-memory user store");
        return Ok(Arc::new(MemoryUserStore::default()));
    }
    info!("Using SQLite user store at {database_url}");
    Ok(Arc::new(SqliteUserStore::connect(database_url).await?))
}

pub struct UserDirectory {
    store: Arc<dyn UserStore>,
    api: Arc<dyn RemoteApi>,
    switch_pins: Vec<u32>,
    production: bool,
}

impl UserDirectory {
    pub fn new(
        store: Arc<dyn UserStore>,
        api: Arc<dyn RemoteApi>,
        switch_pins: Vec<u32>,
        production: bool,
    ) -> Self {
        Self {
            store,
            api,
            switch_pins,
            production,
        }
    }

    /// Pulls the user list and binds the i-th user to the i-th switch pin.
    ///
    /// Binding follows fetch order, so a reordered API response would bind
    /// newcomers to whatever pins are still free. Existing bindings are
    /// never moved. Returns the number of users stored; failures are logged
    /// and count as zero.
    pub async fn sync(&self) -> usize {
        info!("Fetching users from API...");
        let response = match self.api.fetch_users().await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to fetch users: {e}");
                return 0;
            }
        };

        if response.users.is_empty() {
            error!("Invalid API response format: no users");
            return 0;
        }
        info!("Received {} users from API", response.users.len());
        if response.users.len() > self.switch_pins.len() {
            warn!(
                "{} users fetched but only {} switches configured; extra users ignored",
                response.users.len(),
                self.switch_pins.len()
            );
        }

        let mut synced = 0;
        for (user, pin) in response.users.iter().zip(self.switch_pins.iter()) {
            match self.upsert_user(user, *pin).await {
                Ok(_) => synced += 1,
                Err(e) => error!("Failed to store user {}: {e}", user.id),
            }
        }
        info!("Users synchronized: {synced}");

        if !self.production {
            match self.store.all().await {
                Ok(users) => {
                    for u in users {
                        info!(
                            "  user {} -> switch GPIO {} ({} #{})",
                            u.user_id, u.switch_input, u.location.name, u.location.number
                        );
                    }
                }
                Err(e) => warn!("Could not list stored users: {e}"),
            }
        }
        synced
    }

    pub async fn upsert_user(
        &self,
        user: &ApiUser,
        switch_input: u32,
    ) -> Result<UpsertOutcome, AppError> {
        let outcome = self.store.upsert(user, switch_input).await?;
        info!("User {} synchronized ({outcome:?})", user.id);
        Ok(outcome)
    }

    pub async fn get_user(&self, switch_input: u32) -> Result<Option<UserRecord>, AppError> {
        self.store.find_by_switch_input(switch_input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeApi, api_user};

    async fn stores() -> Vec<(&'static str, Arc<dyn UserStore>)> {
        vec![
            ("memory", Arc::new(MemoryUserStore::default())),
            (
                "sqlite",
                Arc::new(SqliteUserStore::connect("sqlite::memory:").await.unwrap()),
            ),
        ]
    }

    #[tokio::test]
    async fn upsert_keeps_switch_binding() {
        for (name, store) in stores().await {
            let first = api_user("u1", "tok-1", 1);
            assert_eq!(store.upsert(&first, 2).await.unwrap(), UpsertOutcome::Inserted);

            let mut refreshed = api_user("u1", "tok-2", 7);
            refreshed.location.name = "Moved".into();
            assert_eq!(
                store.upsert(&refreshed, 3).await.unwrap(),
                UpsertOutcome::Updated,
                "{name}"
            );

            let rec = store.find_by_switch_input(2).await.unwrap().expect(name);
            assert_eq!(rec.user_id, "u1");
            assert_eq!(rec.access_token, "tok-2", "{name}");
            assert_eq!(rec.location.name, "Moved", "{name}");
            assert_eq!(rec.location.number, 7, "{name}");
            assert!(store.find_by_switch_input(3).await.unwrap().is_none(), "{name}");
            assert_eq!(store.all().await.unwrap().len(), 1, "{name}");
        }
    }

    #[tokio::test]
    async fn switch_input_is_unique() {
        for (name, store) in stores().await {
            store.upsert(&api_user("u1", "a", 1), 2).await.unwrap();
            let err = store.upsert(&api_user("u2", "b", 2), 2).await.unwrap_err();
            assert!(matches!(err, AppError::Store(_)), "{name}");

            let rec = store.find_by_switch_input(2).await.unwrap().unwrap();
            assert_eq!(rec.user_id, "u1", "{name}");
        }
    }

    #[tokio::test]
    async fn missing_user_is_none() {
        for (name, store) in stores().await {
            assert!(store.find_by_switch_input(27).await.unwrap().is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_pool_handles() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("users.db").display());

        {
            let store = SqliteUserStore::connect(&url).await.unwrap();
            store.upsert(&api_user("u9", "tok", 4), 17).await.unwrap();
            store.borrow_pool().close().await;
        }

        let store = SqliteUserStore::connect(&url).await.unwrap();
        let rec = store.find_by_switch_input(17).await.unwrap().unwrap();
        assert_eq!(rec.user_id, "u9");
        assert_eq!(rec.location.number, 4);
    }

    #[tokio::test]
    async fn sync_binds_users_positionally() {
        let api = Arc::new(FakeApi::with_users(vec![
            api_user("a", "ta", 1),
            api_user("b", "tb", 2),
            api_user("c", "tc", 3),
        ]));
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::default());
        let dir = UserDirectory::new(store.clone(), api, vec![2, 3, 4, 17, 27], false);

        assert_eq!(dir.sync().await, 3);

        let users = store.all().await.unwrap();
        let bindings: Vec<(String, u32)> = users
            .iter()
            .map(|u| (u.user_id.clone(), u.switch_input))
            .collect();
        assert_eq!(
            bindings,
            vec![("a".into(), 2), ("b".into(), 3), ("c".into(), 4)]
        );
        assert!(dir.get_user(17).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_binds_one_user_per_switch_when_counts_match() {
        let pins = vec![2, 3, 4, 17, 27];
        let fetched: Vec<ApiUser> = ["e", "d", "c", "b", "a"]
            .iter()
            .zip(1..)
            .map(|(id, n)| api_user(id, &format!("t{id}"), n))
            .collect();
        let api = Arc::new(FakeApi::with_users(fetched));
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::default());
        let dir = UserDirectory::new(store.clone(), api, pins.clone(), false);

        assert_eq!(dir.sync().await, 5);

        for (pin, id) in pins.iter().zip(["e", "d", "c", "b", "a"]) {
            let user = dir.get_user(*pin).await.unwrap().unwrap();
            assert_eq!(user.user_id, id);
        }
        let inputs: Vec<u32> = store
            .all()
            .await
            .unwrap()
            .iter()
            .map(|u| u.switch_input)
            .collect();
        assert_eq!(inputs, pins);
    }

    #[tokio::test]
    async fn sync_ignores_users_beyond_switch_count() {
        let api = Arc::new(FakeApi::with_users(vec![
            api_user("a", "ta", 1),
            api_user("b", "tb", 2),
            api_user("c", "tc", 3),
        ]));
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::default());
        let dir = UserDirectory::new(store.clone(), api, vec![5, 6], true);

        assert_eq!(dir.sync().await, 2);
        assert_eq!(store.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resync_refreshes_tokens_without_rebinding() {
        let api = Arc::new(FakeApi::with_users(vec![
            api_user("a", "ta", 1),
            api_user("b", "tb", 2),
        ]));
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::default());
        let dir = UserDirectory::new(store.clone(), api.clone(), vec![2, 3], false);
        dir.sync().await;

        // API now returns the same users in reverse order with new tokens
        api.set_users(vec![api_user("b", "tb2", 2), api_user("a", "ta2", 1)]);
        assert_eq!(dir.sync().await, 2);

        let a = dir.get_user(2).await.unwrap().unwrap();
        assert_eq!((a.user_id.as_str(), a.access_token.as_str()), ("a", "ta2"));
        let b = dir.get_user(3).await.unwrap().unwrap();
        assert_eq!((b.user_id.as_str(), b.access_token.as_str()), ("b", "tb2"));
    }

    #[tokio::test]
    async fn failed_or_empty_fetch_syncs_nothing() {
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::default());

        let api = Arc::new(FakeApi::failing_fetch(AppError::ApiRequestFailed {
            status: Some(500),
            message: "boom".into(),
        }));
        let dir = UserDirectory::new(store.clone(), api, vec![2, 3], false);
        assert_eq!(dir.sync().await, 0);

        let api = Arc::new(FakeApi::with_users(vec![]));
        let dir = UserDirectory::new(store.clone(), api, vec![2, 3], false);
        assert_eq!(dir.sync().await, 0);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_store_selects_backend() {
        let store = open_store("memory").await.unwrap();
        store.upsert(&api_user("m", "t", 1), 2).await.unwrap();
        assert!(store.find_by_switch_input(2).await.unwrap().is_some());

        let store = open_store("sqlite::memory:").await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }
}
