use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use tracing;

use crate::db::{get_connection, DbPool};
use crate::error::StorageError;
use crate::schema::relay_device_tokens;
use crate::token_store::TokenStore;
use crate::types::{DeviceToken, Platform};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = relay_device_tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DeviceTokenRow {
    token: String,
    user_id: String,
    device_id: Option<String>,
    platform: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DeviceTokenRow> for DeviceToken {
    fn from(row: DeviceTokenRow) -> Self {
        let platform = row.platform.as_deref().and_then(|p| match p.parse::<Platform>() {
            Ok(platform) => Some(platform),
            Err(e) => {
                tracing::warn!("Ignoring stored platform for token row: {}", e);
                None
            }
        });

        DeviceToken {
            token: row.token,
            user_id: row.user_id,
            device_id: row.device_id,
            platform,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = relay_device_tokens)]
struct NewDeviceToken<'a> {
    token: &'a str,
    user_id: &'a str,
    device_id: Option<&'a str>,
    platform: Option<&'a str>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

type UserRows<'a> = dsl::Filter<relay_device_tokens::table, dsl::Eq<relay_device_tokens::user_id, &'a str>>;
type DeviceRows<'a> = dsl::Filter<UserRows<'a>, dsl::Eq<relay_device_tokens::device_id, &'a str>>;
type StaleDeviceRows<'a> = dsl::Filter<DeviceRows<'a>, dsl::NotEq<relay_device_tokens::token, &'a str>>;
type OwnedTokenRows<'a> = dsl::Filter<UserRows<'a>, dsl::Eq<relay_device_tokens::token, &'a str>>;

fn user_rows(user_id: &str) -> UserRows<'_> {
    relay_device_tokens::table.filter(relay_device_tokens::user_id.eq(user_id))
}

fn device_rows<'a>(user_id: &'a str, device_id: &'a str) -> DeviceRows<'a> {
    user_rows(user_id).filter(relay_device_tokens::device_id.eq(device_id))
}

/// Tokens the user registered for `device_id` other than `keep`.
fn stale_device_rows<'a>(user_id: &'a str, device_id: &'a str, keep: &'a str) -> StaleDeviceRows<'a> {
    device_rows(user_id, device_id).filter(relay_device_tokens::token.ne(keep))
}

fn owned_token_rows<'a>(user_id: &'a str, token: &'a str) -> OwnedTokenRows<'a> {
    user_rows(user_id).filter(relay_device_tokens::token.eq(token))
}

/// Insert keyed by token; a conflicting row takes the new owner, device and
/// platform but keeps its `created_at`.
macro_rules! upsert_device_token {
    ($new:expr) => {
        diesel::insert_into(relay_device_tokens::table)
            .values($new)
            .on_conflict(relay_device_tokens::token)
            .do_update()
            .set((
                relay_device_tokens::user_id.eq(excluded(relay_device_tokens::user_id)),
                relay_device_tokens::device_id.eq(excluded(relay_device_tokens::device_id)),
                relay_device_tokens::platform.eq(excluded(relay_device_tokens::platform)),
                relay_device_tokens::updated_at.eq(excluded(relay_device_tokens::updated_at)),
            ))
            .returning(DeviceTokenRow::as_returning())
    };
}

/// `TokenStore` over the `relay_device_tokens` Postgres table.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: Arc<DbPool>,
}

impl PgTokenStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn register(
        &self,
        user_id: &str,
        token: &str,
        device_id: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<DeviceToken, StorageError> {
        let mut conn = get_connection(&self.pool).await?;
        let now = Utc::now();
        let new = NewDeviceToken {
            token,
            user_id,
            device_id,
            platform: platform.as_ref().map(Platform::as_str),
            created_at: now,
            updated_at: now,
        };

        // Upsert and same-device replacement commit together or not at all.
        let (row, replaced) = conn
            .transaction::<_, StorageError, _>(|conn| {
                async move {
                    let row: DeviceTokenRow = upsert_device_token!(new).get_result(conn).await?;

                    let replaced = match device_id {
                        Some(device_id) => {
                            diesel::delete(stale_device_rows(user_id, device_id, token))
                                .execute(conn)
                                .await?
                        }
                        None => 0,
                    };

                    Ok((row, replaced))
                }
                .scope_boxed()
            })
            .await?;

        if replaced > 0 {
            tracing::debug!("Replaced {} stale token(s) for user {}", replaced, user_id);
        }

        Ok(row.into())
    }

    async fn list_tokens(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let tokens = user_rows(user_id)
            .select(relay_device_tokens::token)
            .load::<String>(&mut conn)
            .await?;

        Ok(tokens)
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceToken>, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let rows = user_rows(user_id)
            .order(relay_device_tokens::updated_at.desc())
            .select(DeviceTokenRow::as_select())
            .load::<DeviceTokenRow>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(DeviceToken::from).collect())
    }

    async fn remove_token(&self, token: &str) -> Result<usize, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let removed = diesel::delete(
            relay_device_tokens::table.filter(relay_device_tokens::token.eq(token)),
        )
        .execute(&mut conn)
        .await?;

        Ok(removed)
    }

    async fn remove_owned_token(&self, user_id: &str, token: &str) -> Result<usize, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let removed = diesel::delete(owned_token_rows(user_id, token))
            .execute(&mut conn)
            .await?;

        Ok(removed)
    }

    async fn remove_all_for_user(&self, user_id: &str) -> Result<usize, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let removed = diesel::delete(user_rows(user_id)).execute(&mut conn).await?;

        Ok(removed)
    }

    async fn remove_for_device(&self, user_id: &str, device_id: &str) -> Result<usize, StorageError> {
        let mut conn = get_connection(&self.pool).await?;

        let removed = diesel::delete(device_rows(user_id, device_id))
            .execute(&mut conn)
            .await?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::create_pool;
    use diesel::debug_query;
    use diesel::pg::Pg;

    #[test]
    fn upsert_reassigns_owner_on_conflict() {
        let now = Utc::now();
        let query = upsert_device_token!(NewDeviceToken {
            token: "tok-1",
            user_id: "bob",
            device_id: Some("phone"),
            platform: Some("ios"),
            created_at: now,
            updated_at: now,
        });
        let sql = debug_query::<Pg, _>(&query).to_string();

        assert!(sql.contains(r#"ON CONFLICT ("token") DO UPDATE SET"#), "{}", sql);
        assert!(sql.contains(r#""user_id" = excluded."user_id""#), "{}", sql);
        assert!(sql.contains(r#""device_id" = excluded."device_id""#), "{}", sql);
        assert!(sql.contains(r#""platform" = excluded."platform""#), "{}", sql);
        assert!(!sql.contains(r#""created_at" = excluded"#), "{}", sql);
        assert!(sql.contains("RETURNING"), "{}", sql);
    }

    #[test]
    fn device_delete_is_scoped_to_user_and_device() {
        let sql = debug_query::<Pg, _>(&diesel::delete(device_rows("alice", "phone"))).to_string();

        assert!(sql.starts_with(r#"DELETE FROM "relay_device_tokens""#), "{}", sql);
        assert!(sql.contains(r#""relay_device_tokens"."user_id" = $1"#), "{}", sql);
        assert!(sql.contains(r#""relay_device_tokens"."device_id" = $2"#), "{}", sql);
        assert!(!sql.contains(r#""relay_device_tokens"."token""#), "{}", sql);
        assert!(sql.contains(r#""alice""#) && sql.contains(r#""phone""#), "{}", sql);
    }

    #[test]
    fn replacement_delete_keeps_the_new_token() {
        let sql = debug_query::<Pg, _>(&diesel::delete(stale_device_rows("alice", "phone", "tok-new")))
            .to_string();

        assert!(sql.contains(r#""relay_device_tokens"."user_id" = $1"#), "{}", sql);
        assert!(sql.contains(r#""relay_device_tokens"."device_id" = $2"#), "{}", sql);
        assert!(sql.contains(r#""relay_device_tokens"."token" != $3"#), "{}", sql);
        assert!(sql.contains(r#""tok-new""#), "{}", sql);
    }

    #[test]
    fn owned_delete_filters_on_user_and_token() {
        let sql = debug_query::<Pg, _>(&diesel::delete(owned_token_rows("alice", "tok-1"))).to_string();

        assert!(sql.contains(r#""relay_device_tokens"."user_id" = $1"#), "{}", sql);
        assert!(sql.contains(r#""relay_device_tokens"."token" = $2"#), "{}", sql);
    }

    #[tokio::test]
    #[ignore = "needs a migrated Postgres at DATABASE_URL"]
    async fn postgres_store_transfers_ownership_and_scopes_device_deletes() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = create_pool(&DatabaseConfig { url, max_connections: 2 }).await.unwrap();
        let store = PgTokenStore::new(pool);

        let run = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = format!("alice-{}", run);
        let bob = format!("bob-{}", run);
        let shared = format!("shared-{}", run);
        let phone_old = format!("phone-old-{}", run);
        let phone_new = format!("phone-new-{}", run);
        let laptop = format!("laptop-{}", run);

        store.register(&alice, &shared, None, Some(Platform::Web)).await.unwrap();
        let row = store.register(&bob, &shared, None, Some(Platform::Ios)).await.unwrap();
        assert_eq!(row.user_id, bob);
        assert!(store.list_tokens(&alice).await.unwrap().is_empty());
        assert_eq!(store.list_tokens(&bob).await.unwrap(), vec![shared.clone()]);

        store.register(&alice, &phone_old, Some("phone"), None).await.unwrap();
        store.register(&alice, &laptop, Some("laptop"), None).await.unwrap();
        store.register(&alice, &phone_new, Some("phone"), None).await.unwrap();
        let mut tokens = store.list_tokens(&alice).await.unwrap();
        tokens.sort();
        assert_eq!(tokens, vec![laptop.clone(), phone_new.clone()]);

        store.register(&bob, &format!("bob-phone-{}", run), Some("phone"), None).await.unwrap();
        assert_eq!(store.remove_for_device(&alice, "phone").await.unwrap(), 1);
        assert_eq!(store.list_tokens(&alice).await.unwrap(), vec![laptop.clone()]);
        assert_eq!(store.list_tokens(&bob).await.unwrap().len(), 2);

        assert_eq!(store.remove_owned_token(&alice, &shared).await.unwrap(), 0);

        store.remove_all_for_user(&alice).await.unwrap();
        store.remove_all_for_user(&bob).await.unwrap();
    }
}
