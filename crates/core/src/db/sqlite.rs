use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::Result;
use crate::models::{
    application_instance::{ApplicationInstance, LtiRegistration, NewApplicationInstance, Settings},
    assignment::{Assignment, AssignmentUpsert},
    family::Family,
    file::{File, FileType, ListedFile},
    grading_info::{GradingInfo, GradingInfoUpsert},
    grouping::{Grouping, GroupingMembership, GroupingType},
    lms::{LegacyCourse, LmsCourse, LmsUser},
    oauth2_token::{JwtOAuth2Token, OAuth2Token, Service, TokenGrant, TokenKey},
};

use super::repository::{
    ApplicationInstanceRepository, AssignmentRepository, FileRepository, GradingInfoRepository,
    GroupingRepository, GroupingUpsert, JwtOAuth2TokenRepository, LegacyCourseRepository,
    LmsCourseRepository, LmsUserRepository, LtiRegistrationRepository, MarginRepository,
    OAuth2TokenRepository,
};

type SharedTx = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

/// SQLite-backed repository.
///
/// A repository from [`SqliteRepository::new`] runs every query on a pooled
/// connection. One from [`SqliteRepository::begin`] runs every query inside
/// a single transaction until [`commit`](SqliteRepository::commit) or
/// [`rollback`](SqliteRepository::rollback) is called. Clones share the
/// same transaction.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
    tx: Option<SharedTx>,
}

/// A connection to run one repository call on.
enum Conn<'a> {
    Pooled(PoolConnection<Sqlite>),
    Tx(MappedMutexGuard<'a, Transaction<'static, Sqlite>>),
}

impl Deref for Conn<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            Conn::Pooled(c) => &**c,
            Conn::Tx(t) => &***t,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            Conn::Pooled(c) => &mut **c,
            Conn::Tx(t) => &mut ***t,
        }
    }
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, tx: None }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// A repository over the same pool that is not bound to any transaction.
    pub fn pooled(&self) -> Self {
        Self::new(self.pool.clone())
    }

    /// Start a transaction and return a repository bound to it.
    pub async fn begin(&self) -> Result<Self> {
        let tx = self.pool.begin().await?;
        Ok(Self {
            pool: self.pool.clone(),
            tx: Some(Arc::new(Mutex::new(Some(tx)))),
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Commit the bound transaction. A no-op for pooled repositories or when
    /// the transaction has already finished.
    pub async fn commit(&self) -> Result<()> {
        if let Some(shared) = &self.tx {
            if let Some(tx) = shared.lock().await.take() {
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Roll back the bound transaction, if any.
    pub async fn rollback(&self) -> Result<()> {
        if let Some(shared) = &self.tx {
            if let Some(tx) = shared.lock().await.take() {
                tx.rollback().await?;
            }
        }
        Ok(())
    }

    async fn conn(&self) -> Result<Conn<'_>> {
        match &self.tx {
            None => Ok(Conn::Pooled(self.pool.acquire().await?)),
            Some(shared) => {
                let guard = shared.lock().await;
                MutexGuard::try_map(guard, |tx| tx.as_mut())
                    .map(Conn::Tx)
                    .map_err(|_| {
                        sqlx::Error::Protocol("transaction already finished".into()).into()
                    })
            }
        }
    }
}

impl MarginRepository for SqliteRepository {}

// -- Helper functions for converting DB values --

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn datetime_to_str(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn now_str() -> String {
    datetime_to_str(&Utc::now())
}

fn parse_json_map(s: &str) -> Map<String, Value> {
    match serde_json::from_str(s) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn json_map_to_str(map: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

fn row_to_registration(r: &SqliteRow) -> LtiRegistration {
    LtiRegistration {
        id: r.get("id"),
        issuer: r.get("issuer"),
        client_id: r.get("client_id"),
        auth_login_url: r.get("auth_login_url"),
        key_set_url: r.get("key_set_url"),
        token_url: r.get("token_url"),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    }
}

fn row_to_instance(r: &SqliteRow) -> ApplicationInstance {
    ApplicationInstance {
        id: r.get("id"),
        consumer_key: r.get("consumer_key"),
        shared_secret: r.get("shared_secret"),
        lti_registration_id: r.get("lti_registration_id"),
        deployment_id: r.get("deployment_id"),
        tool_consumer_instance_guid: r.get("tool_consumer_instance_guid"),
        lms_url: r.get("lms_url"),
        family: Family::parse(r.get("family")),
        provisioning: r.get::<i64, _>("provisioning") != 0,
        settings: Settings(parse_json_map(r.get("settings"))),
        developer_key: r.get("developer_key"),
        developer_secret: r.get("developer_secret"),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    }
}

fn row_to_lms_user(r: &SqliteRow) -> LmsUser {
    LmsUser {
        id: r.get("id"),
        application_instance_id: r.get("application_instance_id"),
        user_id: r.get("user_id"),
        h_userid: r.get("h_userid"),
        display_name: r.get("display_name"),
        email: r.get("email"),
        roles: r.get("roles"),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    }
}

fn row_to_grouping(r: &SqliteRow) -> Grouping {
    Grouping {
        id: r.get("id"),
        application_instance_id: r.get("application_instance_id"),
        authority_provided_id: r.get("authority_provided_id"),
        lms_id: r.get("lms_id"),
        lms_name: r.get("lms_name"),
        parent_id: r.get("parent_id"),
        grouping_type: GroupingType::parse(r.get("type")).unwrap_or(GroupingType::Course),
        settings: Settings(parse_json_map(r.get("settings"))),
        extra: parse_json_map(r.get("extra")),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    }
}

fn row_to_oauth2_token(r: &SqliteRow) -> Option<OAuth2Token> {
    Some(OAuth2Token {
        id: r.get("id"),
        application_instance_id: r.get("application_instance_id"),
        user_id: r.get("user_id"),
        service: Service::parse(r.get("service"))?,
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        expires_in: r.get("expires_in"),
        received_at: parse_datetime(r.get("received_at")),
    })
}

fn row_to_assignment(r: &SqliteRow) -> Assignment {
    Assignment {
        id: r.get("id"),
        tool_consumer_instance_guid: r.get("tool_consumer_instance_guid"),
        resource_link_id: r.get("resource_link_id"),
        document_url: r.get("document_url"),
        title: r.get("title"),
        group_set_id: r.get("group_set_id"),
        lis_outcome_service_url: r.get("lis_outcome_service_url"),
        lineitem: r.get("lineitem"),
        extra: parse_json_map(r.get("extra")),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    }
}

fn row_to_file(r: &SqliteRow) -> Option<File> {
    Some(File {
        id: r.get("id"),
        application_instance_id: r.get("application_instance_id"),
        file_type: FileType::parse(r.get("type"))?,
        lms_id: r.get("lms_id"),
        course_id: r.get("course_id"),
        name: r.get("name"),
        size: r.get("size"),
        created: parse_datetime(r.get("created")),
        updated: parse_datetime(r.get("updated")),
    })
}

// -- LtiRegistrationRepository --

#[async_trait]
impl LtiRegistrationRepository for SqliteRepository {
    async fn create_lti_registration(
        &self,
        issuer: &str,
        client_id: &str,
        auth_login_url: &str,
        key_set_url: &str,
        token_url: &str,
    ) -> Result<LtiRegistration> {
        let mut conn = self.conn().await?;
        let now = now_str();
        let result = sqlx::query(
            "INSERT INTO lti_registration (issuer, client_id, auth_login_url, key_set_url, token_url, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(issuer)
        .bind(client_id)
        .bind(auth_login_url)
        .bind(key_set_url)
        .bind(token_url)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT * FROM lti_registration WHERE id = ?1")
            .bind(result.last_insert_rowid())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row_to_registration(&row))
    }

    async fn get_lti_registration(&self, id: i64) -> Result<Option<LtiRegistration>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT * FROM lti_registration WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(row_to_registration))
    }

    async fn find_lti_registration(
        &self,
        issuer: &str,
        client_id: &str,
    ) -> Result<Option<LtiRegistration>> {
        let mut conn = self.conn().await?;
        let row =
            sqlx::query("SELECT * FROM lti_registration WHERE issuer = ?1 AND client_id = ?2")
                .bind(issuer)
                .bind(client_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.as_ref().map(row_to_registration))
    }

    async fn list_lti_registrations_by_issuer(
        &self,
        issuer: &str,
    ) -> Result<Vec<LtiRegistration>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query("SELECT * FROM lti_registration WHERE issuer = ?1 ORDER BY id")
            .bind(issuer)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.iter().map(row_to_registration).collect())
    }
}

// -- ApplicationInstanceRepository --

#[async_trait]
impl ApplicationInstanceRepository for SqliteRepository {
    async fn create_application_instance(
        &self,
        new: &NewApplicationInstance,
    ) -> Result<ApplicationInstance> {
        let mut conn = self.conn().await?;
        let now = now_str();
        let result = sqlx::query(
            "INSERT INTO application_instance (consumer_key, shared_secret, lti_registration_id, deployment_id, lms_url, family, provisioning, settings, developer_key, developer_secret, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        )
        .bind(&new.consumer_key)
        .bind(&new.shared_secret)
        .bind(new.lti_registration_id)
        .bind(&new.deployment_id)
        .bind(&new.lms_url)
        .bind(new.family.as_str())
        .bind(new.provisioning as i64)
        .bind(json_map_to_str(&new.settings.0)?)
        .bind(&new.developer_key)
        .bind(&new.developer_secret)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT * FROM application_instance WHERE id = ?1")
            .bind(result.last_insert_rowid())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row_to_instance(&row))
    }

    async fn get_application_instance(&self, id: i64) -> Result<Option<ApplicationInstance>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT * FROM application_instance WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(row_to_instance))
    }

    async fn get_application_instance_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> Result<Option<ApplicationInstance>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT * FROM application_instance WHERE consumer_key = ?1")
            .bind(consumer_key)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(row_to_instance))
    }

    async fn get_application_instance_by_deployment(
        &self,
        lti_registration_id: i64,
        deployment_id: &str,
    ) -> Result<Option<ApplicationInstance>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM application_instance WHERE lti_registration_id = ?1 AND deployment_id = ?2",
        )
        .bind(lti_registration_id)
        .bind(deployment_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.as_ref().map(row_to_instance))
    }

    async fn update_application_instance_settings(
        &self,
        id: i64,
        settings: &Settings,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query("UPDATE application_instance SET settings = ?1, updated = ?2 WHERE id = ?3")
            .bind(json_map_to_str(&settings.0)?)
            .bind(now_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn count_application_instances(&self) -> Result<i64> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM application_instance")
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get("n"))
    }
}

// -- LmsUserRepository --

#[async_trait]
impl LmsUserRepository for SqliteRepository {
    async fn upsert_lms_user(
        &self,
        application_instance_id: i64,
        user_id: &str,
        h_userid: &str,
        display_name: Option<&str>,
        email: Option<&str>,
        roles: &str,
    ) -> Result<LmsUser> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO lms_user (application_instance_id, user_id, h_userid, display_name, email, roles, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(application_instance_id, user_id) DO UPDATE SET
                h_userid = excluded.h_userid,
                display_name = excluded.display_name,
                email = COALESCE(excluded.email, lms_user.email),
                roles = excluded.roles,
                updated = excluded.updated",
        )
        .bind(application_instance_id)
        .bind(user_id)
        .bind(h_userid)
        .bind(display_name)
        .bind(email)
        .bind(roles)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;

        let row =
            sqlx::query("SELECT * FROM lms_user WHERE application_instance_id = ?1 AND user_id = ?2")
                .bind(application_instance_id)
                .bind(user_id)
                .fetch_one(&mut *conn)
                .await?;
        Ok(row_to_lms_user(&row))
    }

    async fn get_lms_user(
        &self,
        application_instance_id: i64,
        user_id: &str,
    ) -> Result<Option<LmsUser>> {
        let mut conn = self.conn().await?;
        let row =
            sqlx::query("SELECT * FROM lms_user WHERE application_instance_id = ?1 AND user_id = ?2")
                .bind(application_instance_id)
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.as_ref().map(row_to_lms_user))
    }
}

// -- GroupingRepository --

#[async_trait]
impl GroupingRepository for SqliteRepository {
    async fn upsert_grouping(&self, g: &GroupingUpsert<'_>) -> Result<Grouping> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO grouping (application_instance_id, authority_provided_id, lms_id, lms_name, parent_id, type, settings, extra, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(authority_provided_id) DO UPDATE SET
                lms_name = excluded.lms_name,
                extra = json_patch(grouping.extra, excluded.extra),
                updated = excluded.updated",
        )
        .bind(g.application_instance_id)
        .bind(g.authority_provided_id)
        .bind(g.lms_id)
        .bind(g.lms_name)
        .bind(g.parent_id)
        .bind(g.grouping_type.as_str())
        .bind(json_map_to_str(&g.settings.0)?)
        .bind(json_map_to_str(g.extra)?)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT * FROM grouping WHERE authority_provided_id = ?1")
            .bind(g.authority_provided_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row_to_grouping(&row))
    }

    async fn get_grouping_by_authority_provided_id(
        &self,
        authority_provided_id: &str,
    ) -> Result<Option<Grouping>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT * FROM grouping WHERE authority_provided_id = ?1")
            .bind(authority_provided_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(row_to_grouping))
    }

    async fn list_child_groupings(
        &self,
        parent_id: i64,
        grouping_type: GroupingType,
    ) -> Result<Vec<Grouping>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(
            "SELECT * FROM grouping WHERE parent_id = ?1 AND type = ?2 ORDER BY lms_name, id",
        )
        .bind(parent_id)
        .bind(grouping_type.as_str())
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.iter().map(row_to_grouping).collect())
    }

    async fn set_grouping_extra(&self, id: i64, extra: &Map<String, Value>) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query("UPDATE grouping SET extra = ?1, updated = ?2 WHERE id = ?3")
            .bind(json_map_to_str(extra)?)
            .bind(now_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn upsert_grouping_membership(
        &self,
        grouping_id: i64,
        lms_user_id: i64,
        roles: &str,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO grouping_membership (grouping_id, lms_user_id, roles, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(grouping_id, lms_user_id) DO UPDATE SET
                roles = excluded.roles,
                updated = excluded.updated",
        )
        .bind(grouping_id)
        .bind(lms_user_id)
        .bind(roles)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn list_grouping_memberships(
        &self,
        grouping_id: i64,
    ) -> Result<Vec<GroupingMembership>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(
            "SELECT * FROM grouping_membership WHERE grouping_id = ?1 ORDER BY lms_user_id",
        )
        .bind(grouping_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows
            .iter()
            .map(|r| GroupingMembership {
                grouping_id: r.get("grouping_id"),
                lms_user_id: r.get("lms_user_id"),
                roles: r.get("roles"),
                created: parse_datetime(r.get("created")),
                updated: parse_datetime(r.get("updated")),
            })
            .collect())
    }

    async fn count_groupings(&self, grouping_type: GroupingType) -> Result<i64> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM grouping WHERE type = ?1")
            .bind(grouping_type.as_str())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get("n"))
    }
}

// -- OAuth2TokenRepository --

#[async_trait]
impl OAuth2TokenRepository for SqliteRepository {
    async fn get_oauth2_token(&self, key: &TokenKey) -> Result<Option<OAuth2Token>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM oauth2_token WHERE application_instance_id = ?1 AND user_id = ?2 AND service = ?3",
        )
        .bind(key.application_instance_id)
        .bind(&key.user_id)
        .bind(key.service.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.as_ref().and_then(row_to_oauth2_token))
    }

    async fn save_oauth2_token(
        &self,
        key: &TokenKey,
        grant: &TokenGrant,
        received_at: DateTime<Utc>,
    ) -> Result<OAuth2Token> {
        let mut conn = self.conn().await?;
        // Some vendors omit the refresh token from refresh responses and
        // expect the old one to be reused.
        sqlx::query(
            "INSERT INTO oauth2_token (application_instance_id, user_id, service, access_token, refresh_token, expires_in, received_at, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(application_instance_id, user_id, service) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, oauth2_token.refresh_token),
                expires_in = excluded.expires_in,
                received_at = excluded.received_at,
                updated = excluded.updated",
        )
        .bind(key.application_instance_id)
        .bind(&key.user_id)
        .bind(key.service.as_str())
        .bind(&grant.access_token)
        .bind(&grant.refresh_token)
        .bind(grant.expires_in)
        .bind(datetime_to_str(&received_at))
        .bind(now_str())
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM oauth2_token WHERE application_instance_id = ?1 AND user_id = ?2 AND service = ?3",
        )
        .bind(key.application_instance_id)
        .bind(&key.user_id)
        .bind(key.service.as_str())
        .fetch_one(&mut *conn)
        .await?;
        row_to_oauth2_token(&row).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown token service {}", key.service).into()).into()
        })
    }

    async fn delete_oauth2_token(&self, key: &TokenKey) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "DELETE FROM oauth2_token WHERE application_instance_id = ?1 AND user_id = ?2 AND service = ?3",
        )
        .bind(key.application_instance_id)
        .bind(&key.user_id)
        .bind(key.service.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// -- JwtOAuth2TokenRepository --

#[async_trait]
impl JwtOAuth2TokenRepository for SqliteRepository {
    async fn get_jwt_oauth2_token(
        &self,
        lti_registration_id: i64,
        scopes: &str,
    ) -> Result<Option<JwtOAuth2Token>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM jwt_oauth2_token WHERE lti_registration_id = ?1 AND scopes = ?2",
        )
        .bind(lti_registration_id)
        .bind(scopes)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|r| JwtOAuth2Token {
            lti_registration_id: r.get("lti_registration_id"),
            scopes: r.get("scopes"),
            access_token: r.get("access_token"),
            expires_at: parse_datetime(r.get("expires_at")),
        }))
    }

    async fn save_jwt_oauth2_token(&self, token: &JwtOAuth2Token) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO jwt_oauth2_token (lti_registration_id, scopes, access_token, expires_at, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(lti_registration_id, scopes) DO UPDATE SET
                access_token = excluded.access_token,
                expires_at = excluded.expires_at,
                updated = excluded.updated",
        )
        .bind(token.lti_registration_id)
        .bind(&token.scopes)
        .bind(&token.access_token)
        .bind(datetime_to_str(&token.expires_at))
        .bind(now_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

// -- AssignmentRepository --

#[async_trait]
impl AssignmentRepository for SqliteRepository {
    async fn get_assignment(
        &self,
        tool_consumer_instance_guid: &str,
        resource_link_id: &str,
    ) -> Result<Option<Assignment>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM assignment WHERE tool_consumer_instance_guid = ?1 AND resource_link_id = ?2",
        )
        .bind(tool_consumer_instance_guid)
        .bind(resource_link_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.as_ref().map(row_to_assignment))
    }

    async fn upsert_assignment(&self, a: &AssignmentUpsert) -> Result<Assignment> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO assignment (tool_consumer_instance_guid, resource_link_id, document_url, title, group_set_id, lis_outcome_service_url, lineitem, extra, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(tool_consumer_instance_guid, resource_link_id) DO UPDATE SET
                document_url = excluded.document_url,
                title = COALESCE(excluded.title, assignment.title),
                group_set_id = excluded.group_set_id,
                lis_outcome_service_url = COALESCE(excluded.lis_outcome_service_url, assignment.lis_outcome_service_url),
                lineitem = COALESCE(excluded.lineitem, assignment.lineitem),
                extra = json_patch(assignment.extra, excluded.extra),
                updated = excluded.updated",
        )
        .bind(&a.tool_consumer_instance_guid)
        .bind(&a.resource_link_id)
        .bind(&a.document_url)
        .bind(&a.title)
        .bind(&a.group_set_id)
        .bind(&a.lis_outcome_service_url)
        .bind(&a.lineitem)
        .bind(json_map_to_str(&a.extra)?)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM assignment WHERE tool_consumer_instance_guid = ?1 AND resource_link_id = ?2",
        )
        .bind(&a.tool_consumer_instance_guid)
        .bind(&a.resource_link_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(row_to_assignment(&row))
    }
}

// -- GradingInfoRepository --

#[async_trait]
impl GradingInfoRepository for SqliteRepository {
    async fn upsert_grading_info(&self, g: &GradingInfoUpsert) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO grading_info (application_instance_id, context_id, resource_link_id, user_id, h_userid, display_name, lis_result_sourcedid, lis_outcome_service_url, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(application_instance_id, context_id, resource_link_id, user_id) DO UPDATE SET
                h_userid = excluded.h_userid,
                display_name = excluded.display_name,
                lis_result_sourcedid = excluded.lis_result_sourcedid,
                lis_outcome_service_url = excluded.lis_outcome_service_url,
                updated = excluded.updated",
        )
        .bind(g.application_instance_id)
        .bind(&g.context_id)
        .bind(&g.resource_link_id)
        .bind(&g.user_id)
        .bind(&g.h_userid)
        .bind(&g.display_name)
        .bind(&g.lis_result_sourcedid)
        .bind(&g.lis_outcome_service_url)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn list_grading_infos(
        &self,
        application_instance_id: i64,
        context_id: &str,
        resource_link_id: &str,
    ) -> Result<Vec<GradingInfo>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(
            "SELECT * FROM grading_info
             WHERE application_instance_id = ?1 AND context_id = ?2 AND resource_link_id = ?3
             ORDER BY display_name, user_id",
        )
        .bind(application_instance_id)
        .bind(context_id)
        .bind(resource_link_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows
            .iter()
            .map(|r| GradingInfo {
                id: r.get("id"),
                application_instance_id: r.get("application_instance_id"),
                context_id: r.get("context_id"),
                resource_link_id: r.get("resource_link_id"),
                user_id: r.get("user_id"),
                h_userid: r.get("h_userid"),
                display_name: r.get("display_name"),
                lis_result_sourcedid: r.get("lis_result_sourcedid"),
                lis_outcome_service_url: r.get("lis_outcome_service_url"),
                created: parse_datetime(r.get("created")),
                updated: parse_datetime(r.get("updated")),
            })
            .collect())
    }
}

// -- FileRepository --

#[async_trait]
impl FileRepository for SqliteRepository {
    async fn upsert_files(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        course_id: &str,
        files: &[ListedFile],
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let now = now_str();
        for f in files {
            sqlx::query(
                "INSERT INTO file (application_instance_id, type, lms_id, course_id, name, size, created, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(application_instance_id, type, lms_id, course_id) DO UPDATE SET
                    name = excluded.name,
                    size = excluded.size,
                    updated = excluded.updated",
            )
            .bind(application_instance_id)
            .bind(file_type.as_str())
            .bind(&f.lms_id)
            .bind(course_id)
            .bind(&f.name)
            .bind(f.size)
            .bind(&now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn find_file(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        lms_id: &str,
    ) -> Result<Option<File>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM file WHERE application_instance_id = ?1 AND type = ?2 AND lms_id = ?3
             ORDER BY id LIMIT 1",
        )
        .bind(application_instance_id)
        .bind(file_type.as_str())
        .bind(lms_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.as_ref().and_then(row_to_file))
    }

    async fn find_file_by_name_and_size(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        course_id: &str,
        name: &str,
        size: Option<i64>,
    ) -> Result<Option<File>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT * FROM file
             WHERE application_instance_id = ?1 AND type = ?2 AND course_id = ?3 AND name = ?4 AND size IS ?5
             ORDER BY updated DESC, id DESC LIMIT 1",
        )
        .bind(application_instance_id)
        .bind(file_type.as_str())
        .bind(course_id)
        .bind(name)
        .bind(size)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.as_ref().and_then(row_to_file))
    }
}

// -- LmsCourseRepository --

#[async_trait]
impl LmsCourseRepository for SqliteRepository {
    async fn upsert_lms_course(
        &self,
        tool_consumer_instance_guid: &str,
        context_id: &str,
        name: &str,
        h_authority_provided_id: &str,
    ) -> Result<LmsCourse> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO lms_course (tool_consumer_instance_guid, context_id, name, h_authority_provided_id, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(tool_consumer_instance_guid, context_id) DO UPDATE SET
                name = excluded.name,
                h_authority_provided_id = excluded.h_authority_provided_id,
                updated = excluded.updated",
        )
        .bind(tool_consumer_instance_guid)
        .bind(context_id)
        .bind(name)
        .bind(h_authority_provided_id)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;

        let r = sqlx::query(
            "SELECT * FROM lms_course WHERE tool_consumer_instance_guid = ?1 AND context_id = ?2",
        )
        .bind(tool_consumer_instance_guid)
        .bind(context_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(LmsCourse {
            id: r.get("id"),
            tool_consumer_instance_guid: r.get("tool_consumer_instance_guid"),
            context_id: r.get("context_id"),
            name: r.get("name"),
            h_authority_provided_id: r.get("h_authority_provided_id"),
            created: parse_datetime(r.get("created")),
            updated: parse_datetime(r.get("updated")),
        })
    }

    async fn count_lms_courses(&self) -> Result<i64> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM lms_course")
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get("n"))
    }
}

// -- LegacyCourseRepository --

#[async_trait]
impl LegacyCourseRepository for SqliteRepository {
    async fn get_legacy_course(
        &self,
        authority_provided_id: &str,
    ) -> Result<Option<LegacyCourse>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT * FROM legacy_course WHERE authority_provided_id = ?1")
            .bind(authority_provided_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| LegacyCourse {
            authority_provided_id: r.get("authority_provided_id"),
            settings: Settings(parse_json_map(r.get("settings"))),
        }))
    }

    async fn upsert_legacy_course(&self, course: &LegacyCourse) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            "INSERT INTO legacy_course (authority_provided_id, settings, created, updated)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(authority_provided_id) DO UPDATE SET
                settings = excluded.settings,
                updated = excluded.updated",
        )
        .bind(&course.authority_provided_id)
        .bind(json_map_to_str(&course.settings.0)?)
        .bind(now_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::DatabasePool;
    use crate::models::grouping::authority_provided_id;
    use serde_json::json;

    pub(crate) async fn test_repo() -> SqliteRepository {
        let pool = DatabasePool::new_sqlite_memory().await.unwrap();
        match pool {
            DatabasePool::Sqlite(p) => SqliteRepository::new(p),
        }
    }

    pub(crate) async fn seed_instance(repo: &SqliteRepository) -> ApplicationInstance {
        repo.create_application_instance(&NewApplicationInstance {
            consumer_key: Some("Hypothesis123".into()),
            shared_secret: Some("secret".into()),
            lms_url: "https://lms.example.com".into(),
            family: Family::Canvas,
            provisioning: true,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn course_upsert<'a>(
        ai: i64,
        apid: &'a str,
        settings: &'a Settings,
        extra: &'a Map<String, Value>,
    ) -> GroupingUpsert<'a> {
        GroupingUpsert {
            application_instance_id: ai,
            authority_provided_id: apid,
            lms_id: "C",
            lms_name: "Biology",
            parent_id: None,
            grouping_type: GroupingType::Course,
            settings,
            extra,
        }
    }

    #[tokio::test]
    async fn application_instance_lookup() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        assert_eq!(ai.family, Family::Canvas);
        assert!(ai.provisioning);

        let by_key = repo
            .get_application_instance_by_consumer_key("Hypothesis123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, ai.id);
        assert_eq!(by_key.shared_secret.as_deref(), Some("secret"));
        assert!(repo
            .get_application_instance_by_consumer_key("nope")
            .await
            .unwrap()
            .is_none());
        assert_eq!(repo.count_application_instances().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn registration_and_deployment_lookup() {
        let repo = test_repo().await;
        let reg = repo
            .create_lti_registration(
                "https://canvas.instructure.com",
                "10000000000001",
                "https://sso.canvaslms.com/api/lti/authorize_redirect",
                "https://sso.canvaslms.com/api/lti/security/jwks",
                "https://sso.canvaslms.com/login/oauth2/token",
            )
            .await
            .unwrap();
        let ai = repo
            .create_application_instance(&NewApplicationInstance {
                lti_registration_id: Some(reg.id),
                deployment_id: Some("D1".into()),
                lms_url: "https://lms.example.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let found = repo
            .find_lti_registration("https://canvas.instructure.com", "10000000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, reg.id);

        let by_dep = repo
            .get_application_instance_by_deployment(reg.id, "D1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_dep.id, ai.id);
        assert_eq!(
            repo.list_lti_registrations_by_issuer("https://canvas.instructure.com")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn grouping_upsert_is_idempotent_and_merges_extra() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        let apid = authority_provided_id("G", GroupingType::Course, "C", None);
        let settings = Settings::default();

        let mut extra = Map::new();
        extra.insert("canvas".into(), json!({"custom_canvas_course_id": "125"}));
        let first = repo
            .upsert_grouping(&course_upsert(ai.id, &apid, &settings, &extra))
            .await
            .unwrap();

        let mut extra2 = Map::new();
        extra2.insert("course_copy_file_mappings".into(), json!({"1": "2"}));
        let second = repo
            .upsert_grouping(&course_upsert(ai.id, &apid, &settings, &extra2))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.extra["canvas"]["custom_canvas_course_id"], "125");
        assert_eq!(second.extra["course_copy_file_mappings"]["1"], "2");
        assert_eq!(repo.count_groupings(GroupingType::Course).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn membership_appears_once() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        let apid = authority_provided_id("G", GroupingType::Course, "C", None);
        let settings = Settings::default();
        let extra = Map::new();
        let course = repo
            .upsert_grouping(&course_upsert(ai.id, &apid, &settings, &extra))
            .await
            .unwrap();
        let user = repo
            .upsert_lms_user(ai.id, "u1", "acct:x@lms", Some("U"), None, "Learner")
            .await
            .unwrap();

        repo.upsert_grouping_membership(course.id, user.id, "Learner")
            .await
            .unwrap();
        repo.upsert_grouping_membership(course.id, user.id, "Learner,Instructor")
            .await
            .unwrap();

        let members = repo.list_grouping_memberships(course.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].roles, "Learner,Instructor");
    }

    #[tokio::test]
    async fn oauth2_token_keeps_refresh_token_when_omitted() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        let key = TokenKey {
            application_instance_id: ai.id,
            user_id: "u1".into(),
            service: Service::Canvas,
        };
        repo.save_oauth2_token(
            &key,
            &TokenGrant {
                access_token: "a1".into(),
                refresh_token: Some("r1".into()),
                expires_in: Some(3600),
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let t = repo
            .save_oauth2_token(
                &key,
                &TokenGrant {
                    access_token: "a2".into(),
                    refresh_token: None,
                    expires_in: Some(3600),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(t.access_token, "a2");
        assert_eq!(t.refresh_token.as_deref(), Some("r1"));

        assert!(repo.delete_oauth2_token(&key).await.unwrap());
        assert!(repo.get_oauth2_token(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assignment_reconfigure_keeps_grading_urls() {
        let repo = test_repo().await;
        let first = repo
            .upsert_assignment(&AssignmentUpsert {
                tool_consumer_instance_guid: "G".into(),
                resource_link_id: "RL".into(),
                document_url: "https://example.com/a.pdf".into(),
                lis_outcome_service_url: Some("https://lms.example.com/outcomes".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let second = repo
            .upsert_assignment(&AssignmentUpsert {
                tool_consumer_instance_guid: "G".into(),
                resource_link_id: "RL".into(),
                document_url: "canvas://file/course/1/file_id/2".into(),
                group_set_id: Some("42".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.document_url, "canvas://file/course/1/file_id/2");
        assert_eq!(second.group_set_id.as_deref(), Some("42"));
        assert_eq!(
            second.lis_outcome_service_url.as_deref(),
            Some("https://lms.example.com/outcomes")
        );
    }

    #[tokio::test]
    async fn file_lookup_by_name_and_size() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        let listed = |id: &str| ListedFile {
            lms_id: id.into(),
            name: "notes.pdf".into(),
            size: Some(1024),
            parent_id: None,
            updated_at: None,
        };
        repo.upsert_files(ai.id, FileType::CanvasFile, "100", &[listed("1")])
            .await
            .unwrap();
        repo.upsert_files(ai.id, FileType::CanvasFile, "200", &[listed("9")])
            .await
            .unwrap();

        let original = repo
            .find_file(ai.id, FileType::CanvasFile, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.course_id, "100");

        let copy = repo
            .find_file_by_name_and_size(ai.id, FileType::CanvasFile, "200", "notes.pdf", Some(1024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.lms_id, "9");
        assert!(repo
            .find_file_by_name_and_size(ai.id, FileType::CanvasFile, "200", "notes.pdf", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_rows() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;

        let tx = repo.begin().await.unwrap();
        tx.upsert_lms_user(ai.id, "u1", "acct:x@lms", None, None, "")
            .await
            .unwrap();
        assert!(tx.get_lms_user(ai.id, "u1").await.unwrap().is_some());
        tx.rollback().await.unwrap();

        assert!(repo.get_lms_user(ai.id, "u1").await.unwrap().is_none());
        assert!(tx.get_lms_user(ai.id, "u1").await.is_err());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;

        let tx = repo.begin().await.unwrap();
        assert!(tx.in_transaction());
        tx.upsert_lms_course("G", "C", "Biology", "apid").await.unwrap();
        tx.commit().await.unwrap();
        // Second commit is a no-op.
        tx.commit().await.unwrap();

        assert_eq!(repo.count_lms_courses().await.unwrap(), 1);
        assert!(repo
            .upsert_lms_user(ai.id, "u1", "acct:x@lms", None, None, "")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn legacy_course_roundtrip() {
        let repo = test_repo().await;
        let mut settings = Settings::default();
        settings.set("canvas", "sections_enabled", json!(false));
        repo.upsert_legacy_course(&LegacyCourse {
            authority_provided_id: "apid".into(),
            settings: settings.clone(),
        })
        .await
        .unwrap();
        let legacy = repo.get_legacy_course("apid").await.unwrap().unwrap();
        assert_eq!(legacy.settings, settings);
        assert!(repo.get_legacy_course("other").await.unwrap().is_none());
    }
}
