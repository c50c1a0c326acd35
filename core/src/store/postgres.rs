use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::RegistryStore;
use crate::instance::{Instance, Version, Versioned};
use crate::{Conflict, Error};

pub(crate) const TABLE: &str = "ringkeeper_instances";
pub(crate) const VERSION_SEQUENCE: &str = "ringkeeper_instance_versions";
pub(crate) const TOKEN_INDEX: &str = "idx_ringkeeper_instances_token";

const COLUMNS: &str = "application, id, datacenter, rack, instance_identifier, \
                       hostname, address, token, version, updated_at";

#[derive(sqlx::FromRow)]
struct InstanceRow {
    application: String,
    id: i64,
    datacenter: String,
    rack: String,
    instance_identifier: String,
    hostname: String,
    address: String,
    token: String,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn into_record(self) -> Result<Versioned<Instance>, Error> {
        let token = self.token.parse().map_err(|_| {
            Error::unavailable(format!("corrupt token {:?} for instance {}", self.token, self.id))
        })?;
        let id = u32::try_from(self.id)
            .map_err(|_| Error::unavailable(format!("corrupt instance id {}", self.id)))?;
        Ok(Versioned::new(
            Instance {
                application: self.application,
                datacenter: self.datacenter,
                rack: self.rack,
                id,
                instance_identifier: self.instance_identifier,
                hostname: self.hostname,
                address: self.address,
                token,
                updated_at: self.updated_at,
            },
            Version(self.version as u64),
        ))
    }
}

/// PostgreSQL-backed store.
///
/// The primary key on `(application, id)` guards ids and the unique index on
/// `(application, datacenter, token)` guards tokens, so a single statement
/// either claims both or neither.
#[derive(Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn list(&self, application: &str) -> Result<Vec<Instance>, Error> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM {TABLE} WHERE application = $1"
        ))
        .bind(application)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_record().map(Versioned::into_inner))
            .collect()
    }

    async fn fetch(
        &self,
        application: &str,
        id: u32,
    ) -> Result<Option<Versioned<Instance>>, Error> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM {TABLE} WHERE application = $1 AND id = $2"
        ))
        .bind(application)
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRow::into_record).transpose()
    }

    async fn put(&self, instance: &Instance, expected: Option<Version>) -> Result<Version, Error> {
        let result = match expected {
            None => {
                sqlx::query_scalar::<_, i64>(&format!(
                    "INSERT INTO {TABLE} ({COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, nextval('{VERSION_SEQUENCE}'), $9) \
                     RETURNING version"
                ))
                .bind(&instance.application)
                .bind(instance.id as i64)
                .bind(&instance.datacenter)
                .bind(&instance.rack)
                .bind(&instance.instance_identifier)
                .bind(&instance.hostname)
                .bind(&instance.address)
                .bind(instance.token.to_string())
                .bind(instance.updated_at)
                .fetch_one(&self.pool)
                .await
                .map(Some)
            }
            Some(version) => {
                sqlx::query_scalar::<_, i64>(&format!(
                    "UPDATE {TABLE} SET datacenter = $3, rack = $4, instance_identifier = $5, \
                     hostname = $6, address = $7, token = $8, updated_at = $9, \
                     version = nextval('{VERSION_SEQUENCE}') \
                     WHERE application = $1 AND id = $2 AND version = $10 \
                     RETURNING version"
                ))
                .bind(&instance.application)
                .bind(instance.id as i64)
                .bind(&instance.datacenter)
                .bind(&instance.rack)
                .bind(&instance.instance_identifier)
                .bind(&instance.hostname)
                .bind(&instance.address)
                .bind(instance.token.to_string())
                .bind(instance.updated_at)
                .bind(version.0 as i64)
                .fetch_optional(&self.pool)
                .await
            }
        };

        match result {
            Ok(Some(version)) => Ok(Version(version as u64)),
            Ok(None) => Err(Conflict::Version { id: instance.id }.into()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if db.constraint() == Some(TOKEN_INDEX) {
                    Err(Conflict::Token {
                        token: instance.token,
                        holder: None,
                    }
                    .into())
                } else {
                    Err(Conflict::Version { id: instance.id }.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(
        &self,
        application: &str,
        id: u32,
        expected: Option<Version>,
    ) -> Result<(), Error> {
        let Some(expected) = expected else {
            sqlx::query(&format!(
                "DELETE FROM {TABLE} WHERE application = $1 AND id = $2"
            ))
            .bind(application)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
            return Ok(());
        };

        let result = sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE application = $1 AND id = $2 AND version = $3"
        ))
        .bind(application)
        .bind(id as i64)
        .bind(expected.0 as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Conflict::Version { id }.into());
        }
        Ok(())
    }
}
