// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # SQLite Agreement Store
//!
//! Durable `AgreementStore` implementation backed by an edge-local SQLite
//! file via `sqlx`. Rows are stored as one JSON document per agreement
//! with the identity and archived flag broken out into columns for
//! querying; filter predicates run over the decoded rows.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::domain::agreement::{
    matches_all, now_secs, Agreement, AgreementFilter, AgreementId, MeteringNotification,
};
use crate::domain::repository::{
    apply_transition, AgreementStore, LifecycleTransition, StoreError,
};

pub struct SqliteAgreementStore {
    pool: SqlitePool,
}

impl SqliteAgreementStore {
    /// Open (or create) the store at `url`, e.g. `sqlite://agreements.db`
    /// or `sqlite::memory:`.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(db_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agreements (
                protocol     TEXT NOT NULL,
                agreement_id TEXT NOT NULL,
                archived     INTEGER NOT NULL DEFAULT 0,
                data         TEXT NOT NULL,
                PRIMARY KEY (protocol, agreement_id)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;
        Ok(Self { pool })
    }

    async fn load(
        &self,
        protocol: &str,
        id: &AgreementId,
    ) -> Result<Option<Agreement>, StoreError> {
        let row = sqlx::query("SELECT data FROM agreements WHERE protocol = ? AND agreement_id = ?")
            .bind(protocol)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| decode(r.get::<String, _>("data")))
            .transpose()
    }

    async fn save(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let data = serde_json::to_string(agreement)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO agreements (protocol, agreement_id, archived, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (protocol, agreement_id) DO UPDATE SET
                archived = excluded.archived,
                data = excluded.data
            "#,
        )
        .bind(&agreement.protocol)
        .bind(agreement.id.as_str())
        .bind(agreement.archived as i64)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mutate(
        &self,
        protocol: &str,
        id: &AgreementId,
        f: impl FnOnce(&mut Agreement) -> Result<(), StoreError>,
    ) -> Result<Agreement, StoreError> {
        let mut agreement = self
            .load(protocol, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(&mut agreement)?;
        self.save(&agreement).await?;
        Ok(agreement)
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn decode(data: String) -> Result<Agreement, StoreError> {
    serde_json::from_str(&data).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl AgreementStore for SqliteAgreementStore {
    async fn insert(&self, agreement: Agreement) -> Result<(), StoreError> {
        if let Some(existing) = self.load(&agreement.protocol, &agreement.id).await? {
            if !existing.archived {
                return Err(StoreError::Duplicate(agreement.id.to_string()));
            }
        }
        self.save(&agreement).await
    }

    async fn find(
        &self,
        protocol: &str,
        id: &AgreementId,
    ) -> Result<Option<Agreement>, StoreError> {
        self.load(protocol, id).await
    }

    async fn find_by_protocol(
        &self,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError> {
        let rows = sqlx::query("SELECT data FROM agreements WHERE protocol = ?")
            .bind(protocol)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut agreements = Vec::new();
        for row in rows {
            let agreement = decode(row.get::<String, _>("data"))?;
            if matches_all(&agreement, filters) {
                agreements.push(agreement);
            }
        }
        Ok(agreements)
    }

    async fn find_all_protocols(
        &self,
        protocols: &[String],
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError> {
        let mut agreements = Vec::new();
        for protocol in protocols {
            agreements.extend(self.find_by_protocol(protocol, filters).await?);
        }
        Ok(agreements)
    }

    async fn record(
        &self,
        protocol: &str,
        id: &AgreementId,
        transition: LifecycleTransition,
    ) -> Result<Agreement, StoreError> {
        self.mutate(protocol, id, |a| apply_transition(a, &transition, now_secs()))
            .await
    }

    async fn record_metering(
        &self,
        protocol: &str,
        id: &AgreementId,
        meter: MeteringNotification,
    ) -> Result<Agreement, StoreError> {
        self.mutate(protocol, id, |a| {
            if a.archived {
                return Err(StoreError::InvalidTransition(format!(
                    "agreement {} is archived",
                    a.id
                )));
            }
            a.metering = meter;
            Ok(())
        })
        .await
    }

    async fn record_deployment(
        &self,
        protocol: &str,
        id: &AgreementId,
        deployment: serde_json::Value,
    ) -> Result<Agreement, StoreError> {
        self.mutate(protocol, id, |a| {
            if a.archived {
                return Err(StoreError::InvalidTransition(format!(
                    "agreement {} is archived",
                    a.id
                )));
            }
            a.deployment = deployment;
            Ok(())
        })
        .await
    }

    async fn archive(&self, protocol: &str, id: &AgreementId) -> Result<Agreement, StoreError> {
        self.mutate(protocol, id, |a| {
            a.archived = true;
            Ok(())
        })
        .await
    }

    async fn delete(&self, protocol: &str, id: &AgreementId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM agreements WHERE protocol = ? AND agreement_id = ?")
            .bind(protocol)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agreement::{unarchived, LedgerRef};

    async fn store() -> SqliteAgreementStore {
        SqliteAgreementStore::open("sqlite::memory:").await.unwrap()
    }

    fn agreement(id: &str) -> Agreement {
        Agreement::new(
            "Basic",
            AgreementId::new(id),
            "{}",
            "broker",
            LedgerRef::default(),
        )
    }

    #[tokio::test]
    async fn round_trip_and_scan() {
        let store = store().await;
        store.insert(agreement("a")).await.unwrap();
        store.insert(agreement("b")).await.unwrap();
        store
            .archive("Basic", &AgreementId::new("b"))
            .await
            .unwrap();

        let rows = store
            .find_by_protocol("Basic", &[unarchived()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, AgreementId::new("a"));
    }

    #[tokio::test]
    async fn lifecycle_guards_apply() {
        let store = store().await;
        store.insert(agreement("a")).await.unwrap();
        let id = AgreementId::new("a");
        store
            .record(
                "Basic",
                &id,
                LifecycleTransition::Terminated {
                    reason: 3,
                    description: "gone".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(store
            .record("Basic", &id, LifecycleTransition::ExecutionStarted)
            .await
            .is_err());
        store.delete("Basic", &id).await.unwrap();
        assert!(store.find("Basic", &id).await.unwrap().is_none());
    }
}
