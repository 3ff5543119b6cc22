//! SQLite DocumentStore implementation.
//!
//! Documents are stored as JSON text. Filters run in process after loading
//! the collection.

use std::marker::PhantomData;

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::schema::{Documents, CREATE_DOCUMENTS_TABLE};
use super::{Document, DocumentStore, Mutation, Result};

/// Create the documents table if missing.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_DOCUMENTS_TABLE).execute(pool).await?;
    Ok(())
}

/// SQLite implementation of DocumentStore for one collection.
pub struct SqliteStore<D> {
    pool: SqlitePool,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> SqliteStore<D> {
    /// Create a store over an initialised pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _doc: PhantomData,
        }
    }

    fn decode(body: &str) -> Result<D> {
        Ok(serde_json::from_str(body)?)
    }

    async fn update_in(conn: &mut SqliteConnection, key: &str, mutate: Mutation<D>) -> Result<Option<D>> {
        let query = Query::select()
            .column(Documents::Body)
            .from(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .and_where(Expr::col(Documents::DocKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? else {
            return Ok(None);
        };
        let mut doc = Self::decode(row.get("body"))?;
        mutate(&mut doc);
        let body = serde_json::to_string(&doc)?;

        let query = Query::update()
            .table(Documents::Table)
            .value(Documents::Body, body)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .and_where(Expr::col(Documents::DocKey).eq(key))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        Ok(Some(doc))
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for SqliteStore<D> {
    async fn find(&self, key: &str) -> Result<Option<D>> {
        let query = Query::select()
            .column(Documents::Body)
            .from(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .and_where(Expr::col(Documents::DocKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| Self::decode(row.get("body"))).transpose()
    }

    async fn find_where(&self, filter: &(dyn for<'a> Fn(&'a D) -> bool + Send + Sync)) -> Result<Vec<D>> {
        let query = Query::select()
            .column(Documents::Body)
            .from(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .order_by(Documents::DocKey, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut matched = Vec::new();
        for row in rows {
            let doc = Self::decode(row.get("body"))?;
            if filter(&doc) {
                matched.push(doc);
            }
        }
        Ok(matched)
    }

    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<D>> {
        let query = Query::select()
            .column(Documents::Body)
            .from(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .order_by(Documents::DocKey, Order::Asc)
            .limit(limit as u64)
            .offset(skip as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| Self::decode(row.get("body"))).collect()
    }

    async fn insert(&self, doc: D) -> Result<bool> {
        let body = serde_json::to_string(&doc)?;

        let query = Query::insert()
            .into_table(Documents::Table)
            .columns([Documents::Collection, Documents::DocKey, Documents::Body])
            .values_panic([D::COLLECTION.into(), doc.key().into(), body.into()])
            .on_conflict(
                OnConflict::columns([Documents::Collection, Documents::DocKey])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, key: &str, mutate: Mutation<D>) -> Result<Option<D>> {
        // BEGIN IMMEDIATE takes the write lock before the read.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::update_in(&mut conn, key, mutate).await {
            Ok(updated) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(updated)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<D>> {
        let query = Query::delete()
            .from_table(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .and_where(Expr::col(Documents::DocKey).eq(key))
            .returning_col(Documents::Body)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| Self::decode(row.get("body"))).transpose()
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let query = Query::delete()
            .from_table(Documents::Table)
            .and_where(Expr::col(Documents::Collection).eq(D::COLLECTION))
            .and_where(Expr::col(Documents::DocKey).is_in(keys.iter().map(String::as_str)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}
