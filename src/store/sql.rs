mod schema;

pub use schema::StatsSchema;

use crate::config::DatabaseKind;
use crate::config::DatabaseSettings;
use crate::error::StoreError;
use crate::record::Record;
use crate::record::TallyEntry;
use crate::record::VersusTally;
use crate::traits::StatStore;
use crate::types::PairKey;
use crate::types::StatType;
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use schema::Col;
use schema::RECORDS;
use schema::RECORD_STATS;
use schema::TALLY_ENTRIES;
use schema::VERSUS_TALLIES;
use sea_orm::sea_query::Alias;
use sea_orm::sea_query::Expr;
use sea_orm::sea_query::OnConflict;
use sea_orm::sea_query::Order;
use sea_orm::sea_query::Query;
use sea_orm::StatementBuilder;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::Database;
use sea_orm::DatabaseConnection;
use sea_orm::FromQueryResult;
use sea_orm::TransactionTrait;
use sea_orm_migration::MigrationTrait;
use sea_orm_migration::SchemaManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, FromQueryResult)]
struct IdRow {
    id: String,
}

#[derive(Debug, FromQueryResult)]
struct RecordRow {
    id:       String,
    name:     String,
    tracking: bool,
}

#[derive(Debug, FromQueryResult)]
struct StatRow {
    id:    String,
    stat:  String,
    value: f64,
}

#[derive(Debug, FromQueryResult)]
struct TallyRow {
    id1:   String,
    id2:   String,
    stats: String,
}

#[derive(Debug, FromQueryResult)]
struct EntryRow {
    id1:       String,
    id2:       String,
    tie:       bool,
    timestamp: i64,
}

fn parse_uuid(id: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(id).map_err(|err| StoreError::backend(format!("malformed id '{id}': {err}")))
}

impl RecordRow {
    fn into_record(self, statistics: HashMap<StatType, f32>) -> Result<Record, StoreError> {
        let mut record = Record::new(parse_uuid(&self.id)?, self.name, statistics);
        record.set_tracking(self.tracking);
        Ok(record)
    }
}

impl TallyRow {
    fn into_tally(self) -> Result<VersusTally, StoreError> {
        Ok(VersusTally::new(
            parse_uuid(&self.id1)?,
            parse_uuid(&self.id2)?,
            serde_json::from_str(&self.stats)?,
        ))
    }
}

impl EntryRow {
    fn into_entry(self) -> Result<TallyEntry, StoreError> {
        let timestamp = DateTime::from_timestamp_millis(self.timestamp)
            .ok_or_else(|| StoreError::backend(format!("timestamp out of range: {}", self.timestamp)))?;
        Ok(TallyEntry::new(
            parse_uuid(&self.id1)?,
            parse_uuid(&self.id2)?,
            self.tie,
            timestamp,
        ))
    }
}

/// Relational [`StatStore`] on top of SeaORM.
///
/// The connection is made from explicit [`DatabaseSettings`]; one store is meant to be shared by all trackers of a
/// process. Tables are created on connect if missing.
#[derive(Debug)]
pub struct SqlStore {
    schema:     StatsSchema,
    connection: Mutex<Option<DatabaseConnection>>,
}

impl SqlStore {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let mut opts = ConnectOptions::new(settings.url());
        opts.acquire_timeout(Duration::from_secs(10)).sqlx_logging(false);
        if settings.kind() == DatabaseKind::Sqlite {
            // SQLite serializes writers anyway.
            opts.max_connections(1);
        }

        let connection = Database::connect(opts).await?;
        if settings.kind() == DatabaseKind::Sqlite {
            connection.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
            connection.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
        }

        Self::with_connection(connection, settings.prefix()).await
    }

    /// Use an already established connection.
    pub async fn with_connection(connection: DatabaseConnection, prefix: &str) -> Result<Self, StoreError> {
        let schema = StatsSchema::new(prefix);
        schema.up(&SchemaManager::new(&connection)).await?;
        debug!("Statistics schema ready (prefix '{prefix}')");

        Ok(Self {
            schema,
            connection: Mutex::new(Some(connection)),
        })
    }

    fn db(&self) -> Result<DatabaseConnection, StoreError> {
        self.connection.lock().clone().ok_or(StoreError::Closed)
    }

    #[inline]
    fn table(&self, name: &str) -> Alias {
        self.schema.table(name)
    }

    async fn load_stats<C: ConnectionTrait>(
        &self,
        db: &C,
        tracker: &str,
        ids: Vec<String>,
    ) -> Result<HashMap<String, HashMap<StatType, f32>>, StoreError> {
        let query = Query::select()
            .columns([Col::Id, Col::Stat, Col::Value])
            .from(self.table(RECORD_STATS))
            .and_where(Expr::col(Col::Tracker).eq(tracker))
            .and_where(Expr::col(Col::Id).is_in(ids))
            .to_owned();

        let mut stats: HashMap<String, HashMap<StatType, f32>> = HashMap::new();
        for row in StatRow::find_by_statement(build(db, &query)).all(db).await? {
            stats
                .entry(row.id)
                .or_default()
                .insert(StatType::custom(&row.stat), row.value as f32);
        }
        Ok(stats)
    }

    async fn load_records<C: ConnectionTrait>(
        &self,
        db: &C,
        tracker: &str,
        ids: Vec<String>,
    ) -> Result<Vec<Record>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::select()
            .columns([Col::Id, Col::Name, Col::Tracking])
            .from(self.table(RECORDS))
            .and_where(Expr::col(Col::Tracker).eq(tracker))
            .and_where(Expr::col(Col::Id).is_in(ids.clone()))
            .to_owned();
        let rows = RecordRow::find_by_statement(build(db, &query)).all(db).await?;
        let mut stats = self.load_stats(db, tracker, ids).await?;

        rows.into_iter()
            .map(|row| {
                let statistics = stats.remove(&row.id).unwrap_or_default();
                row.into_record(statistics)
            })
            .collect()
    }
}

fn build<C: ConnectionTrait, S: StatementBuilder>(db: &C, statement: &S) -> sea_orm::Statement {
    db.get_database_backend().build(statement)
}

fn insert_failed(err: sea_orm::sea_query::error::Error) -> StoreError {
    StoreError::backend(format!("failed to build insert: {err}"))
}

#[async_trait]
impl StatStore for SqlStore {
    #[instrument(level = "trace", skip(self))]
    async fn load_record(&self, tracker: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        let db = self.db()?;
        Ok(self
            .load_records(&db, tracker, vec![id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_top_records(
        &self,
        tracker: &str,
        limit: usize,
        order_by: &StatType,
    ) -> Result<Vec<Record>, StoreError> {
        let db = self.db()?;
        let query = Query::select()
            .column(Col::Id)
            .from(self.table(RECORD_STATS))
            .and_where(Expr::col(Col::Tracker).eq(tracker))
            .and_where(Expr::col(Col::Stat).eq(order_by.key()))
            .order_by(Col::Value, Order::Desc)
            .limit(limit as u64)
            .to_owned();
        let ids = IdRow::find_by_statement(build(&db, &query))
            .all(&db)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        let mut records = self.load_records(&db, tracker, ids).await?;
        records.sort_by(|a, b| b.stat(order_by).total_cmp(&a.stat(order_by)));
        Ok(records)
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_versus_tally(&self, tracker: &str, a: Uuid, b: Uuid) -> Result<Option<VersusTally>, StoreError> {
        let db = self.db()?;
        let pair = PairKey::new(a, b);
        let query = Query::select()
            .columns([Col::Id1, Col::Id2, Col::Stats])
            .from(self.table(VERSUS_TALLIES))
            .and_where(Expr::col(Col::Tracker).eq(tracker))
            .and_where(Expr::col(Col::LowId).eq(pair.low().to_string()))
            .and_where(Expr::col(Col::HighId).eq(pair.high().to_string()))
            .to_owned();

        TallyRow::find_by_statement(build(&db, &query))
            .one(&db)
            .await?
            .map(TallyRow::into_tally)
            .transpose()
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_tally_entries(&self, tracker: &str, id: Uuid) -> Result<Vec<TallyEntry>, StoreError> {
        let db = self.db()?;
        let id = id.to_string();
        let query = Query::select()
            .columns([Col::Id1, Col::Id2, Col::Tie, Col::Timestamp])
            .from(self.table(TALLY_ENTRIES))
            .and_where(Expr::col(Col::Tracker).eq(tracker))
            .and_where(Expr::col(Col::Id1).eq(id.clone()).or(Expr::col(Col::Id2).eq(id)))
            .order_by(Col::Timestamp, Order::Asc)
            .to_owned();

        EntryRow::find_by_statement(build(&db, &query))
            .all(&db)
            .await?
            .into_iter()
            .map(EntryRow::into_entry)
            .collect()
    }

    #[instrument(level = "trace", skip(self, records), fields(count = records.len()))]
    async fn save_records(&self, tracker: &str, records: Vec<Record>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let db = self.db()?;
        let mut insert_records = Query::insert();
        insert_records
            .into_table(self.table(RECORDS))
            .columns([Col::Tracker, Col::Id, Col::Name, Col::Tracking])
            .on_conflict(
                OnConflict::columns([Col::Tracker, Col::Id])
                    .update_columns([Col::Name, Col::Tracking])
                    .to_owned(),
            );

        let mut insert_stats = Query::insert();
        insert_stats
            .into_table(self.table(RECORD_STATS))
            .columns([Col::Tracker, Col::Id, Col::Stat, Col::Value])
            .on_conflict(
                OnConflict::columns([Col::Tracker, Col::Id, Col::Stat])
                    .update_column(Col::Value)
                    .to_owned(),
            );

        let mut has_stats = false;
        for record in &records {
            let id = record.id().to_string();
            insert_records
                .values([
                    tracker.into(),
                    id.clone().into(),
                    record.name().into(),
                    record.is_tracking().into(),
                ])
                .map_err(insert_failed)?;
            for (stat, value) in record.statistics() {
                has_stats = true;
                insert_stats
                    .values([tracker.into(), id.clone().into(), stat.key().into(), (*value as f64).into()])
                    .map_err(insert_failed)?;
            }
        }

        let txn = db.begin().await?;
        txn.execute(build(&txn, &insert_records)).await?;
        if has_stats {
            txn.execute(build(&txn, &insert_stats)).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, tallies), fields(count = tallies.len()))]
    async fn save_versus_tallies(&self, tracker: &str, tallies: Vec<VersusTally>) -> Result<(), StoreError> {
        if tallies.is_empty() {
            return Ok(());
        }

        let db = self.db()?;
        let mut insert = Query::insert();
        insert
            .into_table(self.table(VERSUS_TALLIES))
            .columns([Col::Tracker, Col::LowId, Col::HighId, Col::Id1, Col::Id2, Col::Stats])
            .on_conflict(
                OnConflict::columns([Col::Tracker, Col::LowId, Col::HighId])
                    .update_column(Col::Stats)
                    .to_owned(),
            );
        for tally in &tallies {
            let pair = tally.pair_key();
            insert
                .values([
                    tracker.into(),
                    pair.low().to_string().into(),
                    pair.high().to_string().into(),
                    tally.id1().to_string().into(),
                    tally.id2().to_string().into(),
                    serde_json::to_string(tally.statistics())?.into(),
                ])
                .map_err(insert_failed)?;
        }

        let txn = db.begin().await?;
        txn.execute(build(&txn, &insert)).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, entries), fields(count = entries.len()))]
    async fn save_tally_entries(&self, tracker: &str, entries: Vec<TallyEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let db = self.db()?;
        let mut insert = Query::insert();
        insert
            .into_table(self.table(TALLY_ENTRIES))
            .columns([Col::Tracker, Col::Id1, Col::Id2, Col::Tie, Col::Timestamp])
            .on_conflict(
                OnConflict::columns([Col::Tracker, Col::Id1, Col::Id2, Col::Timestamp])
                    .update_column(Col::Tie)
                    .to_owned(),
            );
        for entry in &entries {
            insert
                .values([
                    tracker.into(),
                    entry.id1.to_string().into(),
                    entry.id2.to_string().into(),
                    entry.tie.into(),
                    entry.timestamp.timestamp_millis().into(),
                ])
                .map_err(insert_failed)?;
        }

        let txn = db.begin().await?;
        txn.execute(build(&txn, &insert)).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn remove_record(&self, tracker: &str, id: Uuid) -> Result<(), StoreError> {
        let db = self.db()?;
        let id = id.to_string();
        let txn = db.begin().await?;
        for table in [RECORD_STATS, RECORDS] {
            let delete = Query::delete()
                .from_table(self.table(table))
                .and_where(Expr::col(Col::Tracker).eq(tracker))
                .and_where(Expr::col(Col::Id).eq(id.clone()))
                .to_owned();
            txn.execute(build(&txn, &delete)).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Closing a closed store is a no-op since all trackers sharing the store close it on teardown.
    async fn close(&self) -> Result<(), StoreError> {
        let Some(connection) = self.connection.lock().take()
        else {
            return Ok(());
        };
        connection.close().await?;
        debug!("Statistics store connection closed");
        Ok(())
    }
}
