use sea_orm_migration::prelude::*;

pub(crate) const RECORDS: &str = "records";
pub(crate) const RECORD_STATS: &str = "record_stats";
pub(crate) const VERSUS_TALLIES: &str = "versus_tallies";
pub(crate) const TALLY_ENTRIES: &str = "tally_entries";

/// Tables shared by all trackers. Every row carries the tracker name as the first part of its primary key.
#[derive(Debug)]
pub struct StatsSchema {
    prefix: String,
}

impl StatsSchema {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self { prefix: prefix.into() }
    }

    pub(crate) fn table(&self, name: &str) -> Alias {
        Alias::new(format!("{}{name}", self.prefix))
    }
}

impl MigrationName for StatsSchema {
    fn name(&self) -> &str {
        "stats_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for StatsSchema {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(self.table(RECORDS))
                    .if_not_exists()
                    .col(ColumnDef::new(Col::Tracker).string_len(64).not_null())
                    .col(ColumnDef::new(Col::Id).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Name).string().not_null())
                    .col(ColumnDef::new(Col::Tracking).boolean().not_null().default(true))
                    .primary_key(Index::create().col(Col::Tracker).col(Col::Id))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(self.table(RECORD_STATS))
                    .if_not_exists()
                    .col(ColumnDef::new(Col::Tracker).string_len(64).not_null())
                    .col(ColumnDef::new(Col::Id).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Stat).string_len(64).not_null())
                    .col(ColumnDef::new(Col::Value).double().not_null())
                    .primary_key(Index::create().col(Col::Tracker).col(Col::Id).col(Col::Stat))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name(format!("idx-{}{RECORD_STATS}-top", self.prefix))
                    .table(self.table(RECORD_STATS))
                    .col(Col::Tracker)
                    .col(Col::Stat)
                    .col(Col::Value)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(self.table(VERSUS_TALLIES))
                    .if_not_exists()
                    .col(ColumnDef::new(Col::Tracker).string_len(64).not_null())
                    .col(ColumnDef::new(Col::LowId).string_len(36).not_null())
                    .col(ColumnDef::new(Col::HighId).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Id1).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Id2).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Stats).text().not_null())
                    .primary_key(Index::create().col(Col::Tracker).col(Col::LowId).col(Col::HighId))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(self.table(TALLY_ENTRIES))
                    .if_not_exists()
                    .col(ColumnDef::new(Col::Tracker).string_len(64).not_null())
                    .col(ColumnDef::new(Col::Id1).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Id2).string_len(36).not_null())
                    .col(ColumnDef::new(Col::Tie).boolean().not_null())
                    .col(ColumnDef::new(Col::Timestamp).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .col(Col::Tracker)
                            .col(Col::Id1)
                            .col(Col::Id2)
                            .col(Col::Timestamp),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [TALLY_ENTRIES, VERSUS_TALLIES, RECORD_STATS, RECORDS] {
            manager
                .drop_table(Table::drop().table(self.table(name)).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}

#[derive(Iden, Clone, Copy)]
pub(crate) enum Col {
    Tracker,
    Id,
    Name,
    Tracking,
    Stat,
    Value,
    LowId,
    HighId,
    Id1,
    Id2,
    Stats,
    Tie,
    Timestamp,
}
