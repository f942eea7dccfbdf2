use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Servers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Servers::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Servers::Name).string().not_null())
                    .col(
                        ColumnDef::new(Servers::ServerType)
                            .string()
                            .not_null()
                            .default("vanilla"),
                    )
                    .col(ColumnDef::new(Servers::Version).string().not_null())
                    .col(ColumnDef::new(Servers::Port).integer().not_null())
                    .col(
                        ColumnDef::new(Servers::RamMb)
                            .integer()
                            .not_null()
                            .default(1024),
                    )
                    .col(
                        ColumnDef::new(Servers::JarName)
                            .string()
                            .not_null()
                            .default("server.jar"),
                    )
                    .col(
                        ColumnDef::new(Servers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Servers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Servers {
    Table,
    Id,
    Name,
    ServerType,
    Version,
    Port,
    RamMb,
    JarName,
    CreatedAt,
}
