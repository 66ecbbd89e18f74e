use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // OAuth 2.0 Device Authorization Grant (RFC 8628)
        manager
            .create_table(
                Table::create()
                    .table(DeviceAuthorization::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceAuthorization::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceAuthorization::UserCode)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceAuthorization::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviceAuthorization::Scope).string())
                    .col(
                        ColumnDef::new(DeviceAuthorization::VerificationUri)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviceAuthorization::VerificationUriComplete).string())
                    .col(
                        ColumnDef::new(DeviceAuthorization::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(DeviceAuthorization::Subject).string())
                    .col(
                        ColumnDef::new(DeviceAuthorization::ExpiresIn)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAuthorization::Interval)
                            .big_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(ColumnDef::new(DeviceAuthorization::LastPollAt).big_integer())
                    .col(
                        ColumnDef::new(DeviceAuthorization::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAuthorization::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_authorizations_created_at")
                    .table(DeviceAuthorization::Table)
                    .col(DeviceAuthorization::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_authorizations_status")
                    .table(DeviceAuthorization::Table)
                    .col(DeviceAuthorization::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceAuthorization::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceAuthorization {
    #[sea_orm(iden = "device_authorizations")]
    Table,
    DeviceCode,
    UserCode,
    ClientId,
    Scope,
    VerificationUri,
    VerificationUriComplete,
    Status,
    Subject,
    ExpiresIn,
    Interval,
    LastPollAt,
    CreatedAt,
    UpdatedAt,
}
