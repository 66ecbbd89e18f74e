use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::ClientId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_null(Clients::ClientSecret))
                    .col(string_null(Clients::RedirectUri))
                    .col(string_null(Clients::Name))
                    .col(big_integer(Clients::CreatedAt))
                    .col(big_integer(Clients::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // Key-value entries; the signing key pair lives here
        manager
            .create_table(
                Table::create()
                    .table(Properties::Table)
                    .if_not_exists()
                    .col(string(Properties::Owner))
                    .col(string(Properties::Key))
                    .col(string(Properties::Value))
                    .col(big_integer(Properties::UpdatedAt))
                    .col(big_integer_null(Properties::ExpiresAt))
                    .primary_key(Index::create().col(Properties::Owner).col(Properties::Key))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Subject)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Users::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(Users::PasswordHash))
                    .col(big_integer(Users::CreatedAt))
                    .col(
                        ColumnDef::new(Users::Enabled)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AuthCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthCodes::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AuthCodes::ClientId))
                    .col(string(AuthCodes::Subject))
                    .col(string_null(AuthCodes::RedirectUri))
                    .col(string_null(AuthCodes::Scope))
                    .col(string_null(AuthCodes::CodeChallenge))
                    .col(string_null(AuthCodes::CodeChallengeMethod))
                    .col(big_integer(AuthCodes::CreatedAt))
                    .col(big_integer(AuthCodes::ExpiresAt))
                    .col(
                        ColumnDef::new(AuthCodes::Consumed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_codes_expires")
                    .table(AuthCodes::Table)
                    .col(AuthCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tokens::RefreshToken)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Tokens::AccessToken))
                    .col(string(Tokens::ClientId))
                    .col(string(Tokens::Subject))
                    .col(string_null(Tokens::Scope))
                    .col(big_integer(Tokens::CreatedAt))
                    .col(big_integer(Tokens::ExpiresAt))
                    .col(
                        ColumnDef::new(Tokens::Revoked)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tokens_expires")
                    .table(Tokens::Table)
                    .col(Tokens::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthCodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Properties::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    ClientId,
    ClientSecret,
    RedirectUri,
    Name,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Properties {
    Table,
    Owner,
    Key,
    Value,
    UpdatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Subject,
    Username,
    PasswordHash,
    CreatedAt,
    Enabled,
}

#[derive(DeriveIden)]
enum AuthCodes {
    Table,
    Code,
    ClientId,
    Subject,
    RedirectUri,
    Scope,
    CodeChallenge,
    CodeChallengeMethod,
    CreatedAt,
    ExpiresAt,
    Consumed,
}

#[derive(DeriveIden)]
enum Tokens {
    Table,
    RefreshToken,
    AccessToken,
    ClientId,
    Subject,
    Scope,
    CreatedAt,
    ExpiresAt,
    Revoked,
}
