use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Session metadata for an issued access token that carries a refresh token.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub refresh_token: String,
    pub access_token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
