use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credential_quota_states")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "credential_quota_state_credential_id")]
    pub credential_id: i64,
    pub usage_date: String,
    pub model_usage_json: Json,
    pub category_usage_json: Json,
    pub error_status: Option<i32>,
    pub consecutive_429_json: Json,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "credential_id", to = "id", on_delete = "Cascade")]
    pub credential: HasOne<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
