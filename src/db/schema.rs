//! Bootstraps the provisioning tables straight from the entity definitions.

use sea_orm::sea_query::{Index, IndexCreateStatement, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};
use tracing::info;

use crate::db::entities::{
    order, order_line_item, provisioning_record, server, server_client, server_inbound,
    server_plan,
};

pub const PROVISIONING_UNIT_INDEX: &str = "uq_provisioning_records_unit";

fn table<E: EntityTrait>(schema: &Schema, entity: E) -> TableCreateStatement {
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    stmt
}

fn unit_unique_index() -> IndexCreateStatement {
    Index::create()
        .name(PROVISIONING_UNIT_INDEX)
        .table(provisioning_record::Entity)
        .col(provisioning_record::Column::OrderId)
        .col(provisioning_record::Column::LineItemId)
        .col(provisioning_record::Column::UnitIndex)
        .unique()
        .if_not_exists()
        .to_owned()
}

/// Creates every table (if missing) plus the unique index that backs the
/// idempotency gate on provisioning units.
pub async fn sync_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    // Referenced tables first.
    let tables = [
        table(&schema, server::Entity),
        table(&schema, server_inbound::Entity),
        table(&schema, server_plan::Entity),
        table(&schema, order::Entity),
        table(&schema, order_line_item::Entity),
        table(&schema, provisioning_record::Entity),
        table(&schema, server_client::Entity),
    ];
    for stmt in &tables {
        db.execute(backend.build(stmt)).await?;
    }
    db.execute(backend.build(&unit_unique_index())).await?;

    info!("Provisioning schema is up to date.");
    Ok(())
}
