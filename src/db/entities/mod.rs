//! SeaORM entities for the provisioning tables.

pub mod order;
pub mod order_line_item;
pub mod provisioning_record;
pub mod server;
pub mod server_client;
pub mod server_inbound;
pub mod server_plan;

pub mod prelude {
    pub use super::order::Entity as Order;
    pub use super::order::Model as OrderModel;
    pub use super::order::ActiveModel as OrderActiveModel;
    pub use super::order::Column as OrderColumn;

    pub use super::order_line_item::Entity as OrderLineItem;
    pub use super::order_line_item::Model as OrderLineItemModel;
    pub use super::order_line_item::ActiveModel as OrderLineItemActiveModel;
    pub use super::order_line_item::Column as OrderLineItemColumn;

    pub use super::provisioning_record::Entity as ProvisioningRecord;
    pub use super::provisioning_record::Model as ProvisioningRecordModel;
    pub use super::provisioning_record::ActiveModel as ProvisioningRecordActiveModel;
    pub use super::provisioning_record::Column as ProvisioningRecordColumn;

    pub use super::server::Entity as Server;
    pub use super::server::Model as ServerModel;
    pub use super::server::ActiveModel as ServerActiveModel;
    pub use super::server::Column as ServerColumn;

    pub use super::server_client::Entity as ServerClient;
    pub use super::server_client::Model as ServerClientModel;
    pub use super::server_client::ActiveModel as ServerClientActiveModel;
    pub use super::server_client::Column as ServerClientColumn;

    pub use super::server_inbound::Entity as ServerInbound;
    pub use super::server_inbound::Model as ServerInboundModel;
    pub use super::server_inbound::ActiveModel as ServerInboundActiveModel;
    pub use super::server_inbound::Column as ServerInboundColumn;

    pub use super::server_plan::Entity as ServerPlan;
    pub use super::server_plan::Model as ServerPlanModel;
    pub use super::server_plan::ActiveModel as ServerPlanActiveModel;
    pub use super::server_plan::Column as ServerPlanColumn;
}
