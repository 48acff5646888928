pub mod inventory_service;
pub mod order_service;
pub mod record_service;

pub use inventory_service::InventoryError;
pub use record_service::UnitKey;
