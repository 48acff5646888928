pub mod entities;
pub mod enums;
pub mod schema;
pub mod services;

pub use schema::sync_schema;
