pub mod delivery_routes;
pub mod order_routes;

pub use delivery_routes::delivery_routes;
pub use order_routes::order_routes;
