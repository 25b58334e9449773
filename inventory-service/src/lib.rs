mod models;
pub mod store;
pub mod sweeper;

pub use models::Checkout;
pub use store::{InventoryReservationStore, StoreConfig};
pub use sweeper::{ExpirySweeper, SweepReport};
