pub mod carts;
pub mod checkout;
pub mod idempotency;
pub mod inventory;
pub mod reservations;
pub mod sweeper;

pub use carts::CartService;
pub use checkout::CheckoutService;
pub use idempotency::IdempotencyService;
pub use inventory::InventoryService;
pub use reservations::ReservationService;
pub use sweeper::ReservationSweeper;
