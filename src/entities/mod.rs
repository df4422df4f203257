pub mod cart;
pub mod cart_line;
pub mod idempotency_record;
pub mod low_stock_signal;
pub mod order;
pub mod order_line;
pub mod product;
pub mod reservation;
pub mod reservation_line;
