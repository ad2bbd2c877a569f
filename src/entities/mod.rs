pub mod commerce;
pub mod order;
pub mod order_item;
pub mod payment;

pub use commerce::{cart, cart_item, customer, product};
