//! Shopper-facing commerce endpoints.
pub mod carts;
pub mod checkout;

pub use carts::cart_routes;
pub use checkout::checkout_routes;
