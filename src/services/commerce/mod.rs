/// Commerce services: carts, totals, customers and orders
pub mod cart_service;
pub mod cart_total;
pub mod customer_service;
pub mod order_service;

pub use cart_service::{CartLineView, CartService, CartView};
pub use cart_total::{CartLine, CartTotal, CartTotalCalculator};
pub use customer_service::{CustomerService, RegisterCustomerInput};
pub use order_service::{AddressInput, CreateOrderInput, OrderService, OrderWithItems};
