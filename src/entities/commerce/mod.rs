pub mod cart;
pub mod cart_item;
pub mod customer;
pub mod product;

pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use customer::{Entity as Customer, Model as CustomerModel};
pub use product::{Entity as Product, Model as ProductModel};
