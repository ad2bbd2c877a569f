// Carts, customers and order materialization
pub mod commerce;

// Gateways, reconciliation and checkout orchestration
pub mod checkout;
pub mod payments;
