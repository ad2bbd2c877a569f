//! Anything a payment can be collected for.

use crate::{
    entities::{order, payment::PayableKind},
    errors::ServiceError,
    money::{Currency, Money, MoneyError},
    services::commerce::order_service::{load_order, AddressInput, OrderWithItems},
};
use rust_decimal::Decimal;
use sea_orm::ConnectionTrait;
use uuid::Uuid;

/// Line reported to providers.
#[derive(Debug, Clone, PartialEq)]
pub struct PayableItem {
    pub reference_id: String,
    pub title: String,
    pub category: Option<String>,
    pub quantity: i32,
    pub unit_price: Money,
}

pub trait Payable: Send + Sync {
    fn kind(&self) -> PayableKind;
    fn id(&self) -> Uuid;
    /// Human-facing reference such as an order number
    fn reference(&self) -> &str;
    fn items(&self) -> Vec<PayableItem>;
    /// The authoritative amount to collect
    fn total_price(&self) -> Money;
    fn owner_customer(&self) -> Uuid;

    fn tax_amount(&self) -> Money {
        Money::zero(self.total_price().currency().clone())
    }

    fn shipping_amount(&self) -> Money {
        Money::zero(self.total_price().currency().clone())
    }

    fn discount_amount(&self) -> Money {
        Money::zero(self.total_price().currency().clone())
    }

    fn shipping_address(&self) -> Option<AddressInput> {
        None
    }

    fn billing_address(&self) -> Option<AddressInput> {
        None
    }
}

/// An order together with its frozen lines.
#[derive(Debug, Clone)]
pub struct OrderPayable {
    order: order::Model,
    items: Vec<crate::entities::order_item::Model>,
    currency: Currency,
}

impl OrderPayable {
    pub fn new(order: OrderWithItems) -> Result<Self, MoneyError> {
        let currency = Currency::new(&order.order.currency)?;
        Ok(Self {
            order: order.order,
            items: order.items,
            currency,
        })
    }

    pub fn order(&self) -> &order::Model {
        &self.order
    }

    fn money(&self, amount: Decimal) -> Money {
        Money::of(amount, self.currency.clone())
    }
}

impl Payable for OrderPayable {
    fn kind(&self) -> PayableKind {
        PayableKind::Order
    }

    fn id(&self) -> Uuid {
        self.order.id
    }

    fn reference(&self) -> &str {
        &self.order.order_number
    }

    fn items(&self) -> Vec<PayableItem> {
        self.items
            .iter()
            .map(|item| PayableItem {
                reference_id: item
                    .product_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| item.id.to_string()),
                title: item.product_name.clone(),
                category: item.category.clone(),
                quantity: item.quantity,
                unit_price: self.money(item.unit_price),
            })
            .collect()
    }

    fn total_price(&self) -> Money {
        self.money(self.order.total)
    }

    fn owner_customer(&self) -> Uuid {
        self.order.customer_id
    }

    fn tax_amount(&self) -> Money {
        self.money(self.order.tax_amount)
    }

    fn shipping_amount(&self) -> Money {
        self.money(self.order.shipping_amount)
    }

    fn discount_amount(&self) -> Money {
        self.money(self.order.discount_amount)
    }

    fn shipping_address(&self) -> Option<AddressInput> {
        let o = &self.order;
        address_if_any(AddressInput {
            name: o.shipping_name.clone(),
            address: o.shipping_address.clone(),
            city: o.shipping_city.clone(),
            state: o.shipping_state.clone(),
            zip: o.shipping_zip.clone(),
            country: o.shipping_country.clone(),
            phone: o.shipping_phone.clone(),
        })
    }

    fn billing_address(&self) -> Option<AddressInput> {
        let o = &self.order;
        address_if_any(AddressInput {
            name: o.billing_name.clone(),
            address: o.billing_address.clone(),
            city: o.billing_city.clone(),
            state: o.billing_state.clone(),
            zip: o.billing_zip.clone(),
            country: o.billing_country.clone(),
            phone: o.billing_phone.clone(),
        })
    }
}

fn address_if_any(address: AddressInput) -> Option<AddressInput> {
    (address != AddressInput::default()).then_some(address)
}

/// Payable loaded from the `(payable_type, payable_id)` pair stored on a payment.
#[derive(Debug, Clone)]
pub enum PayableRecord {
    Order(OrderPayable),
}

impl PayableRecord {
    pub async fn load<C: ConnectionTrait>(
        conn: &C,
        kind: PayableKind,
        id: Uuid,
    ) -> Result<Self, ServiceError> {
        match kind {
            PayableKind::Order => {
                let order = load_order(conn, id).await?;
                Ok(Self::Order(OrderPayable::new(order)?))
            }
        }
    }

    pub fn as_payable(&self) -> &dyn Payable {
        match self {
            Self::Order(order) => order,
        }
    }
}
