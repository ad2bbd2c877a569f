use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::Money,
    services::commerce::{
        cart_service::{delete_items, load_lines},
        cart_total::CartTotalCalculator,
    },
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

const ORDER_NUMBER_PREFIX: &str = "ORD-";
const MAX_ORDER_NUMBER_ATTEMPTS: usize = 16;

/// Postal address captured at checkout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct AddressInput {
    #[validate(length(max = 255))]
    pub name: Option<String>,
    #[validate(length(max = 500))]
    pub address: Option<String>,
    #[validate(length(max = 120))]
    pub city: Option<String>,
    #[validate(length(max = 120))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub zip: Option<String>,
    #[validate(length(equal = 2))]
    pub country: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub customer_id: Uuid,
    pub cart_id: Uuid,
    pub promo_code: Option<String>,
    pub shipping_address: Option<AddressInput>,
    pub billing_address: Option<AddressInput>,
    /// Delete the cart items in the same transaction
    pub clear_cart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Materializes carts into orders and answers order-history queries.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    calculator: CartTotalCalculator,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        calculator: CartTotalCalculator,
    ) -> Self {
        Self {
            db,
            event_sender,
            calculator,
        }
    }

    /// Creates an order and its items from the cart in one transaction.
    ///
    /// Totals are recomputed from live product prices. Item prices are
    /// copied onto the order lines so later catalogue changes do not
    /// affect the order.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id, customer_id = %input.customer_id))]
    pub async fn create_order_from_cart(
        &self,
        input: CreateOrderInput,
    ) -> Result<OrderWithItems, ServiceError> {
        if let Some(address) = &input.shipping_address {
            address.validate()?;
        }
        if let Some(address) = &input.billing_address {
            address.validate()?;
        }

        let txn = self.db.begin().await?;

        let lines = load_lines(&txn, input.cart_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let totals = self.calculator.calculate(&lines)?;
        let discount = self.discount_for(input.promo_code.as_deref(), &totals.subtotal);
        // Tax stays on the undiscounted subtotal until discounts carry a real value.
        let total = totals.total.checked_sub(&discount)?;

        let order_number = generate_unique_order_number(&txn).await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let shipping = input.shipping_address.clone().unwrap_or_default();
        let billing = input.billing_address.clone().unwrap_or_default();

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            customer_id: Set(input.customer_id),
            status: Set(OrderStatus::New),
            currency: Set(totals.total.currency().code().to_string()),
            subtotal: Set(totals.subtotal.amount()),
            shipping_amount: Set(totals.shipping.amount()),
            tax_amount: Set(totals.tax.amount()),
            discount_amount: Set(discount.amount()),
            total: Set(total.amount()),
            promo_code: Set(input.promo_code.clone()),
            shipping_name: Set(shipping.name),
            shipping_address: Set(shipping.address),
            shipping_city: Set(shipping.city),
            shipping_state: Set(shipping.state),
            shipping_zip: Set(shipping.zip),
            shipping_country: Set(shipping.country),
            shipping_phone: Set(shipping.phone),
            billing_name: Set(billing.name),
            billing_address: Set(billing.address),
            billing_city: Set(billing.city),
            billing_state: Set(billing.state),
            billing_zip: Set(billing.zip),
            billing_country: Set(billing.country),
            billing_phone: Set(billing.phone),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let unit_price = line.product.effective_price();
            let subtotal = unit_price * Decimal::from(line.quantity);
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(Some(line.product.id)),
                product_name: Set(line.product.name.clone()),
                category: Set(line.product.category.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(unit_price),
                subtotal: Set(subtotal),
                total: Set(subtotal),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        if input.clear_cart {
            delete_items(&txn, input.cart_id).await?;
        }

        txn.commit().await?;

        info!(%order_id, %order_number, total = %total, "Order created from cart");
        self.event_sender.send_or_log(Event::OrderCreated {
            order_id,
            order_number,
        });

        Ok(OrderWithItems { order, items })
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        load_order(&*self.db, order_id).await
    }

    /// Most recent orders for a customer, newest first, excluding `exclude`.
    pub async fn recent_orders(
        &self,
        customer_id: Uuid,
        exclude: Option<Uuid>,
        limit: u64,
    ) -> Result<Vec<OrderWithItems>, ServiceError> {
        let mut query = order::Entity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .limit(limit);
        if let Some(exclude) = exclude {
            query = query.filter(order::Column::Id.ne(exclude));
        }

        let mut history = Vec::new();
        for order in query.all(&*self.db).await? {
            let items = order_item::Entity::find()
                .filter(order_item::Column::OrderId.eq(order.id))
                .all(&*self.db)
                .await?;
            history.push(OrderWithItems { order, items });
        }
        Ok(history)
    }

    /// Number of the customer's completed orders, excluding `exclude`.
    pub async fn completed_order_count(
        &self,
        customer_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<u64, ServiceError> {
        let mut query = order::Entity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .filter(order::Column::Status.eq(OrderStatus::Complete));
        if let Some(exclude) = exclude {
            query = query.filter(order::Column::Id.ne(exclude));
        }
        Ok(query.count(&*self.db).await?)
    }

    /// Promo codes are accepted but do not discount anything yet.
    fn discount_for(&self, promo_code: Option<&str>, subtotal: &Money) -> Money {
        if let Some(code) = promo_code {
            warn!(promo_code = code, "Promo codes carry no discount; applying zero");
        }
        Money::zero(subtotal.currency().clone())
    }
}

pub async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderWithItems, ServiceError> {
    let order = order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(OrderWithItems { order, items })
}

/// "ORD-" followed by 13 uppercase hex characters.
pub fn random_order_number() -> String {
    let value: u64 = rand::thread_rng().gen_range(0..(1u64 << 52));
    format!("{}{:013X}", ORDER_NUMBER_PREFIX, value)
}

async fn generate_unique_order_number<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..MAX_ORDER_NUMBER_ATTEMPTS {
        let candidate = random_order_number();
        let taken = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(candidate.as_str()))
            .count(conn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
        warn!(order_number = %candidate, "Order number collision; regenerating");
    }
    Err(ServiceError::InternalError(
        "could not allocate a unique order number".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_have_expected_shape() {
        for _ in 0..100 {
            let number = random_order_number();
            assert!(number.starts_with("ORD-"));
            let suffix = &number[4..];
            assert_eq!(suffix.len(), 13);
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn address_validation_rejects_long_country() {
        let address = AddressInput {
            country: Some("SAU".into()),
            ..Default::default()
        };
        assert!(address.validate().is_err());
    }
}
