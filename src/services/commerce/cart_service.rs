use crate::{
    entities::commerce::{cart, cart_item, product, Cart, CartItem, CartModel, Product},
    errors::ServiceError,
    events::{Event, EventSender},
    money::Money,
    services::commerce::cart_total::{CartLine, CartTotal, CartTotalCalculator},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Shopping cart service.
///
/// Items reference products; prices are read live whenever lines or totals
/// are loaded, so totals follow catalogue price changes until checkout.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    calculator: CartTotalCalculator,
}

/// Cart line as shown to the shopper
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartLineView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Money,
    pub line_total: Money,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartView {
    pub cart_id: Uuid,
    pub items: Vec<CartLineView>,
    pub totals: CartTotal,
}

impl CartService {
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

    /// Returns the customer's cart, creating it on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        if let Some(cart) = Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
        {
            return Ok(cart);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(Some(customer_id)),
            session_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(cart_id = %cart.id, %customer_id, "Created customer cart");
        Ok(cart)
    }

    /// Returns the guest cart for a session, creating it on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create_for_session(
        &self,
        session_id: &str,
    ) -> Result<CartModel, ServiceError> {
        if session_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "session id is required".to_string(),
            ));
        }

        if let Some(cart) = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::CustomerId.is_null())
            .one(&*self.db)
            .await?
        {
            return Ok(cart);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(None),
            session_id: Set(Some(session_id.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(cart_id = %cart.id, "Created guest cart");
        Ok(cart)
    }

    /// Adds `quantity` of a product, incrementing an existing line.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be a positive integer".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        Product::find_by_id(product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let now = Utc::now();
        match find_line(&txn, cart_id, product_id).await? {
            Some(item) => {
                let current = item.quantity;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(current + quantity);
                item.updated_at = Set(now);
                item.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        info!(%cart_id, %product_id, quantity, "Added item to cart");
        self.get_cart(cart_id).await
    }

    /// Decrements a line by one, removing it when it reaches zero.
    #[instrument(skip(self))]
    pub async fn decrement_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let item = find_line(&*self.db, cart_id, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} is not in the cart", product_id))
            })?;
        let quantity = item.quantity - 1;
        self.set_item_quantity(cart_id, product_id, quantity).await
    }

    /// Sets a line's quantity; zero removes it.
    #[instrument(skip(self))]
    pub async fn set_item_quantity(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "quantity cannot be negative".to_string(),
            ));
        }

        let item = find_line(&*self.db, cart_id, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} is not in the cart", product_id))
            })?;

        if quantity == 0 {
            CartItem::delete_by_id(item.id).exec(&*self.db).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&*self.db).await?;
        }

        self.get_cart(cart_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;
        self.get_cart(cart_id).await
    }

    /// Deletes every item in the cart. Clearing an empty cart is a no-op.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<u64, ServiceError> {
        let removed = delete_items(&*self.db, cart_id).await?;
        if removed > 0 {
            info!(%cart_id, removed, "Cleared cart");
            self.event_sender.send_or_log(Event::CartCleared {
                cart_id,
                removed_items: removed,
            });
        }
        Ok(removed)
    }

    /// Clears the cart owned by `customer_id`, if there is one.
    #[instrument(skip(self))]
    pub async fn clear_customer_cart(&self, customer_id: Uuid) -> Result<u64, ServiceError> {
        let cart = Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?;
        match cart {
            Some(cart) => self.clear_cart(cart.id).await,
            None => Ok(0),
        }
    }

    pub async fn totals(&self, cart_id: Uuid) -> Result<CartTotal, ServiceError> {
        let lines = load_lines(&*self.db, cart_id).await?;
        Ok(self.calculator.calculate(&lines)?)
    }

    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        let lines = load_lines(&*self.db, cart_id).await?;
        let totals = self.calculator.calculate(&lines)?;

        let items = lines
            .iter()
            .map(|line| {
                let line_total = line.line_total()?.round_half_up();
                Ok(CartLineView {
                    product_id: line.product.id,
                    name: line.product.name.clone(),
                    quantity: line.quantity,
                    unit_price: Money::of(
                        line.product.effective_price(),
                        line_total.currency().clone(),
                    ),
                    line_total,
                })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        Ok(CartView {
            cart_id,
            items,
            totals,
        })
    }
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    product_id: Uuid,
) -> Result<Option<cart_item::Model>, ServiceError> {
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .filter(cart_item::Column::ProductId.eq(product_id))
        .one(conn)
        .await?)
}

/// Cart lines joined with live product rows, in insertion order.
pub async fn load_lines<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<CartLine>, ServiceError> {
    let rows = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .find_also_related(product::Entity)
        .all(conn)
        .await?;

    let mut lines = Vec::with_capacity(rows.len());
    for (item, product) in rows {
        match product {
            Some(product) if item.quantity > 0 => lines.push(CartLine {
                product,
                quantity: item.quantity,
            }),
            Some(_) => warn!(item_id = %item.id, "Skipping cart line with non-positive quantity"),
            None => warn!(item_id = %item.id, "Skipping cart line with missing product"),
        }
    }
    Ok(lines)
}

/// Idempotent delete of every item in a cart.
pub async fn delete_items<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<u64, ServiceError> {
    let result = CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Sum of the quantities in a cart.
pub async fn item_count<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<i64, ServiceError> {
    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .all(conn)
        .await?;
    Ok(items.iter().map(|i| i64::from(i.quantity)).sum())
}
