use crate::{
    entities::commerce::CustomerModel,
    errors::ServiceError,
    services::{
        commerce::{AddressInput, CartService, CartView, CreateOrderInput, OrderService},
        payments::{
            GatewayRegistry, Locale, OrderPayable, PaymentContext, PaymentMethodDescriptor,
        },
    },
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 64))]
    pub payment_method: String,
    #[validate(length(max = 64))]
    pub promo_code: Option<String>,
    #[validate]
    pub shipping_address: Option<AddressInput>,
    #[validate]
    pub billing_address: Option<AddressInput>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order_number: String,
    pub payment_id: Uuid,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutSummary {
    pub cart: CartView,
    pub payment_methods: Vec<PaymentMethodDescriptor>,
}

/// Turns the shopper's cart into an order and a provider session.
#[derive(Clone)]
pub struct CheckoutService {
    carts: CartService,
    orders: OrderService,
    gateways: GatewayRegistry,
}

impl CheckoutService {
    pub fn new(carts: CartService, orders: OrderService, gateways: GatewayRegistry) -> Self {
        Self {
            carts,
            orders,
            gateways,
        }
    }

    /// Cart totals plus the payment methods available for them.
    pub async fn summary(
        &self,
        customer_id: Uuid,
        locale: Locale,
    ) -> Result<CheckoutSummary, ServiceError> {
        let cart = self.carts.get_or_create_for_customer(customer_id).await?;
        let cart = self.carts.get_cart(cart.id).await?;
        let payment_methods = if cart.items.is_empty() {
            Vec::new()
        } else {
            self.gateways.payment_methods(&cart.totals.total, locale)
        };
        Ok(CheckoutSummary {
            cart,
            payment_methods,
        })
    }

    /// Creates the order and opens the provider session.
    ///
    /// The cart is left intact; it is cleared once the payment succeeds.
    #[instrument(skip(self, customer, request), fields(customer_id = %customer.id, method = %request.payment_method))]
    pub async fn checkout(
        &self,
        customer: CustomerModel,
        locale: Locale,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;

        let cart = self.carts.get_or_create_for_customer(customer.id).await?;
        let view = self.carts.get_cart(cart.id).await?;
        if view.items.is_empty() {
            return Err(ServiceError::EmptyCart);
        }
        // Resolve before materializing so an unknown method leaves no order behind.
        let gateway = self
            .gateways
            .for_method(&request.payment_method, &view.totals.total, locale)?;

        let order = self
            .orders
            .create_order_from_cart(CreateOrderInput {
                customer_id: customer.id,
                cart_id: cart.id,
                promo_code: request.promo_code,
                shipping_address: request.shipping_address,
                billing_address: request.billing_address,
                clear_cart: false,
            })
            .await?;
        let order_number = order.order.order_number.clone();
        let payable = OrderPayable::new(order)?;

        let started = gateway
            .start(
                &payable,
                &request.payment_method,
                &PaymentContext { customer, locale },
            )
            .await?;

        info!(%order_number, payment_id = %started.payment.id, "Checkout started");
        Ok(CheckoutResponse {
            order_number,
            payment_id: started.payment.id,
            redirect_url: started.redirect_url,
        })
    }
}
