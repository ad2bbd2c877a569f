use crate::{
    handlers::common::{success_response, validate_input, CustomerContext},
    services::commerce::CartView,
    errors::{ErrorResponse, ServiceError},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for the shopper's cart
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:product_id", put(set_item_quantity).delete(remove_item))
        .route("/items/:product_id/decrement", post(decrement_item))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateQuantityRequest {
    /// Zero removes the line
    #[validate(range(min = 0, max = 1000))]
    pub quantity: i32,
}

async fn current_cart_id(state: &AppState, customer: &CustomerContext) -> Result<Uuid, ServiceError> {
    Ok(state
        .services
        .carts
        .get_or_create_for_customer(customer.id())
        .await?
        .id)
}

/// Current cart with totals
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    responses(
        (status = 200, description = "Cart with lines and totals", body = CartView),
        (status = 401, description = "No shopper", body = ErrorResponse)
    ),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    customer: CustomerContext,
) -> Result<impl IntoResponse, ServiceError> {
    let cart_id = current_cart_id(&state, &customer).await?;
    let cart = state.services.carts.get_cart(cart_id).await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    request_body = AddItemRequest,
    responses(
        (status = 200, description = "Item added", body = CartView),
        (status = 400, description = "Invalid quantity", body = ErrorResponse),
        (status = 404, description = "Unknown product", body = ErrorResponse)
    ),
    tag = "Cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    customer: CustomerContext,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart_id = current_cart_id(&state, &customer).await?;
    let cart = state
        .services
        .carts
        .add_item(cart_id, payload.product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart/items/{product_id}",
    params(("product_id" = Uuid, Path, description = "Product in the cart")),
    request_body = UpdateQuantityRequest,
    responses(
        (status = 200, description = "Quantity updated", body = CartView),
        (status = 404, description = "Product not in cart", body = ErrorResponse)
    ),
    tag = "Cart"
)]
pub async fn set_item_quantity(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart_id = current_cart_id(&state, &customer).await?;
    let cart = state
        .services
        .carts
        .set_item_quantity(cart_id, product_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    post,
    path = "/api/v1/cart/items/{product_id}/decrement",
    params(("product_id" = Uuid, Path, description = "Product in the cart")),
    responses(
        (status = 200, description = "Quantity decremented", body = CartView),
        (status = 404, description = "Product not in cart", body = ErrorResponse)
    ),
    tag = "Cart"
)]
pub async fn decrement_item(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart_id = current_cart_id(&state, &customer).await?;
    let cart = state
        .services
        .carts
        .decrement_item(cart_id, product_id)
        .await?;
    Ok(success_response(cart))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/items/{product_id}",
    params(("product_id" = Uuid, Path, description = "Product in the cart")),
    responses((status = 200, description = "Line removed", body = CartView)),
    tag = "Cart"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart_id = current_cart_id(&state, &customer).await?;
    let cart = state.services.carts.remove_item(cart_id, product_id).await?;
    Ok(success_response(cart))
}
