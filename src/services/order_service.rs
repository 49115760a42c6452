use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CheckoutRequest, CheckoutResponse, OrderList},
    error::{AppError, AppResult},
    live::Live,
    middleware::auth::AuthUser,
    models::{Order, OrderStatus, PaymentMethod, Product},
    response::ApiResponse,
    services::cart_service,
    state::AppState,
    store::{Filter, OrderBy, collections},
};

/// Place an order from the caller's current cart: one atomic transaction
/// verifies stock for every line item, writes the decremented stock and the
/// order document together, or aborts with no effects at all. The cart is
/// cleared afterwards, outside the transaction; a crash in between leaves a
/// stale cart that the next reconciliation pass or checkout cleans up.
pub async fn place_order(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<CheckoutResponse>> {
    let cart = cart_service::get_cart(state, user).await?;
    if cart.items.is_empty() {
        return Err(AppError::Validation("cart is empty".into()));
    }
    if payload.shipping_address.trim().is_empty() {
        return Err(AppError::Validation(
            "shipping address must not be empty".into(),
        ));
    }
    if payload.payment_method == PaymentMethod::Transfer
        && payload
            .payment_proof_base64
            .as_deref()
            .is_none_or(|proof| proof.is_empty())
    {
        return Err(AppError::Validation(
            "payment proof is required for transfer orders".into(),
        ));
    }

    let order_id = Uuid::new_v4();
    let user_id = user.user_id;
    let user_name = user.name.clone();
    let created_at = Utc::now();
    let status = match payload.payment_method {
        PaymentMethod::Cod => OrderStatus::WaitingConfirmation,
        PaymentMethod::Transfer => OrderStatus::Pending,
    };
    let payment_proof = match payload.payment_method {
        PaymentMethod::Cod => None,
        PaymentMethod::Transfer => payload.payment_proof_base64.clone(),
    };

    state
        .store
        .run_transaction(|txn| {
            for item in &cart.items {
                let product: Product = match txn.get(collections::PRODUCTS, item.product_id) {
                    Some(doc) => doc.to()?,
                    // The product vanished between reconciliation and
                    // checkout; report it as out of stock.
                    None => {
                        return Err(AppError::StockInsufficient {
                            name: item.product_name.clone(),
                            available: 0,
                        });
                    }
                };
                if product.stock < item.quantity {
                    return Err(AppError::StockInsufficient {
                        name: product.name,
                        available: product.stock,
                    });
                }
                txn.update(
                    collections::PRODUCTS,
                    item.product_id,
                    json!({ "stock": product.stock - item.quantity }),
                );
            }

            let order = Order {
                id: order_id,
                user_id,
                user_name: user_name.clone(),
                items: cart.items.clone(),
                total_price: cart.total_price(),
                shipping_address: payload.shipping_address.clone(),
                payment_method: payload.payment_method,
                payment_proof_base64: payment_proof.clone(),
                status,
                created_at,
                shipping_receipt: None,
            };
            txn.set(collections::ORDERS, order_id, &order)?;
            Ok(order_id)
        })
        .await?;

    cart_service::clear_cart(state, user).await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(json!({ "order_id": order_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order placed",
        CheckoutResponse { order_id },
    ))
}

pub async fn order_history(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<OrderList>> {
    let docs = state
        .store
        .query(
            collections::ORDERS,
            &Filter::all().field_eq("user_id", json!(user.user_id)),
            Some(&OrderBy::desc("created_at")),
        )
        .await;
    Ok(ApiResponse::success(
        "Orders",
        OrderList {
            items: super::decode_all(&docs),
        },
    ))
}

pub async fn watch_order_history(state: &AppState, user: &AuthUser) -> Live<Vec<Order>> {
    let sub = state
        .store
        .subscribe(
            collections::ORDERS,
            Filter::all().field_eq("user_id", json!(user.user_id)),
            Some(OrderBy::desc("created_at")),
        )
        .await;
    sub.map(|docs| super::decode_all(docs))
}

pub async fn get_order(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<ApiResponse<Order>> {
    let order: Order = state
        .store
        .get(collections::ORDERS, id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;
    if order.user_id != user.user_id {
        return Err(AppError::NotFound);
    }
    Ok(ApiResponse::success("OK", order))
}

/// Customer confirmation that a shipped order arrived.
pub async fn confirm_received(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    let mut order: Order = state
        .store
        .get(collections::ORDERS, id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;
    if order.user_id != user.user_id {
        return Err(AppError::NotFound);
    }
    if !order.status.can_transition_to(OrderStatus::Completed) {
        return Err(AppError::Validation(
            "order has not been shipped yet".into(),
        ));
    }

    order.status = OrderStatus::Completed;
    state
        .store
        .update(
            collections::ORDERS,
            id,
            json!({ "status": OrderStatus::Completed }),
        )
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "order_received",
        Some("orders"),
        Some(json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Order completed", order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dto::cart::AddToCartRequest;
    use crate::models::{Cart, UserRole};
    use crate::store::MemoryStore;

    fn test_state() -> AppState {
        AppState::new(
            MemoryStore::new(),
            AppConfig {
                host: "127.0.0.1".into(),
                port: 0,
                jwt_secret: "test-secret".into(),
                admin_email: "admin@example.com".into(),
                admin_password: "admin123".into(),
            },
        )
    }

    fn customer() -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            name: "Customer".into(),
            role: UserRole::User,
        }
    }

    async fn seed_product(state: &AppState, name: &str, price: i64, stock: i32) -> Product {
        let product = Product {
            id: Uuid::new_v4(),
            name: name.into(),
            description: format!("{name} description"),
            price,
            stock,
            category: "guitars".into(),
            image_base64: None,
            created_at: Utc::now(),
        };
        state
            .store
            .set(collections::PRODUCTS, product.id, &product)
            .await
            .unwrap();
        product
    }

    async fn fill_cart(state: &AppState, user: &AuthUser, product_id: Uuid, quantity: i32) {
        cart_service::add_to_cart(
            state,
            user,
            AddToCartRequest {
                product_id,
                quantity,
            },
        )
        .await
        .unwrap();
    }

    async fn stock_of(state: &AppState, id: Uuid) -> i32 {
        state
            .store
            .get(collections::PRODUCTS, id)
            .await
            .unwrap()
            .to::<Product>()
            .unwrap()
            .stock
    }

    fn cod_checkout() -> CheckoutRequest {
        CheckoutRequest {
            shipping_address: "Jl. Mawar 1".into(),
            payment_method: PaymentMethod::Cod,
            payment_proof_base64: None,
        }
    }

    #[tokio::test]
    async fn cod_checkout_decrements_stock_and_creates_waiting_order() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 5).await;
        fill_cart(&state, &user, product.id, 2).await;

        let resp = place_order(&state, &user, cod_checkout()).await.unwrap();
        let order_id = resp.data.unwrap().order_id;

        assert_eq!(stock_of(&state, product.id).await, 3);

        let order: Order = state
            .store
            .get(collections::ORDERS, order_id)
            .await
            .unwrap()
            .to()
            .unwrap();
        assert_eq!(order.status, OrderStatus::WaitingConfirmation);
        assert_eq!(order.payment_proof_base64, None);
        assert_eq!(order.total_price, 200_000);
        assert_eq!(order.user_name, "Customer");

        // Cart is cleared after a successful checkout.
        let cart: Cart = state
            .store
            .get(collections::CARTS, user.user_id)
            .await
            .unwrap()
            .to()
            .unwrap();
        assert!(cart.items.is_empty());
    }

    #[tokio::test]
    async fn transfer_checkout_stores_proof_and_starts_pending() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 5).await;
        fill_cart(&state, &user, product.id, 1).await;

        let resp = place_order(
            &state,
            &user,
            CheckoutRequest {
                shipping_address: "Jl. Mawar 1".into(),
                payment_method: PaymentMethod::Transfer,
                payment_proof_base64: Some("aGVsbG8=".into()),
            },
        )
        .await
        .unwrap();

        let order: Order = state
            .store
            .get(collections::ORDERS, resp.data.unwrap().order_id)
            .await
            .unwrap()
            .to()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_proof_base64.as_deref(), Some("aGVsbG8="));
    }

    #[tokio::test]
    async fn transfer_checkout_requires_proof() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 5).await;
        fill_cart(&state, &user, product.id, 1).await;

        let result = place_order(
            &state,
            &user,
            CheckoutRequest {
                shipping_address: "Jl. Mawar 1".into(),
                payment_method: PaymentMethod::Transfer,
                payment_proof_base64: None,
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn insufficient_stock_aborts_with_no_partial_effects() {
        let state = test_state();
        let user = customer();
        let plenty = seed_product(&state, "Picks", 5_000, 100).await;
        let scarce = seed_product(&state, "Strat", 100_000, 2).await;
        fill_cart(&state, &user, plenty.id, 10).await;
        fill_cart(&state, &user, scarce.id, 3).await;

        let result = place_order(&state, &user, cod_checkout()).await;
        match result {
            Err(AppError::StockInsufficient { name, available }) => {
                assert_eq!(name, "Strat");
                assert_eq!(available, 2);
            }
            other => panic!("expected StockInsufficient, got {other:?}"),
        }

        // Nothing moved: both stocks intact, no order written, cart kept.
        assert_eq!(stock_of(&state, plenty.id).await, 100);
        assert_eq!(stock_of(&state, scarce.id).await, 2);
        assert_eq!(
            state.store.count(collections::ORDERS, &Filter::all()).await,
            0
        );
        let cart = cart_service::get_cart(&state, &user).await.unwrap();
        assert_eq!(cart.items.len(), 2);
    }

    #[tokio::test]
    async fn empty_cart_cannot_check_out() {
        let state = test_state();
        let user = customer();
        let result = place_order(&state, &user, cod_checkout()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn exact_stock_checkout_drains_to_zero() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 2).await;
        fill_cart(&state, &user, product.id, 2).await;

        place_order(&state, &user, cod_checkout()).await.unwrap();
        assert_eq!(stock_of(&state, product.id).await, 0);
    }

    #[tokio::test]
    async fn history_is_scoped_to_the_user() {
        let state = test_state();
        let alice = customer();
        let bob = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        fill_cart(&state, &alice, product.id, 1).await;
        place_order(&state, &alice, cod_checkout()).await.unwrap();
        fill_cart(&state, &bob, product.id, 1).await;
        place_order(&state, &bob, cod_checkout()).await.unwrap();

        let alice_orders = order_history(&state, &alice).await.unwrap().data.unwrap();
        assert_eq!(alice_orders.items.len(), 1);
        assert_eq!(alice_orders.items[0].user_id, alice.user_id);

        // Cross-user reads are hidden, not forbidden.
        let foreign = get_order(&state, &bob, alice_orders.items[0].id).await;
        assert!(matches!(foreign, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn orders_snapshot_items_against_later_catalog_edits() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;
        fill_cart(&state, &user, product.id, 1).await;
        let resp = place_order(&state, &user, cod_checkout()).await.unwrap();

        state
            .store
            .update(
                collections::PRODUCTS,
                product.id,
                json!({"price": 999_999, "name": "Renamed"}),
            )
            .await
            .unwrap();

        let order: Order = state
            .store
            .get(collections::ORDERS, resp.data.unwrap().order_id)
            .await
            .unwrap()
            .to()
            .unwrap();
        assert_eq!(order.items[0].price, 100_000);
        assert_eq!(order.items[0].product_name, "Strat");
    }

    #[tokio::test]
    async fn confirm_received_requires_shipped() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;
        fill_cart(&state, &user, product.id, 1).await;
        let order_id = place_order(&state, &user, cod_checkout())
            .await
            .unwrap()
            .data
            .unwrap()
            .order_id;

        let early = confirm_received(&state, &user, order_id).await;
        assert!(matches!(early, Err(AppError::Validation(_))));

        state
            .store
            .update(
                collections::ORDERS,
                order_id,
                json!({ "status": OrderStatus::Shipped, "shipping_receipt": "RESI-1" }),
            )
            .await
            .unwrap();

        let done = confirm_received(&state, &user, order_id)
            .await
            .unwrap()
            .data
            .unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn watch_order_history_picks_up_new_orders() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        let mut live = watch_order_history(&state, &user).await;
        assert!(live.current().is_empty());

        fill_cart(&state, &user, product.id, 1).await;
        place_order(&state, &user, cod_checkout()).await.unwrap();

        loop {
            assert!(live.changed().await, "order stream ended unexpectedly");
            if !live.current().is_empty() {
                break;
            }
        }
        assert_eq!(live.current()[0].user_id, user.user_id);
    }
}
