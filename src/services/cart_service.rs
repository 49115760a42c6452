use std::collections::HashMap;

use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::cart::{AddToCartRequest, CartView},
    error::{AppError, AppResult},
    live::Live,
    middleware::auth::AuthUser,
    models::{Cart, CartItem, Product},
    response::ApiResponse,
    state::AppState,
    store::{Document, Filter, MemoryStore, collections},
};

// The cart document is keyed by the owning user's id.

/// One-shot cart read. Every read passes through reconciliation, so callers
/// never see line items that drifted from the catalog.
pub async fn get_cart(state: &AppState, user: &AuthUser) -> AppResult<Cart> {
    let doc = state.store.get(collections::CARTS, user.user_id).await;
    let (cart, version) = parse_cart_doc(doc)?;
    let (cart, _) = reconcile(&state.store, user.user_id, cart, version).await?;
    Ok(cart)
}

pub async fn cart_view(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    let cart = get_cart(state, user).await?;
    Ok(ApiResponse::success("OK", cart.into()))
}

/// Live cart. Each raw snapshot from the store is reconciled before it is
/// emitted; a corrective write-back triggers one more pass that converges
/// without emitting a duplicate value.
pub async fn watch_cart(state: &AppState, user: &AuthUser) -> Live<Cart> {
    let mut sub = state.store.subscribe_doc(collections::CARTS, user.user_id).await;
    let store = state.store.clone();
    let user_id = user.user_id;

    let initial = reconciled_snapshot(&store, user_id, sub.current()).await;
    let (tx, rx) = watch::channel(initial);
    let task = tokio::spawn(async move {
        loop {
            if !sub.changed().await {
                break;
            }
            let cart = reconciled_snapshot(&store, user_id, sub.current()).await;
            // Convergence passes re-emit the same value; suppress them so
            // consumers only wake on real changes.
            tx.send_if_modified(|current| {
                if *current == cart {
                    return false;
                }
                *current = cart;
                true
            });
            if tx.is_closed() {
                break;
            }
        }
    });
    Live::new(rx, task)
}

pub async fn add_to_cart(
    state: &AppState,
    user: &AuthUser,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.quantity < 1 {
        return Err(AppError::Validation(
            "quantity must be greater than 0".into(),
        ));
    }

    let product: Product = state
        .store
        .get(collections::PRODUCTS, payload.product_id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;

    let doc = state.store.get(collections::CARTS, user.user_id).await;
    let (mut cart, _) = parse_cart_doc(doc)?;

    match cart
        .items
        .iter_mut()
        .find(|item| item.product_id == product.id)
    {
        Some(item) => item.quantity += payload.quantity,
        None => cart.items.push(CartItem {
            product_id: product.id,
            product_name: product.name,
            quantity: payload.quantity,
            price: product.price,
            image_base64: product.image_base64,
        }),
    }

    state
        .store
        .set(collections::CARTS, user.user_id, &cart)
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "cart_add",
        Some("carts"),
        Some(json!({ "product_id": payload.product_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Added to cart", cart.into()))
}

pub async fn update_quantity(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    quantity: i32,
) -> AppResult<ApiResponse<CartView>> {
    if quantity <= 0 {
        return remove_from_cart(state, user, product_id).await;
    }

    let doc = state.store.get(collections::CARTS, user.user_id).await;
    let (mut cart, _) = parse_cart_doc(doc)?;

    let item = cart
        .items
        .iter_mut()
        .find(|item| item.product_id == product_id)
        .ok_or(AppError::NotFound)?;
    item.quantity = quantity;

    state
        .store
        .set(collections::CARTS, user.user_id, &cart)
        .await?;

    Ok(ApiResponse::success("Quantity updated", cart.into()))
}

pub async fn remove_from_cart(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
) -> AppResult<ApiResponse<CartView>> {
    let doc = state.store.get(collections::CARTS, user.user_id).await;
    let (mut cart, _) = parse_cart_doc(doc)?;

    let before = cart.items.len();
    cart.items.retain(|item| item.product_id != product_id);
    if cart.items.len() == before {
        return Err(AppError::NotFound);
    }

    state
        .store
        .set(collections::CARTS, user.user_id, &cart)
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "cart_remove",
        Some("carts"),
        Some(json!({ "product_id": product_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Removed from cart", cart.into()))
}

pub async fn clear_cart(state: &AppState, user: &AuthUser) -> AppResult<()> {
    state
        .store
        .set(collections::CARTS, user.user_id, &Cart::default())
        .await?;
    Ok(())
}

/// Cross-check every cached line item against the live catalog: items whose
/// product vanished are dropped, stale name/price/image caches are rewritten.
/// Quantities are user intent and are never touched here. If anything
/// changed, the corrected cart is persisted best-effort; losing that write to
/// a concurrent mutation is fine, the next pass reconverges.
async fn reconcile(
    store: &MemoryStore,
    user_id: Uuid,
    cart: Cart,
    version: Option<u64>,
) -> AppResult<(Cart, bool)> {
    if cart.items.is_empty() {
        return Ok((cart, false));
    }

    let mut product_ids: Vec<Uuid> = cart.items.iter().map(|item| item.product_id).collect();
    product_ids.dedup();
    let docs = store
        .query(collections::PRODUCTS, &Filter::all().id_in(product_ids), None)
        .await;
    let products: HashMap<Uuid, Product> = super::decode_all::<Product>(&docs)
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut validated = Vec::with_capacity(cart.items.len());
    let mut outdated = false;
    for item in cart.items {
        match products.get(&item.product_id) {
            Some(product) => {
                if item.product_name != product.name
                    || item.price != product.price
                    || item.image_base64 != product.image_base64
                {
                    validated.push(CartItem {
                        product_name: product.name.clone(),
                        price: product.price,
                        image_base64: product.image_base64.clone(),
                        ..item
                    });
                    outdated = true;
                } else {
                    validated.push(item);
                }
            }
            None => outdated = true,
        }
    }

    let corrected = Cart { items: validated };
    if outdated {
        match store
            .set_if_unchanged(collections::CARTS, user_id, version, &corrected)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%user_id, "lost cart reconciliation write race");
            }
            Err(err) => {
                tracing::warn!(error = %err, %user_id, "cart reconciliation write failed");
            }
        }
    }

    Ok((corrected, outdated))
}

async fn reconciled_snapshot(store: &MemoryStore, user_id: Uuid, doc: Option<Document>) -> Cart {
    let (cart, version) = match parse_cart_doc(doc) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, %user_id, "undecodable cart document");
            return Cart::default();
        }
    };
    match reconcile(store, user_id, cart.clone(), version).await {
        Ok((corrected, _)) => corrected,
        Err(err) => {
            tracing::warn!(error = %err, %user_id, "cart reconciliation failed");
            cart
        }
    }
}

/// Absent cart document reads as an empty cart; it is only materialized on
/// the first write.
fn parse_cart_doc(doc: Option<Document>) -> AppResult<(Cart, Option<u64>)> {
    match doc {
        Some(doc) => Ok((doc.to()?, Some(doc.version))),
        None => Ok((Cart::default(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::UserRole;
    use crate::store::MemoryStore;
    use chrono::Utc;

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

    #[tokio::test]
    async fn empty_cart_reads_without_materializing() {
        let state = test_state();
        let user = customer();
        let cart = get_cart(&state, &user).await.unwrap();
        assert!(cart.items.is_empty());
        assert!(state.store.get(collections::CARTS, user.user_id).await.is_none());
    }

    #[tokio::test]
    async fn add_merges_quantities_for_same_product() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();
        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 3,
            },
        )
        .await
        .unwrap();

        let cart = get_cart(&state, &user).await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 5);
        assert_eq!(cart.total_price(), 500_000);
    }

    #[tokio::test]
    async fn add_then_remove_restores_cart_by_value() {
        let state = test_state();
        let user = customer();
        let keep = seed_product(&state, "Amp", 200_000, 3).await;
        let transient = seed_product(&state, "Strap", 15_000, 9).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: keep.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();
        let before = get_cart(&state, &user).await.unwrap();

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: transient.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();
        remove_from_cart(&state, &user, transient.id).await.unwrap();

        let after = get_cart(&state, &user).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn update_quantity_zero_removes_item() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();
        update_quantity(&state, &user, product.id, 0).await.unwrap();

        let cart = get_cart(&state, &user).await.unwrap();
        assert!(cart.items.is_empty());
    }

    #[tokio::test]
    async fn reconciliation_rewrites_stale_price_and_persists() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();

        state
            .store
            .update(collections::PRODUCTS, product.id, json!({"price": 120_000}))
            .await
            .unwrap();

        let cart = get_cart(&state, &user).await.unwrap();
        assert_eq!(cart.items[0].price, 120_000);

        // Corrected cart was persisted, not just returned.
        let stored: Cart = state
            .store
            .get(collections::CARTS, user.user_id)
            .await
            .unwrap()
            .to()
            .unwrap();
        assert_eq!(stored.items[0].price, 120_000);
    }

    #[tokio::test]
    async fn reconciliation_drops_deleted_products_but_keeps_quantity_edits() {
        let state = test_state();
        let user = customer();
        let kept = seed_product(&state, "Amp", 200_000, 3).await;
        let doomed = seed_product(&state, "Strap", 15_000, 9).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: kept.id,
                quantity: 4,
            },
        )
        .await
        .unwrap();
        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: doomed.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();

        state.store.delete(collections::PRODUCTS, doomed.id).await;

        let cart = get_cart(&state, &user).await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].product_id, kept.id);
        assert_eq!(cart.items[0].quantity, 4);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_and_skips_redundant_writes() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();
        state
            .store
            .update(collections::PRODUCTS, product.id, json!({"price": 120_000}))
            .await
            .unwrap();

        let first = get_cart(&state, &user).await.unwrap();
        let version_after_fix = state
            .store
            .get(collections::CARTS, user.user_id)
            .await
            .unwrap()
            .version;

        let second = get_cart(&state, &user).await.unwrap();
        let version_after_second = state
            .store
            .get(collections::CARTS, user.user_id)
            .await
            .unwrap()
            .version;

        assert_eq!(first, second);
        assert_eq!(version_after_fix, version_after_second);
    }

    #[tokio::test]
    async fn watch_cart_emits_corrected_snapshots_on_catalog_drift() {
        let state = test_state();
        let user = customer();
        let product = seed_product(&state, "Strat", 100_000, 10).await;

        add_to_cart(
            &state,
            &user,
            AddToCartRequest {
                product_id: product.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();

        let mut live = watch_cart(&state, &user).await;
        assert_eq!(live.current().items[0].price, 100_000);

        state
            .store
            .update(collections::PRODUCTS, product.id, json!({"price": 120_000}))
            .await
            .unwrap();

        // Reconciliation runs on cart snapshots and reads, not on catalog
        // events; a read repairs the persisted cart, which the subscription
        // then picks up.
        let read = get_cart(&state, &user).await.unwrap();
        assert_eq!(read.items[0].price, 120_000);

        loop {
            assert!(live.changed().await, "cart stream ended unexpectedly");
            let cart = live.current();
            if cart.items[0].price == 120_000 {
                assert_eq!(cart.items[0].quantity, 2);
                break;
            }
        }
    }
}
