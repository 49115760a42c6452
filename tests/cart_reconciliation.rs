use amplistore_api::{
    config::AppConfig,
    dto::{cart::AddToCartRequest, products::{CreateProductRequest, UpdateProductRequest}},
    middleware::auth::AuthUser,
    models::UserRole,
    services::{cart_service, product_service},
    state::AppState,
    store::MemoryStore,
};
use uuid::Uuid;

// Catalog drift scenarios end to end: a renamed/repriced product is repaired
// in the cart on read, a deleted product disappears from it, and the live
// cart stream picks the corrections up.
#[tokio::test]
async fn catalog_drift_is_repaired_on_read_and_stream() -> anyhow::Result<()> {
    let state = setup_state();
    let customer = AuthUser {
        user_id: Uuid::new_v4(),
        name: "Rina".into(),
        role: UserRole::User,
    };
    let admin = AuthUser {
        user_id: Uuid::new_v4(),
        name: "Admin".into(),
        role: UserRole::Admin,
    };

    let strat = product_service::create_product(
        &state,
        &admin,
        CreateProductRequest {
            name: "Stratocaster".into(),
            description: "Classic".into(),
            price: 100_000,
            stock: 5,
            category: "guitars".into(),
            image_base64: None,
        },
    )
    .await?
    .data
    .expect("product");
    let strap = product_service::create_product(
        &state,
        &admin,
        CreateProductRequest {
            name: "Leather Strap".into(),
            description: "Brown".into(),
            price: 20_000,
            stock: 8,
            category: "accessories".into(),
            image_base64: None,
        },
    )
    .await?
    .data
    .expect("product");

    for (id, quantity) in [(strat.id, 1), (strap.id, 2)] {
        cart_service::add_to_cart(
            &state,
            &customer,
            AddToCartRequest {
                product_id: id,
                quantity,
            },
        )
        .await?;
    }

    let mut live = cart_service::watch_cart(&state, &customer).await;
    assert_eq!(live.current().items.len(), 2);

    // Admin edits one product and deletes the other.
    product_service::update_product(
        &state,
        &admin,
        strat.id,
        UpdateProductRequest {
            name: Some("Stratocaster Deluxe".into()),
            description: None,
            price: Some(120_000),
            stock: None,
            category: None,
            image_base64: None,
        },
    )
    .await?;
    product_service::delete_product(&state, &admin, strap.id).await?;

    // A read reconciles and persists the corrected cart.
    let cart = cart_service::get_cart(&state, &customer).await?;
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].product_name, "Stratocaster Deluxe");
    assert_eq!(cart.items[0].price, 120_000);
    assert_eq!(cart.items[0].quantity, 1);
    assert_eq!(cart.total_price(), 120_000);

    // The persisted correction reaches the live stream.
    loop {
        let snapshot = live.current();
        if snapshot.items.len() == 1 && snapshot.items[0].price == 120_000 {
            break;
        }
        assert!(live.changed().await, "cart stream ended unexpectedly");
    }

    // A second read finds nothing left to repair.
    let again = cart_service::get_cart(&state, &customer).await?;
    assert_eq!(again, cart);

    Ok(())
}

fn setup_state() -> AppState {
    AppState::new(
        MemoryStore::new(),
        AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            jwt_secret: "integration-test-secret".into(),
            admin_email: "admin@example.com".into(),
            admin_password: "admin123".into(),
        },
    )
}
