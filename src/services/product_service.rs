use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::products::{CreateProductRequest, ProductList, ProductQuery, UpdateProductRequest},
    error::{AppError, AppResult},
    live::Live,
    middleware::auth::{AuthUser, ensure_admin},
    models::Product,
    response::ApiResponse,
    state::AppState,
    store::{Filter, OrderBy, collections},
};

pub async fn list_products(
    state: &AppState,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let docs = state
        .store
        .query(
            collections::PRODUCTS,
            &Filter::all(),
            Some(&OrderBy::desc("created_at")),
        )
        .await;
    let mut items: Vec<Product> = super::decode_all(&docs);

    if let Some(search) = query.q.as_ref().filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        items.retain(|p| {
            p.name.to_lowercase().contains(&needle)
                || p.description.to_lowercase().contains(&needle)
        });
    }
    if let Some(category) = query.category.as_ref().filter(|s| !s.is_empty()) {
        items.retain(|p| p.category.eq_ignore_ascii_case(category));
    }

    Ok(ApiResponse::success("Products", ProductList { items }))
}

pub async fn watch_products(state: &AppState) -> Live<Vec<Product>> {
    let sub = state
        .store
        .subscribe(
            collections::PRODUCTS,
            Filter::all(),
            Some(OrderBy::desc("created_at")),
        )
        .await;
    sub.map(|docs| super::decode_all(docs))
}

pub async fn get_product(state: &AppState, id: Uuid) -> AppResult<ApiResponse<Product>> {
    let doc = state
        .store
        .get(collections::PRODUCTS, id)
        .await
        .ok_or(AppError::NotFound)?;
    Ok(ApiResponse::success("Product", doc.to()?))
}

pub async fn watch_product(state: &AppState, id: Uuid) -> Live<Option<Product>> {
    let sub = state.store.subscribe_doc(collections::PRODUCTS, id).await;
    sub.map(|doc| doc.as_ref().and_then(|d| d.to().ok()))
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    if payload.stock < 0 {
        return Err(AppError::Validation("stock cannot be negative".into()));
    }
    if payload.price < 0 {
        return Err(AppError::Validation("price cannot be negative".into()));
    }

    let product = Product {
        id: Uuid::new_v4(),
        name: payload.name,
        description: payload.description,
        price: payload.price,
        stock: payload.stock,
        category: payload.category,
        image_base64: payload.image_base64,
        created_at: Utc::now(),
    };
    state
        .store
        .set(collections::PRODUCTS, product.id, &product)
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "product_create",
        Some("products"),
        Some(json!({ "product_id": product.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Product created", product))
}

pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    let doc = state
        .store
        .get(collections::PRODUCTS, id)
        .await
        .ok_or(AppError::NotFound)?;
    let mut product: Product = doc.to()?;

    if let Some(name) = payload.name {
        product.name = name;
    }
    if let Some(description) = payload.description {
        product.description = description;
    }
    if let Some(price) = payload.price {
        if price < 0 {
            return Err(AppError::Validation("price cannot be negative".into()));
        }
        product.price = price;
    }
    if let Some(stock) = payload.stock {
        if stock < 0 {
            return Err(AppError::Validation("stock cannot be negative".into()));
        }
        product.stock = stock;
    }
    if let Some(category) = payload.category {
        product.category = category;
    }
    if let Some(image) = payload.image_base64 {
        product.image_base64 = Some(image);
    }

    state.store.set(collections::PRODUCTS, id, &product).await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "product_update",
        Some("products"),
        Some(json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Updated", product))
}

pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    if state.store.get(collections::PRODUCTS, id).await.is_none() {
        return Err(AppError::NotFound);
    }
    state.store.delete(collections::PRODUCTS, id).await;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "product_delete",
        Some("products"),
        Some(json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Deleted", json!({})))
}
