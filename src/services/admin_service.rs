use serde_json::json;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{OrderList, OrderListQuery, ShippingReceiptRequest, UpdateOrderStatusRequest},
    error::{AppError, AppResult},
    live::Live,
    middleware::auth::{AuthUser, ensure_admin},
    models::{Order, OrderStatus},
    response::ApiResponse,
    state::AppState,
    store::{Filter, OrderBy, collections},
};

pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(user)?;
    let mut filter = Filter::all();
    if let Some(status) = query.status {
        filter = filter.field_eq("status", json!(status));
    }
    let docs = state
        .store
        .query(
            collections::ORDERS,
            &filter,
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

pub async fn watch_all_orders(state: &AppState, user: &AuthUser) -> AppResult<Live<Vec<Order>>> {
    ensure_admin(user)?;
    let sub = state
        .store
        .subscribe(
            collections::ORDERS,
            Filter::all(),
            Some(OrderBy::desc("created_at")),
        )
        .await;
    Ok(sub.map(|docs| super::decode_all(docs)))
}

pub async fn get_order_admin(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let order: Order = state
        .store
        .get(collections::ORDERS, id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;
    Ok(ApiResponse::success("Order found", order))
}

/// Walk the order through its state machine. Shipping is not reachable from
/// here: it requires a receipt and goes through `add_shipping_receipt`.
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let mut order: Order = state
        .store
        .get(collections::ORDERS, id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;

    if !order.status.can_transition_to(payload.status) {
        return Err(AppError::Validation(format!(
            "cannot move order from {:?} to {:?}",
            order.status, payload.status
        )));
    }
    if payload.status == OrderStatus::Shipped && order.shipping_receipt.is_none() {
        return Err(AppError::Validation(
            "shipping requires a receipt attachment".into(),
        ));
    }

    order.status = payload.status;
    state
        .store
        .update(collections::ORDERS, id, json!({ "status": payload.status }))
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(json!({ "order_id": id, "status": payload.status })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Order updated", order))
}

/// Attach the shipping receipt and mark the order shipped in one write.
pub async fn add_shipping_receipt(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: ShippingReceiptRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    if payload.receipt.trim().is_empty() {
        return Err(AppError::Validation("receipt must not be empty".into()));
    }

    let mut order: Order = state
        .store
        .get(collections::ORDERS, id)
        .await
        .ok_or(AppError::NotFound)?
        .to()?;
    if !order.status.can_transition_to(OrderStatus::Shipped) {
        return Err(AppError::Validation(format!(
            "cannot ship order from {:?}",
            order.status
        )));
    }

    order.status = OrderStatus::Shipped;
    order.shipping_receipt = Some(payload.receipt.clone());
    state
        .store
        .update(
            collections::ORDERS,
            id,
            json!({
                "status": OrderStatus::Shipped,
                "shipping_receipt": payload.receipt,
            }),
        )
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.user_id),
        "order_shipped",
        Some("orders"),
        Some(json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Order shipped", order))
}
