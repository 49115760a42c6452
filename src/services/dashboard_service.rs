use serde_json::json;

use crate::{
    dto::orders::DashboardSummary,
    error::AppResult,
    middleware::auth::{AuthUser, ensure_admin},
    models::{OrderStatus, UserRole},
    response::ApiResponse,
    state::AppState,
    store::{Filter, collections},
};

/// Back-office landing numbers: catalog size, orders awaiting action and
/// registered customers.
pub async fn summary(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<DashboardSummary>> {
    ensure_admin(user)?;

    let total_products = state
        .store
        .count(collections::PRODUCTS, &Filter::all())
        .await;

    let pending = state
        .store
        .count(
            collections::ORDERS,
            &Filter::all().field_eq("status", json!(OrderStatus::Pending)),
        )
        .await;
    let waiting = state
        .store
        .count(
            collections::ORDERS,
            &Filter::all().field_eq("status", json!(OrderStatus::WaitingConfirmation)),
        )
        .await;

    let total_customers = state
        .store
        .count(
            collections::USERS,
            &Filter::all().field_eq("role", json!(UserRole::User)),
        )
        .await;

    Ok(ApiResponse::success(
        "Dashboard",
        DashboardSummary {
            total_products,
            new_orders: pending + waiting,
            total_customers,
        },
    ))
}
