use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

/// Catalog entity. `price` is in minor currency units; `stock` never goes
/// negative: the only code path that decrements it is the checkout
/// transaction, which verifies availability first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub stock: i32,
    pub category: String,
    pub image_base64: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One cart line. `product_name`, `price` and `image_base64` are cached
/// copies of the product record; the cart read path reconciles them against
/// the catalog before anything is shown or charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CartItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price: i64,
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Cart {
    #[serde(default)]
    pub items: Vec<CartItem>,
}

impl Cart {
    pub fn total_price(&self) -> i64 {
        self.items
            .iter()
            .map(|item| item.price * item.quantity as i64)
            .sum()
    }

    pub fn item_count(&self) -> i32 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Transfer,
    Cod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    WaitingConfirmation,
    Verified,
    Processed,
    Shipped,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Legal transitions. `WaitingConfirmation` is an initial state (COD
    /// orders), not a successor of `Pending`. `Cancelled` is legal from any
    /// state that has not shipped yet, though no route drives it.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Verified)
                | (Verified, Processed)
                | (WaitingConfirmation, Processed)
                | (Processed, Shipped)
                | (Shipped, Completed)
                | (Pending | WaitingConfirmation | Verified | Processed, Cancelled)
        )
    }
}

/// Order line items are copied from the cart at placement time, so later
/// catalog edits never alter historical orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub items: Vec<CartItem>,
    pub total_price: i64,
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_proof_base64: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub shipping_receipt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
