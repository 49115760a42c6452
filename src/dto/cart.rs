use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Cart, CartItem};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

/// Cart plus its derived totals, the shape the UI renders.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    pub items: Vec<CartItem>,
    pub total_price: i64,
    pub item_count: i32,
}

impl From<Cart> for CartView {
    fn from(cart: Cart) -> Self {
        let total_price = cart.total_price();
        let item_count = cart.item_count();
        Self {
            items: cart.items,
            total_price,
            item_count,
        }
    }
}
