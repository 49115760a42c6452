pub mod admin_service;
pub mod auth_service;
pub mod cart_service;
pub mod dashboard_service;
pub mod order_service;
pub mod product_service;

use serde::de::DeserializeOwned;

use crate::store::Document;

/// Decode a query result, skipping documents that no longer match the model.
/// A schemaless store can hold stragglers from older writers; they are logged
/// and dropped rather than failing the whole read.
pub(crate) fn decode_all<T: DeserializeOwned>(docs: &[Document]) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match doc.to::<T>() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, id = %doc.id, "skipping undecodable document");
                None
            }
        })
        .collect()
}
