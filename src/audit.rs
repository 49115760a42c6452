use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::AuditLog,
    store::{MemoryStore, collections},
};

pub async fn log_audit(
    store: &MemoryStore,
    user_id: Option<Uuid>,
    action: &str,
    resource: Option<&str>,
    metadata: Option<Value>,
) -> AppResult<()> {
    let entry = AuditLog {
        id: Uuid::new_v4(),
        user_id,
        action: action.to_string(),
        resource: resource.map(str::to_string),
        metadata,
        created_at: Utc::now(),
    };
    store.set(collections::AUDIT_LOGS, entry.id, &entry).await?;
    Ok(())
}
