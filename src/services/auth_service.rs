use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use password_hash::rand_core::OsRng;
use serde_json::json;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::auth::{
        ChangePasswordRequest, Claims, LoginRequest, LoginResponse, RegisterRequest,
        ResetPasswordRequest, UserList, UserProfile,
    },
    error::{AppError, AppResult},
    live::Live,
    middleware::auth::{AuthUser, ensure_admin},
    models::{User, UserRole},
    response::ApiResponse,
    state::AppState,
    store::{Filter, OrderBy, collections},
};

pub async fn register(
    state: &AppState,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<UserProfile>> {
    let RegisterRequest {
        name,
        email,
        password,
        confirm_password,
    } = payload;

    if name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if password != confirm_password {
        return Err(AppError::Validation(
            "password confirmation does not match".into(),
        ));
    }
    if find_by_email(state, &email).await?.is_some() {
        return Err(AppError::Validation("email is already taken".into()));
    }

    let user = User {
        id: Uuid::new_v4(),
        name,
        email,
        password_hash: hash_password(&password)?,
        role: UserRole::User,
        created_at: Utc::now(),
    };
    state.store.set(collections::USERS, user.id, &user).await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.id),
        "user_register",
        Some("users"),
        Some(json!({ "user_id": user.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("User created", user.into()))
}

pub async fn login(
    state: &AppState,
    payload: LoginRequest,
) -> AppResult<ApiResponse<LoginResponse>> {
    let LoginRequest { email, password } = payload;

    let user = find_by_email(state, &email)
        .await?
        .ok_or_else(|| AppError::Validation("invalid email or password".into()))?;

    verify_password(&password, &user.password_hash)
        .map_err(|_| AppError::Validation("invalid email or password".into()))?;

    let token = issue_token(state, &user)?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.id),
        "user_login",
        Some("users"),
        Some(json!({ "user_id": user.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Logged in",
        LoginResponse {
            token: format!("Bearer {token}"),
        },
    ))
}

/// Reauthenticate with the current password, then store a fresh hash.
pub async fn change_password(
    state: &AppState,
    auth: &AuthUser,
    payload: ChangePasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let user = load_user(state, auth.user_id).await?;

    verify_password(&payload.current_password, &user.password_hash)
        .map_err(|_| AppError::Validation("current password is incorrect".into()))?;

    let hash = hash_password(&payload.new_password)?;
    state
        .store
        .update(
            collections::USERS,
            user.id,
            json!({ "password_hash": hash }),
        )
        .await?;

    Ok(ApiResponse::success("Password changed", json!({})))
}

/// Manual reset by email. The mobile client's fallback flow stored the new
/// password verbatim on the user document; here only a hash is ever written.
pub async fn reset_password(
    state: &AppState,
    payload: ResetPasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let user = find_by_email(state, &payload.email)
        .await?
        .ok_or(AppError::NotFound)?;

    let hash = hash_password(&payload.new_password)?;
    state
        .store
        .update(
            collections::USERS,
            user.id,
            json!({ "password_hash": hash }),
        )
        .await?;

    if let Err(err) = log_audit(
        &state.store,
        Some(user.id),
        "password_reset",
        Some("users"),
        None,
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Password reset", json!({})))
}

pub async fn current_user(state: &AppState, auth: &AuthUser) -> AppResult<ApiResponse<UserProfile>> {
    let user = load_user(state, auth.user_id).await?;
    Ok(ApiResponse::success("OK", user.into()))
}

pub async fn list_users(state: &AppState, auth: &AuthUser) -> AppResult<ApiResponse<UserList>> {
    ensure_admin(auth)?;
    let docs = state
        .store
        .query(
            collections::USERS,
            &Filter::all(),
            Some(&OrderBy::desc("created_at")),
        )
        .await;
    let items = super::decode_all::<User>(&docs)
        .into_iter()
        .map(UserProfile::from)
        .collect();
    Ok(ApiResponse::success("Users", UserList { items }))
}

pub async fn watch_users(state: &AppState, auth: &AuthUser) -> AppResult<Live<Vec<UserProfile>>> {
    ensure_admin(auth)?;
    let sub = state
        .store
        .subscribe(
            collections::USERS,
            Filter::all(),
            Some(OrderBy::desc("created_at")),
        )
        .await;
    Ok(sub.map(|docs| {
        super::decode_all::<User>(docs)
            .into_iter()
            .map(UserProfile::from)
            .collect()
    }))
}

pub async fn delete_user(
    state: &AppState,
    auth: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(auth)?;
    if state.store.get(collections::USERS, id).await.is_none() {
        return Err(AppError::NotFound);
    }
    state.store.delete(collections::USERS, id).await;

    if let Err(err) = log_audit(
        &state.store,
        Some(auth.user_id),
        "user_delete",
        Some("users"),
        Some(json!({ "user_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Deleted", json!({})))
}

/// Seed the first admin account if the store has none, so a fresh deployment
/// is manageable out of the box.
pub async fn ensure_default_admin(state: &AppState) -> AppResult<()> {
    let admins = state
        .store
        .count(
            collections::USERS,
            &Filter::all().field_eq("role", json!(UserRole::Admin)),
        )
        .await;
    if admins > 0 {
        return Ok(());
    }

    let admin = User {
        id: Uuid::new_v4(),
        name: "Store Admin".into(),
        email: state.config.admin_email.clone(),
        password_hash: hash_password(&state.config.admin_password)?,
        role: UserRole::Admin,
        created_at: Utc::now(),
    };
    state.store.set(collections::USERS, admin.id, &admin).await?;
    tracing::info!(email = %admin.email, "seeded default admin account");
    Ok(())
}

async fn find_by_email(state: &AppState, email: &str) -> AppResult<Option<User>> {
    let docs = state
        .store
        .query(
            collections::USERS,
            &Filter::all().field_eq("email", json!(email)),
            None,
        )
        .await;
    Ok(super::decode_all::<User>(&docs).into_iter().next())
}

async fn load_user(state: &AppState, id: Uuid) -> AppResult<User> {
    let doc = state
        .store
        .get(collections::USERS, id)
        .await
        .ok_or(AppError::NotFound)?;
    Ok(doc.to()?)
}

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, hash: &str) -> Result<(), ()> {
    let parsed = PasswordHash::new(hash).map_err(|_| ())?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ())
}

fn issue_token(state: &AppState, user: &User) -> AppResult<String> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(24))
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("failed to set expiration")))?;

    let claims = Claims {
        sub: user.id.to_string(),
        name: user.name.clone(),
        role: user.role,
        exp: expiration.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
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

    fn register_req(email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: "Alex".into(),
            email: email.into(),
            password: password.into(),
            confirm_password: password.into(),
        }
    }

    #[tokio::test]
    async fn register_then_login_roundtrip() {
        let state = test_state();
        let resp = register(&state, register_req("alex@example.com", "hunter22"))
            .await
            .unwrap();
        let profile = resp.data.unwrap();
        assert_eq!(profile.role, UserRole::User);

        let login_resp = login(
            &state,
            LoginRequest {
                email: "alex@example.com".into(),
                password: "hunter22".into(),
            },
        )
        .await
        .unwrap();
        assert!(login_resp.data.unwrap().token.starts_with("Bearer "));
    }

    #[tokio::test]
    async fn register_rejects_mismatched_confirmation() {
        let state = test_state();
        let result = register(
            &state,
            RegisterRequest {
                name: "Alex".into(),
                email: "alex@example.com".into(),
                password: "one".into(),
                confirm_password: "two".into(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email() {
        let state = test_state();
        register(&state, register_req("alex@example.com", "hunter22"))
            .await
            .unwrap();
        let result = register(&state, register_req("alex@example.com", "other")).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let state = test_state();
        register(&state, register_req("alex@example.com", "hunter22"))
            .await
            .unwrap();
        let result = login(
            &state,
            LoginRequest {
                email: "alex@example.com".into(),
                password: "wrong".into(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn stored_user_never_holds_plaintext_password() {
        let state = test_state();
        register(&state, register_req("alex@example.com", "hunter22"))
            .await
            .unwrap();
        let user = find_by_email(&state, "alex@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(user.password_hash, "hunter22");
        assert!(user.password_hash.starts_with("$argon2"));
    }

    #[tokio::test]
    async fn reset_password_writes_new_hash() {
        let state = test_state();
        register(&state, register_req("alex@example.com", "hunter22"))
            .await
            .unwrap();

        reset_password(
            &state,
            ResetPasswordRequest {
                email: "alex@example.com".into(),
                new_password: "fresh-pass".into(),
            },
        )
        .await
        .unwrap();

        // Old credential no longer works, new one does.
        assert!(
            login(
                &state,
                LoginRequest {
                    email: "alex@example.com".into(),
                    password: "hunter22".into(),
                },
            )
            .await
            .is_err()
        );
        assert!(
            login(
                &state,
                LoginRequest {
                    email: "alex@example.com".into(),
                    password: "fresh-pass".into(),
                },
            )
            .await
            .is_ok()
        );
    }

    #[tokio::test]
    async fn default_admin_seeded_once() {
        let state = test_state();
        ensure_default_admin(&state).await.unwrap();
        ensure_default_admin(&state).await.unwrap();

        let admins = state
            .store
            .count(
                collections::USERS,
                &Filter::all().field_eq("role", json!(UserRole::Admin)),
            )
            .await;
        assert_eq!(admins, 1);
    }
}
