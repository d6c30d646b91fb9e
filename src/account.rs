use std::sync::Arc;

use axum::{
    extract::{multipart::Multipart, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    agents::{read_upload, remove_stored_file, IMAGE_EXTENSIONS},
    auth::{bearer_token, hash_password, verify_password, CurrentUser},
    error::ApiError,
    storage::{extension_of, PROFILE_FOLDER},
    store::StoreError,
    types::{now, AccountUpdateBody, AppState, PasswordChangeBody, UserUpdate},
    validation::ValidJson,
};

fn email_in_use() -> ApiError {
    ApiError::conflict("EMAIL_IN_USE", "Email is already in use by another user")
}

fn user_gone() -> ApiError {
    ApiError::unauthorized("INVALID_TOKEN", "Invalid or expired token")
}

pub async fn get_account(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    Json(json!({ "success": true, "user": user }))
}

pub async fn update_account(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    ValidJson(update): ValidJson<AccountUpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(email) = &update.email {
        let taken = state
            .store
            .find_user_by_email(email)
            .await?
            .is_some_and(|other| other.id != user.id);
        if taken {
            return Err(email_in_use());
        }
    }

    let user = match state.store.update_user(user.id, &update, now()).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(user_gone()),
        // Lost a race with another registration of the same address.
        Err(StoreError::Conflict(_)) => return Err(email_in_use()),
        Err(err) => return Err(err.into()),
    };
    tracing::info!(user_id = %user.id, "account updated");

    Ok(Json(json!({
        "success": true,
        "message": "Account updated",
        "user": user,
    })))
}

pub async fn upload_profile_picture(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload = read_upload(multipart, "picture").await?;
    let is_image = extension_of(&upload.file_name)
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
    if !is_image {
        return Err(ApiError::bad_request(
            "INVALID_FILE_TYPE",
            "Profile picture must be a jpg, png, gif or webp image",
        ));
    }

    let stored = state
        .files
        .save(PROFILE_FOLDER, &upload.file_name, &upload.bytes)
        .await
        .map_err(|err| ApiError::internal("UPLOAD_ERROR", err))?;
    let previous = state
        .store
        .replace_profile_picture(user.id, &stored.url, now())
        .await?;
    if let Some(old) = previous.filter(|old| *old != stored.url) {
        remove_stored_file(&state, &old).await;
    }

    Ok(Json(json!({
        "success": true,
        "message": "Profile picture updated",
        "profile_picture_url": stored.url,
    })))
}

/// Checks the current password, stores the new hash and signs out every
/// other session of the user.
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    ValidJson(body): ValidJson<PasswordChangeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !verify_password(body.current_password, user.password_hash.clone()).await {
        return Err(ApiError::bad_request(
            "INVALID_CURRENT_PASSWORD",
            "Current password is incorrect",
        ));
    }

    let password_hash = hash_password(body.new_password, state.config.bcrypt_cost).await?;
    let update = UserUpdate {
        password_hash: Some(password_hash),
        ..Default::default()
    };
    state
        .store
        .update_user(user.id, &update, now())
        .await?
        .ok_or_else(user_gone)?;

    let current = bearer_token(&headers).unwrap_or_default();
    let revoked = state.store.revoke_auth_tokens(user.id, &current).await?;
    tracing::info!(user_id = %user.id, revoked, "password changed");

    Ok(Json(json!({
        "success": true,
        "message": "Password changed",
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::app::test_support::{
        get_request, json_request, multipart_request, register_operator, send, test_app,
    };

    #[tokio::test]
    async fn account_details_can_be_read_and_updated() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "olga@example.com").await;
        register_operator(&app, "taken@example.com").await;

        let (status, body) = send(&app, get_request("/api/account", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], json!("olga@example.com"));
        assert_eq!(body["user"]["profile_picture_url"], json!(null));
        assert!(body["user"].get("password_hash").is_none());

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/account",
                Some(&token),
                json!({ "name": "Olga Lima", "email": "Olga.Lima@Example.com" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], json!("Olga Lima"));
        assert_eq!(body["user"]["email"], json!("olga.lima@example.com"));

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/account",
                Some(&token),
                json!({ "email": "taken@example.com" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], json!("EMAIL_IN_USE"));

        let (status, body) = send(
            &app,
            json_request("PUT", "/api/account", Some(&token), json!({ "email": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (status, _) = send(&app, get_request("/api/account", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn password_change_checks_the_current_password_and_signs_out_other_sessions() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "paula@example.com").await;
        let (_, login) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "paula@example.com", "password": "secret1" }),
            ),
        )
        .await;
        let other_session = login["token"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/account/password",
                Some(&token),
                json!({ "current_password": "wrong1", "new_password": "brand-new" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_CURRENT_PASSWORD"));

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/account/password",
                Some(&token),
                json!({ "currentPassword": "secret1", "newPassword": "brand-new" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, get_request("/api/auth/me", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, get_request("/api/auth/me", Some(&other_session))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "paula@example.com", "password": "secret1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "paula@example.com", "password": "brand-new" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn profile_picture_upload_replaces_the_previous_file() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "rita@example.com").await;

        let (status, first) = send(
            &app,
            multipart_request("/api/account/profile-picture", &token, "picture", "me.jpg", b"jpeg one"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let first_url = first["profile_picture_url"].as_str().unwrap().to_string();
        assert!(first_url.starts_with("/uploads/profiles/"));
        let (status, _) = send(&app, get_request(&first_url, None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, second) = send(
            &app,
            multipart_request("/api/account/profile-picture", &token, "picture", "me.webp", b"webp two"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, get_request(&first_url, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, account) = send(&app, get_request("/api/account", Some(&token))).await;
        assert_eq!(account["user"]["profile_picture_url"], second["profile_picture_url"]);

        let (status, body) = send(
            &app,
            multipart_request("/api/account/profile-picture", &token, "picture", "cv.pdf", b"%PDF"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_FILE_TYPE"));
    }
}
