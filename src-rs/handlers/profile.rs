use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::{error_body, store_error_response};
use crate::{db::users::BACKEND_ACCOUNT_KEY, middleware::AuthenticatedUser, state::AppState};

const PROTECTED_PREFERENCES: &[&str] = &[BACKEND_ACCOUNT_KEY];

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    let profile = match state.store.profiles.get(&user.user_id) {
        Ok(profile) => profile,
        Err(error) => return store_error_response(error, "loading profile"),
    };
    let subscription = match state.store.subscriptions.latest_for_user(&user.user_id) {
        Ok(subscription) => subscription,
        Err(error) => return store_error_response(error, "loading subscription"),
    };

    (
        StatusCode::OK,
        Json(json!({
            "user": {
                "id": user.user_id,
                "email": user.email,
                "name": user.name,
            },
            "profile": profile,
            "subscription": subscription,
        })),
    )
        .into_response()
}

pub async fn update_preferences(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
) -> Response {
    let Value::Object(patch) = body else {
        return error_body(StatusCode::BAD_REQUEST, "Preferences must be a JSON object.");
    };

    if let Some(key) = patch
        .keys()
        .find(|key| PROTECTED_PREFERENCES.contains(&key.as_str()))
    {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("Preference `{key}` cannot be changed."),
        );
    }

    match state.store.profiles.merge_preferences(&user.user_id, &patch) {
        Ok(preferences) => {
            (StatusCode::OK, Json(json!({ "preferences": preferences }))).into_response()
        }
        Err(error) => store_error_response(error, "updating preferences"),
    }
}
