//! Authentication interception and error-message rewriting.
//!
//! Per the design note in `spec.md §9`, these rules live next to each
//! other and are written as pure functions wherever the rule doesn't
//! itself require a store round-trip, so the policy can be unit tested
//! without spinning up a [`crate::store::Store`].

use serde_json::Value;

use crate::store::Store;

use super::{CallerContext, ToolResult};

/// What the request-side interception decided to do, threaded through to
/// the matching response-side interception after the (possibly rewritten)
/// upstream call returns.
#[derive(Debug, Clone)]
pub enum Interception {
    /// No interception applies; call passes through unmodified.
    None,
    /// The caller already owns an account; don't call upstream at all.
    ShortCircuit(ToolResult),
    /// `register` was rewritten into `login` against a freshly claimed
    /// account. On failure the claim must be rolled back.
    RegisterViaClaim { username: String, password: String },
    /// The pool had no spare accounts; the original `register` call was
    /// forwarded unchanged. A successful response should be harvested
    /// into a new pool entry owned by the caller.
    ForwardedRegister { requested_username: Option<String> },
    /// `login` call (possibly rewritten to the caller's existing
    /// credentials). On success, `username` is assigned to the caller.
    Login { username: Option<String> },
    /// `logout` call; on success the response is inspected for the
    /// logged-out username.
    Logout,
}

fn field_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Search a JSON value at any depth for the first of `keys` that is
/// present, returning its string representation. Pure: no I/O.
pub fn extract_field(value: &Value, keys: &[&str]) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in keys {
                if let Some(found) = map.get(*key) {
                    if let Some(s) = found.as_str() {
                        return Some(s.to_string());
                    }
                }
            }
            for (_, nested) in map {
                if let Some(found) = extract_field(nested, keys) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| extract_field(item, keys)),
        _ => None,
    }
}

const LOOP_GUIDANCE_PATTERNS: [&str; 2] = ["login or register again", "please login or register"];

/// Rewrite an upstream error message. Breaks the claim→login infinite
/// loop some upstream servers induce by telling the caller to
/// re-authenticate even when it holds a valid session, and clarifies
/// genuine session-expiration errors. Pure: no I/O.
pub fn rewrite_error_message(message: &str) -> String {
    let lower = message.to_lowercase();
    if LOOP_GUIDANCE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return format!(
            "{} (if you already have a session, retrieve its id from your recent tool results instead of logging in again)",
            message
        );
    }
    if lower.contains("session expired") || lower.contains("session has expired") {
        return format!(
            "{} (sessions expire after prolonged inactivity or a server restart; claim a fresh session rather than retrying the same one)",
            message
        );
    }
    message.to_string()
}

/// Request-side interception: decide whether `name`/`args` should be
/// rewritten before hitting upstream.
pub async fn intercept_request(
    store: &Store,
    caller: &CallerContext,
    name: &str,
    args: Value,
) -> (String, Value, Interception) {
    match name {
        "register" => {
            if let Ok(existing) = store.get_account_by_mysis(caller.mysis_id).await {
                let message = format!(
                    "mysis already owns account {:?}; use login with that username instead of registering again",
                    existing.username
                );
                return (name.to_string(), args, Interception::ShortCircuit(ToolResult::failure(message)));
            }

            match store.claim_account(caller.mysis_id).await {
                Ok(account) => {
                    let login_args = serde_json::json!({
                        "username": account.username,
                        "password": account.password,
                    });
                    (
                        "login".to_string(),
                        login_args,
                        Interception::RegisterViaClaim {
                            username: account.username,
                            password: account.password,
                        },
                    )
                }
                Err(_) => {
                    let requested_username = field_str(&args, "username");
                    (name.to_string(), args, Interception::ForwardedRegister { requested_username })
                }
            }
        }
        "login" => {
            if let Ok(existing) = store.get_account_by_mysis(caller.mysis_id).await {
                let login_args = serde_json::json!({
                    "username": existing.username,
                    "password": existing.password,
                });
                (
                    name.to_string(),
                    login_args,
                    Interception::Login {
                        username: Some(existing.username),
                    },
                )
            } else {
                let username = field_str(&args, "username");
                (name.to_string(), args, Interception::Login { username })
            }
        }
        "logout" => (name.to_string(), args, Interception::Logout),
        _ => (name.to_string(), args, Interception::None),
    }
}

/// Response-side interception: act on `result` according to what the
/// request side decided.
pub async fn intercept_response(
    store: &Store,
    caller: &CallerContext,
    interception: &Interception,
    result: &mut ToolResult,
) {
    match interception {
        Interception::RegisterViaClaim { username, password } => {
            if result.success {
                if let Value::Object(map) = &mut result.output {
                    map.insert("password".to_string(), Value::String(password.clone()));
                }
            } else if let Err(err) = store.release_account(username.clone()).await {
                log::warn!("failed to roll back claimed account {}: {}", username, err);
            }
        }
        Interception::ForwardedRegister { requested_username } => {
            if result.success {
                let username = requested_username
                    .clone()
                    .or_else(|| extract_field(&result.output, &["username"]));
                let password = extract_field(&result.output, &["password", "token"]);
                if let (Some(username), Some(password)) = (username, password) {
                    if let Err(err) = store.create_account(username.clone(), password).await {
                        log::warn!("failed to harvest registered account {}: {}", username, err);
                    } else if let Err(err) = store.assign_account(username.clone(), caller.mysis_id).await {
                        log::warn!("failed to assign harvested account {}: {}", username, err);
                    }
                }
            }
        }
        Interception::Login { username } => {
            if result.success {
                if let Some(username) = username {
                    if let Err(err) = store.assign_account(username.clone(), caller.mysis_id).await {
                        log::debug!("login assign for {} skipped: {}", username, err);
                    }
                }
            }
        }
        Interception::Logout => {
            if result.success {
                if let Some(username) = extract_field(&result.output, &["player.username", "username"]) {
                    log::debug!("logout observed for account {}", username);
                }
            }
        }
        Interception::None | Interception::ShortCircuit(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn caller() -> CallerContext {
        CallerContext {
            mysis_id: Uuid::new_v4(),
            mysis_name: "scout".to_string(),
        }
    }

    #[test]
    fn rewrite_breaks_login_register_loop_guidance() {
        let rewritten = rewrite_error_message("Error: please login or register again to continue");
        assert!(rewritten.contains("recent tool results"));
    }

    #[test]
    fn rewrite_clarifies_session_expiration() {
        let rewritten = rewrite_error_message("your session has expired");
        assert!(rewritten.contains("claim a fresh session"));
    }

    #[test]
    fn rewrite_leaves_unrelated_errors_untouched() {
        let rewritten = rewrite_error_message("inventory is full");
        assert_eq!(rewritten, "inventory is full");
    }

    #[test]
    fn extract_field_finds_nested_key() {
        let value = serde_json::json!({"player": {"username": "zed"}});
        assert_eq!(extract_field(&value, &["username"]), Some("zed".to_string()));
    }

    #[test]
    fn extract_field_prefers_first_matching_key_at_shallowest_level() {
        let value = serde_json::json!({"token": "abc123"});
        assert_eq!(extract_field(&value, &["password", "token"]), Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn register_claims_account_and_rewrites_to_login() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        let caller = caller();
        let (name, args, interception) =
            intercept_request(&store, &caller, "register", serde_json::json!({})).await;
        assert_eq!(name, "login");
        assert_eq!(args["username"], "u1");
        assert!(matches!(interception, Interception::RegisterViaClaim { .. }));
    }

    #[tokio::test]
    async fn register_with_existing_account_short_circuits() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        let caller = caller();
        store.claim_account(caller.mysis_id).await.unwrap();

        let (_, _, interception) = intercept_request(&store, &caller, "register", serde_json::json!({})).await;
        match interception {
            Interception::ShortCircuit(result) => assert!(!result.success),
            other => panic!("expected ShortCircuit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_with_empty_pool_forwards_original_call() {
        let store = Store::open_in_memory().unwrap();
        let caller = caller();
        let (name, args, interception) = intercept_request(
            &store,
            &caller,
            "register",
            serde_json::json!({"username": "fresh"}),
        )
        .await;
        assert_eq!(name, "register");
        assert_eq!(args["username"], "fresh");
        assert!(matches!(interception, Interception::ForwardedRegister { .. }));
    }

    #[tokio::test]
    async fn failed_login_after_claim_rolls_back_account() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "p1".into()).await.unwrap();
        let caller = caller();
        let (_, _, interception) =
            intercept_request(&store, &caller, "register", serde_json::json!({})).await;

        let mut result = ToolResult::failure("invalid credentials".into());
        intercept_response(&store, &caller, &interception, &mut result).await;

        let other_caller = Uuid::new_v4();
        let reclaimed = store.claim_account(other_caller).await.unwrap();
        assert_eq!(reclaimed.username, "u1");
    }

    #[tokio::test]
    async fn successful_register_via_claim_injects_password() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("u1".into(), "secret".into()).await.unwrap();
        let caller = caller();
        let (_, _, interception) =
            intercept_request(&store, &caller, "register", serde_json::json!({})).await;

        let mut result = ToolResult::success(serde_json::json!({"username": "u1"}));
        intercept_response(&store, &caller, &interception, &mut result).await;

        assert_eq!(result.output["password"], "secret");
    }

    #[tokio::test]
    async fn forwarded_register_success_harvests_new_account() {
        let store = Store::open_in_memory().unwrap();
        let caller = caller();
        let interception = Interception::ForwardedRegister {
            requested_username: Some("newbie".to_string()),
        };
        let mut result = ToolResult::success(serde_json::json!({"token": "tok123"}));
        intercept_response(&store, &caller, &interception, &mut result).await;

        let owned = store.get_account_by_mysis(caller.mysis_id).await.unwrap();
        assert_eq!(owned.username, "newbie");
        assert_eq!(owned.password, "tok123");
    }
}
