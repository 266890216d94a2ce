//! Self-service unsubscribe endpoint.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::signing::UnsubscribeSigner;
use crate::store::{RelayStore, UnsubscribeOutcome};

const CONFIRMATION: &str = "Unsubscribed. You will no longer receive these emails.\n";

/// Shared state for the unsubscribe route.
#[derive(Clone)]
pub struct UnsubscribeState {
    pub store: Arc<dyn RelayStore>,
    pub signer: UnsubscribeSigner,
}

#[derive(Debug, Default, Deserialize)]
pub struct UnsubscribeParams {
    e: Option<String>,
    t: Option<String>,
    s: Option<String>,
}

/// GET {unsubscribe_path}?e=&t=&s=
///
/// 400 when a parameter is missing, 403 when the signature or the stored
/// token does not match, 200 once the address is unsubscribed (repeat
/// visits included).
async fn unsubscribe(
    State(state): State<UnsubscribeState>,
    Query(params): Query<UnsubscribeParams>,
) -> Response {
    let present = |v: Option<String>| v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let (Some(email), Some(token), Some(signature)) =
        (present(params.e), present(params.t), present(params.s))
    else {
        return (StatusCode::BAD_REQUEST, "Missing parameters.\n").into_response();
    };
    let email = email.to_lowercase();

    if !state.signer.verify(&email, &token, &signature) {
        warn!(email = %email, "Unsubscribe rejected: bad signature");
        return forbidden();
    }

    match state.store.get_subscriber(&email).await {
        Ok(Some(subscriber)) if subscriber.token == token => {}
        Ok(Some(_)) => {
            warn!(email = %email, "Unsubscribe rejected: token mismatch");
            return forbidden();
        }
        Ok(None) => {
            warn!(email = %email, "Unsubscribe rejected: unknown address");
            return forbidden();
        }
        Err(e) => return store_failure(e),
    }

    match state.store.unsubscribe(&email).await {
        Ok(UnsubscribeOutcome::Unsubscribed) => {
            info!(email = %email, "Unsubscribed via link");
            (StatusCode::OK, CONFIRMATION).into_response()
        }
        Ok(UnsubscribeOutcome::AlreadyUnsubscribed) => (StatusCode::OK, CONFIRMATION).into_response(),
        Ok(UnsubscribeOutcome::NotFound) => forbidden(),
        Err(e) => store_failure(e),
    }
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Invalid unsubscribe link.\n").into_response()
}

fn store_failure(e: crate::error::DatabaseError) -> Response {
    error!("Unsubscribe store failure: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Temporary failure, please retry.\n").into_response()
}

/// Build the unsubscribe route, served at the signer's path.
pub fn unsubscribe_routes(state: UnsubscribeState) -> Router {
    let path = state.signer.path().to_string();
    Router::new()
        .route(&path, get(unsubscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::UnsubscribeConfig;
    use crate::store::{LibSqlBackend, Subscriber, SubscriberUpdate};

    fn signer() -> UnsubscribeSigner {
        UnsubscribeSigner::new(&UnsubscribeConfig {
            public_base_url: "https://news.example.com".into(),
            path: "/unsub".into(),
            secret: SecretString::from("web-secret"),
        })
    }

    async fn setup() -> (Router, Arc<LibSqlBackend>, Subscriber, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LibSqlBackend::new_local(&dir.path().join("relay.db"))
                .await
                .unwrap(),
        );
        let subscriber = store
            .upsert_subscriber("a@x.com", &SubscriberUpdate::default())
            .await
            .unwrap();
        let app = unsubscribe_routes(UnsubscribeState {
            store: store.clone(),
            signer: signer(),
        });
        (app, store, subscriber, dir)
    }

    async fn get_status(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn path_and_query(link: &str) -> &str {
        link.strip_prefix("https://news.example.com").unwrap()
    }

    #[tokio::test]
    async fn valid_link_unsubscribes_once() {
        let (app, store, subscriber, _dir) = setup().await;
        let link = signer().link(&subscriber.email, &subscriber.token);

        let (status, body) = get_status(&app, path_and_query(&link)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, CONFIRMATION);
        let first = store.get_subscriber("a@x.com").await.unwrap().unwrap();
        assert!(!first.is_subscribed());
        let stamped = first.unsubscribed_at.unwrap();

        let (status, _) = get_status(&app, path_and_query(&link)).await;
        assert_eq!(status, StatusCode::OK);
        let second = store.get_subscriber("a@x.com").await.unwrap().unwrap();
        assert_eq!(second.unsubscribed_at, Some(stamped));
    }

    #[tokio::test]
    async fn missing_parameters_are_bad_request() {
        let (app, _store, _subscriber, _dir) = setup().await;
        assert_eq!(get_status(&app, "/unsub").await.0, StatusCode::BAD_REQUEST);
        assert_eq!(
            get_status(&app, "/unsub?e=a%40x.com&t=abc").await.0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_status(&app, "/unsub?e=a%40x.com&t=abc&s=").await.0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn forged_signature_is_forbidden() {
        let (app, store, subscriber, _dir) = setup().await;
        let other = UnsubscribeSigner::new(&UnsubscribeConfig {
            public_base_url: "https://news.example.com".into(),
            path: "/unsub".into(),
            secret: SecretString::from("wrong-secret"),
        });
        let link = other.link(&subscriber.email, &subscriber.token);
        assert_eq!(
            get_status(&app, path_and_query(&link)).await.0,
            StatusCode::FORBIDDEN
        );
        assert!(store.get_subscriber("a@x.com").await.unwrap().unwrap().is_subscribed());
    }

    #[tokio::test]
    async fn signed_but_stale_token_is_forbidden() {
        let (app, store, _subscriber, _dir) = setup().await;
        let link = signer().link("a@x.com", "not-the-stored-token");
        assert_eq!(
            get_status(&app, path_and_query(&link)).await.0,
            StatusCode::FORBIDDEN
        );
        assert!(store.get_subscriber("a@x.com").await.unwrap().unwrap().is_subscribed());
    }

    #[tokio::test]
    async fn unknown_address_is_forbidden() {
        let (app, _store, _subscriber, _dir) = setup().await;
        let link = signer().link("nobody@x.com", "tok");
        assert_eq!(
            get_status(&app, path_and_query(&link)).await.0,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn address_case_is_ignored() {
        let (app, store, subscriber, _dir) = setup().await;
        let signature = signer().sign("a@x.com", &subscriber.token);
        let uri = format!("/unsub?e=A%40X.com&t={}&s={signature}", subscriber.token);
        assert_eq!(get_status(&app, &uri).await.0, StatusCode::OK);
        assert!(!store.get_subscriber("a@x.com").await.unwrap().unwrap().is_subscribed());
    }
}
