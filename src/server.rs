use std::{net::SocketAddr, sync::Arc};

use axum::{
    Form, Router,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use verification_keys::{
    IndexOutcome, Realm, Session, Store, User, api_keys_index,
    apikeys::{API_KEYS_PATH, REALM_SELECT_PATH, SIGNOUT_PATH},
    session::{CsrfToken, Flash, REALM_COOKIE, cookie_value, expired_cookie, session_cookie},
};

use crate::views::{RealmSelectContext, SignedOutContext, View, render_html};

#[derive(Clone)]
struct AppState {
    store: Store,
    forward_auth: ForwardAuthConfig,
    options: ServeOptions,
}

/// Identifies the signed-in user from a header set by an authenticating
/// proxy, or as a fixed development user.
#[derive(Clone, Debug)]
pub struct ForwardAuthConfig {
    user_header: Option<HeaderName>,
    dev_user_email: Option<String>,
}

impl ForwardAuthConfig {
    pub fn new(user_header: Option<HeaderName>, dev_user_email: Option<String>) -> Self {
        Self {
            user_header,
            dev_user_email,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.user_header.is_some() || self.dev_user_email.is_some()
    }

    fn user_header(&self) -> Option<&HeaderName> {
        self.user_header.as_ref()
    }

    fn dev_user_email(&self) -> Option<&str> {
        self.dev_user_email.as_deref()
    }

    fn user_email(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(email) = self.dev_user_email() {
            return Some(email.to_owned());
        }

        self.user_header()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ServeOptions {
    /// Upper bound on concurrent per-app stats lookups.
    pub stats_concurrency: usize,
    pub secure_cookies: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            stats_concurrency: 4,
            secure_cookies: false,
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn root_redirect() -> Redirect {
    Redirect::to(API_KEYS_PATH)
}

async fn resolve_user(state: &AppState, headers: &HeaderMap) -> Option<User> {
    let email = state.forward_auth.user_email(headers)?;
    match state.store.find_user_by_email(&email).await {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            tracing::debug!(%email, "forward-auth user is not registered");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to resolve session user");
            None
        }
    }
}

fn selected_realm_id(headers: &HeaderMap) -> Option<i64> {
    cookie_value(headers, REALM_COOKIE).and_then(|raw| raw.parse().ok())
}

async fn resolve_realm(state: &AppState, headers: &HeaderMap, user: &User) -> Option<Realm> {
    let realm_id = selected_realm_id(headers)?;
    match state.store.find_user_realm(user.id, realm_id).await {
        Ok(realm) => realm,
        Err(err) => {
            tracing::warn!(user_id = user.id, realm_id, error = %err, "failed to resolve realm");
            None
        }
    }
}

fn with_session_cookies(
    mut response: Response,
    options: &ServeOptions,
    flash: &Flash,
    csrf: Option<&CsrfToken>,
) -> Response {
    let headers = response.headers_mut();
    if let Some(cookie) = flash.set_cookie(options.secure_cookies) {
        headers.append(SET_COOKIE, cookie);
    }
    if let Some(cookie) = csrf.and_then(|token| token.set_cookie(options.secure_cookies)) {
        headers.append(SET_COOKIE, cookie);
    }
    response
}

fn append_cookie(response: &mut Response, cookie: String) {
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(err) => tracing::warn!(error = %err, "dropping malformed cookie"),
    }
}

async fn api_keys_index_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let mut flash = Flash::from_headers(&headers);
    let csrf = CsrfToken::from_headers(&headers);

    let user = resolve_user(&state, &headers).await;
    let realm = match user.as_ref() {
        Some(user) => resolve_realm(&state, &headers, user).await,
        None => None,
    };

    let outcome = api_keys_index(
        &state.store,
        Session { user, realm },
        &mut flash,
        csrf.field(),
        state.options.stats_concurrency,
    )
    .await;

    let response = match outcome {
        IndexOutcome::Redirect(path) => Redirect::to(path).into_response(),
        IndexOutcome::Render(ctx) => render_html(&View::ApiKeys(ctx)),
    };
    with_session_cookies(response, &state.options, &flash, Some(&csrf))
}

async fn realm_select_page(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let mut flash = Flash::from_headers(&headers);
    let csrf = CsrfToken::from_headers(&headers);

    let Some(user) = resolve_user(&state, &headers).await else {
        flash.error("Unauthorized.");
        return with_session_cookies(
            Redirect::to(SIGNOUT_PATH).into_response(),
            &state.options,
            &flash,
            None,
        );
    };

    let realms = match state.store.user_realms(user.id).await {
        Ok(realms) => realms,
        Err(err) => {
            tracing::warn!(user_id = user.id, error = %err, "failed to load realms");
            flash.error_now(format!("Failed to load realms: {err}"));
            Vec::new()
        }
    };

    let view = View::RealmSelect(RealmSelectContext {
        user,
        realms,
        current_realm_id: selected_realm_id(&headers),
        flash: flash.render(),
        csrf: csrf.field(),
    });
    with_session_cookies(render_html(&view), &state.options, &flash, Some(&csrf))
}

#[derive(Debug, Deserialize)]
struct SelectRealmForm {
    realm_id: i64,
    csrf_token: String,
}

async fn select_realm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<SelectRealmForm>,
) -> Response {
    let csrf = CsrfToken::from_headers(&headers);
    if !csrf.verify(&form.csrf_token) {
        tracing::warn!("rejected realm selection with invalid CSRF token");
        return (StatusCode::FORBIDDEN, "invalid CSRF token").into_response();
    }

    let mut flash = Flash::from_headers(&headers);
    let Some(user) = resolve_user(&state, &headers).await else {
        flash.error("Unauthorized.");
        return with_session_cookies(
            Redirect::to(SIGNOUT_PATH).into_response(),
            &state.options,
            &flash,
            None,
        );
    };

    match state.store.find_user_realm(user.id, form.realm_id).await {
        Ok(Some(realm)) => {
            tracing::info!(user_id = user.id, realm_id = realm.id, "realm selected");
            let mut response = Redirect::to(API_KEYS_PATH).into_response();
            append_cookie(
                &mut response,
                session_cookie(
                    REALM_COOKIE,
                    &realm.id.to_string(),
                    state.options.secure_cookies,
                ),
            );
            with_session_cookies(response, &state.options, &flash, None)
        }
        Ok(None) => {
            flash.error("Realm not found.");
            with_session_cookies(
                Redirect::to(REALM_SELECT_PATH).into_response(),
                &state.options,
                &flash,
                None,
            )
        }
        Err(err) => {
            tracing::warn!(user_id = user.id, error = %err, "failed to select realm");
            flash.error(format!("Failed to select realm: {err}"));
            with_session_cookies(
                Redirect::to(REALM_SELECT_PATH).into_response(),
                &state.options,
                &flash,
                None,
            )
        }
    }
}

async fn signout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let mut flash = Flash::from_headers(&headers);
    let view = View::SignedOut(SignedOutContext {
        flash: flash.render(),
    });

    let mut response = render_html(&view);
    append_cookie(
        &mut response,
        expired_cookie(REALM_COOKIE, state.options.secure_cookies),
    );
    with_session_cookies(response, &state.options, &flash, None)
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root_redirect))
        .route(API_KEYS_PATH, get(api_keys_index_page))
        .route(REALM_SELECT_PATH, get(realm_select_page).post(select_realm))
        .route(SIGNOUT_PATH, get(signout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    store: Store,
    forward_auth: ForwardAuthConfig,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    if !forward_auth.is_enabled() {
        tracing::warn!("no forward-auth header or development user configured; every request will be signed out");
    }

    let state = Arc::new(AppState {
        store,
        forward_auth,
        options,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("API key console listening on http://{bound_addr}");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
