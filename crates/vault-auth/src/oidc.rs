//! Browser login through a local callback listener
//!
//! Used by the `oidc` and `thy-one` methods. The listener is bound before
//! the vault is asked for a redirect URL, so the callback can never arrive
//! at a closed port. The first callback completes the login; anything after
//! that only gets the confirmation page.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::VaultClient;
use crate::constants::{DEFAULT_CALLBACK, OIDC_AUTH_PATH, OIDC_CALLBACK_TIMEOUT};
use crate::error::{Error, Result};
use crate::grant::GrantRequest;

/// How long to wait for in-flight browser connections when shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How the login URL is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    /// Launch the platform's URL opener.
    System,
    /// Only print the URL.
    Disabled,
}

impl Browser {
    /// Try to open `url`; false if nothing could be launched.
    pub async fn open(self, url: &str) -> bool {
        if self == Browser::Disabled {
            return false;
        }
        let (program, args) = opener(url);
        match tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!(program, error = %e, "failed to launch browser");
                false
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn opener(url: &str) -> (&'static str, Vec<String>) {
    ("open", vec![url.to_owned()])
}

#[cfg(windows)]
fn opener(url: &str) -> (&'static str, Vec<String>) {
    (
        "rundll32",
        vec!["url.dll,FileProtocolHandler".to_owned(), url.to_owned()],
    )
}

#[cfg(not(any(target_os = "macos", windows)))]
fn opener(url: &str) -> (&'static str, Vec<String>) {
    ("xdg-open", vec![url.to_owned()])
}

/// Parameters of one browser login.
#[derive(Debug, Clone)]
pub struct OidcLogin {
    /// Identity provider name passed to the vault.
    pub provider: String,
    /// `host:port` to listen on. Port 0 picks a free port.
    pub callback: String,
    pub timeout: Duration,
    pub browser: Browser,
    /// Shown on the confirmation page.
    pub display_name: String,
}

impl OidcLogin {
    pub fn new(provider: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            callback: DEFAULT_CALLBACK.to_owned(),
            timeout: OIDC_CALLBACK_TIMEOUT,
            browser: Browser::System,
            display_name: display_name.into(),
        }
    }
}

#[derive(Serialize)]
struct RedirectRequest<'a> {
    provider: &'a str,
    callback_url: &'a str,
}

#[derive(Deserialize)]
struct RedirectResponse {
    redirect_url: String,
}

type CallbackResult = std::result::Result<(String, String), Error>;

/// Complete-once slot shared with the callback handler.
#[derive(Clone)]
struct CallbackState {
    done: Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>,
    page: Arc<String>,
}

impl CallbackState {
    /// Deliver `result` if nothing has been delivered yet.
    fn complete(&self, result: CallbackResult) -> bool {
        let sender = self
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

fn confirmation_page(name: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>Sign In Complete</title></head>\
         <body><h2>{name} Provider Sign In Complete</h2>\
         <p>You can close this window and return to the terminal.</p></body></html>\n"
    )
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<String> {
    let code = params.get("code").cloned().unwrap_or_default();
    let oauth_state = params.get("state").cloned().unwrap_or_default();

    let result = if code.is_empty() || oauth_state.is_empty() {
        Err(Error::Protocol(
            "missing values in callback, authorization code or state are empty".into(),
        ))
    } else {
        Ok((code, oauth_state))
    };
    if !state.complete(result) {
        debug!("ignoring repeated callback");
    }
    Html(state.page.as_str().to_owned())
}

fn callback_router(state: CallbackState) -> Router {
    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(state)
}

/// Host part of the configured callback with the port actually bound.
fn callback_host(configured: &str, bound: SocketAddr) -> String {
    match configured.rsplit_once(':') {
        Some((host, "0")) => format!("{host}:{}", bound.port()),
        Some(_) => configured.to_owned(),
        None => format!("{configured}:{}", bound.port()),
    }
}

/// Run a browser login and return the `oidc` grant to exchange.
pub async fn authorize(client: &VaultClient, login: &OidcLogin) -> Result<GrantRequest> {
    let listener = TcpListener::bind(login.callback.as_str())
        .await
        .map_err(|e| {
            Error::Transport(format!(
                "unable to open callback listener on {}: {e}",
                login.callback
            ))
        })?;
    let bound = listener
        .local_addr()
        .map_err(|e| Error::Transport(format!("callback listener address: {e}")))?;
    let callback_url = format!("http://{}/callback", callback_host(&login.callback, bound));

    let (done_tx, done_rx) = oneshot::channel();
    let state = CallbackState {
        done: Arc::new(Mutex::new(Some(done_tx))),
        page: Arc::new(confirmation_page(&login.display_name)),
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = callback_router(state.clone());
    let mut server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            state.complete(Err(Error::Transport(format!("callback listener failed: {e}"))));
        }
    });
    debug!(addr = %bound, "callback listener started");

    let outcome = wait_for_callback(client, login, &callback_url, done_rx).await;

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
        server.abort();
        let _ = server.await;
    }
    debug!(addr = %bound, "callback listener stopped");

    let (authorization_code, oauth_state) = outcome?;
    Ok(GrantRequest::Oidc {
        provider: login.provider.clone(),
        authorization_code,
        state: oauth_state,
        callback_url,
    })
}

async fn wait_for_callback(
    client: &VaultClient,
    login: &OidcLogin,
    callback_url: &str,
    done: oneshot::Receiver<CallbackResult>,
) -> CallbackResult {
    let redirect: RedirectResponse = client
        .post_json(
            OIDC_AUTH_PATH,
            &RedirectRequest {
                provider: &login.provider,
                callback_url,
            },
        )
        .await?;

    if !login.browser.open(&redirect.redirect_url).await {
        eprintln!(
            "Unable to open browser, complete login process here:\n {}",
            redirect.redirect_url
        );
    }

    match tokio::time::timeout(login.timeout, done).await {
        Ok(Ok(result)) => {
            if result.is_ok() {
                info!(provider = %login.provider, "received authorization code");
            }
            result
        }
        Ok(Err(_)) => Err(Error::Transport("callback listener stopped".into())),
        Err(_) => {
            warn!(timeout_secs = login.timeout.as_secs(), "no callback received");
            Err(Error::Timeout("no callback occurred after redirect".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::VaultEndpoint;
    use crate::error::ErrorKind;
    use axum::Json;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use tower::ServiceExt;

    /// Mock vault whose `oidc/auth` endpoint plays the browser: it hits the
    /// callback URL with `query` shortly after answering.
    async fn start_vault(query: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route(
                "/v1/oidc/auth",
                post(move |Json(body): Json<serde_json::Value>| async move {
                    let callback = body["callback_url"].as_str().unwrap().to_owned();
                    if let Some(query) = query {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            let _ = reqwest::get(format!("{callback}?{query}")).await;
                        });
                    }
                    Json(serde_json::json!({"redirect_url": "https://idp.example/authorize"}))
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn login() -> OidcLogin {
        OidcLogin {
            provider: "okta".into(),
            callback: "127.0.0.1:0".into(),
            timeout: Duration::from_secs(5),
            browser: Browser::Disabled,
            display_name: "oidc".into(),
        }
    }

    fn client(base: String) -> VaultClient {
        VaultClient::new(
            reqwest::Client::new(),
            VaultEndpoint::new("acme").with_base_url(base),
        )
    }

    #[tokio::test]
    async fn callback_with_code_and_state_completes() {
        let base = start_vault(Some("code=abc&state=xyz")).await;
        let grant = authorize(&client(base), &login()).await.unwrap();
        match grant {
            GrantRequest::Oidc {
                provider,
                authorization_code,
                state,
                callback_url,
            } => {
                assert_eq!(provider, "okta");
                assert_eq!(authorization_code, "abc");
                assert_eq!(state, "xyz");
                assert!(callback_url.starts_with("http://127.0.0.1:"));
                assert!(!callback_url.contains(":0/"), "port must be resolved: {callback_url}");
            }
            other => panic!("expected oidc grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn callback_missing_state_is_protocol_error() {
        let base = start_vault(Some("code=abc")).await;
        let err = authorize(&client(base), &login()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn timeout_frees_the_port() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let base = start_vault(None).await;
        let mut login = login();
        login.callback = addr.to_string();
        login.timeout = Duration::from_millis(200);

        let err = authorize(&client(base), &login).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "timed out: no callback occurred after redirect");

        TcpListener::bind(addr)
            .await
            .expect("callback port must be released after timeout");
    }

    #[tokio::test]
    async fn redirect_request_failure_stops_listener() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let vault_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let err = authorize(&client(format!("http://{vault_addr}")), &login())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn only_first_callback_completes() {
        let (tx, mut rx) = oneshot::channel();
        let state = CallbackState {
            done: Arc::new(Mutex::new(Some(tx))),
            page: Arc::new(confirmation_page("thy-one")),
        };
        let app = callback_router(state);

        for query in ["code=first&state=s1", "code=second&state=s2"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/callback?{query}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
                .await
                .unwrap();
            let body = String::from_utf8(body.to_vec()).unwrap();
            assert!(body.contains("thy-one Provider Sign In Complete"));
        }

        let (code, state) = rx.try_recv().unwrap().unwrap();
        assert_eq!(code, "first");
        assert_eq!(state, "s1");
    }

    #[test]
    fn callback_host_resolves_ephemeral_port() {
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(callback_host("localhost:0", bound), "localhost:40123");
        assert_eq!(callback_host("localhost:8072", bound), "localhost:8072");
    }
}
