// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use http::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use http::{Method, Response, StatusCode, Uri};
use tracing::{debug, error, info};

use crate::auth::{Authenticator, PasswordRequest};
use crate::fqdn::Fqdn;
use crate::store::{RecordKind, RecordStore};
use crate::update::{self, UpdateError, UpdateRequest};

/// Everything the HTTP interface works on
pub struct WebState {
    store: Arc<RecordStore>,
    authenticator: Arc<Authenticator>,
    debug_mode: bool,
}

impl WebState {
    /// With `debug_mode`, `GET /` lists every stored record
    pub fn new(
        store: Arc<RecordStore>,
        authenticator: Arc<Authenticator>,
        debug_mode: bool,
    ) -> Self {
        Self {
            store,
            authenticator,
            debug_mode,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Index,
    Update {
        domain: &'a str,
        kind: Option<RecordKind>,
    },
}

fn route(path: &str) -> Option<Route<'_>> {
    let segments = path.trim_start_matches('/');
    if segments.is_empty() {
        return Some(Route::Index);
    }

    let mut segments = segments.split('/');
    if segments.next() != Some("update") {
        return None;
    }

    let domain = segments.next().filter(|d| !d.is_empty())?;
    let kind = match segments.next() {
        None => None,
        Some("v4") => Some(RecordKind::V4),
        Some("v6") => Some(RecordKind::V6),
        Some(_) => return None,
    };

    if segments.next().is_some() {
        return None;
    }

    Some(Route::Update { domain, kind })
}

fn response(status: StatusCode, body: impl Into<String>) -> Response<String> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Answers one HTTP request
pub(crate) async fn handle(state: &WebState, method: &Method, uri: &Uri) -> Response<String> {
    let Some(route) = route(uri.path()) else {
        debug!("no route for {}", uri.path());
        return response(StatusCode::NOT_FOUND, "Not found");
    };

    if *method != Method::GET {
        let mut response = response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    match route {
        Route::Index => index(state),
        Route::Update { domain, kind } => {
            let params: HashMap<String, String> =
                url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
                    .into_owned()
                    .collect();
            handle_update(state, domain, kind, &params).await
        }
    }
}

fn index(state: &WebState) -> Response<String> {
    if !state.debug_mode {
        return response(StatusCode::OK, "Working");
    }

    let mut page = String::from(
        "<!DOCTYPE html><html><head><meta charset='utf-8'><title>dyndns</title></head><body>\
         <table><tr><th>Type</th><th>Domain</th><th>IP</th><th>Root domain</th></tr>",
    );

    for partition in state.store.snapshot() {
        let root = escape_html(partition.root.as_str());
        for (rtype, records) in [("A", &partition.v4), ("AAAA", &partition.v6)] {
            for (name, addr) in records {
                // writing to a String can not fail
                let _ = write!(
                    page,
                    "<tr><td>{rtype}</td><td>{}</td><td>{}</td><td>{root}</td></tr>",
                    escape_html(name.as_str()),
                    escape_html(addr),
                );
            }
        }
    }
    page.push_str("</table></body></html>");

    let mut response = response(StatusCode::OK, page);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

async fn handle_update(
    state: &WebState,
    domain: &str,
    kind: Option<RecordKind>,
    params: &HashMap<String, String>,
) -> Response<String> {
    let param = |name: &str| params.get(name).filter(|v| !v.is_empty()).cloned();

    let Some(user) = param("user") else {
        return response(StatusCode::BAD_REQUEST, "Missing user query parameter");
    };
    let Some(password) = param("password") else {
        return response(StatusCode::BAD_REQUEST, "Missing password query parameter");
    };
    if let Err(e) = Fqdn::new(domain) {
        return response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let auth_request = PasswordRequest {
        user,
        password,
        domain: domain.to_string(),
    };
    match state.authenticator.authenticate(&auth_request).await {
        Ok(true) => (),
        Ok(false) => {
            info!("rejected update of {domain} by {}", auth_request.user);
            return response(StatusCode::FORBIDDEN, "Forbidden");
        }
        Err(e) => {
            error!("could not authenticate {}: {e}", auth_request.user);
            return response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    }

    let request = match kind {
        Some(RecordKind::V4) => UpdateRequest {
            domain: domain.to_string(),
            ipv4: param("ipv4"),
            ipv6: None,
        },
        Some(RecordKind::V6) => UpdateRequest {
            domain: domain.to_string(),
            ipv4: None,
            ipv6: param("ipv6"),
        },
        None => UpdateRequest {
            domain: domain.to_string(),
            ipv4: param("ipv4"),
            ipv6: param("ipv6"),
        },
    };

    match update::apply(&state.store, &request) {
        Ok(outcome) => {
            info!(
                "{} updated {} in {}",
                auth_request.user, outcome.name, outcome.root
            );
            response(StatusCode::OK, "OK")
        }
        Err(UpdateError::MissingAddress) => {
            let message = match kind {
                Some(RecordKind::V4) => "Missing ipv4 query parameter",
                Some(RecordKind::V6) => "Missing ipv6 query parameter",
                None => "Missing ipv4 or ipv6 query parameter",
            };
            response(StatusCode::BAD_REQUEST, message)
        }
        Err(e @ UpdateError::NotFound(_)) => response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthFile, AuthPolicy, UserEntry};

    fn state(policy: AuthPolicy, debug_mode: bool) -> WebState {
        let store = RecordStore::new([
            Fqdn::new("example.com.").unwrap(),
            Fqdn::new("example.org.").unwrap(),
        ]);

        let mut file = AuthFile::default();
        file.insert(
            "alice",
            UserEntry {
                password: "secret".to_string(),
                hashed: false,
                domains: vec![
                    "www.example.com".to_string(),
                    "www.other.org".to_string(),
                ],
            },
        );
        let authenticator = Authenticator::new(file, policy).unwrap();

        WebState::new(Arc::new(store), Arc::new(authenticator), debug_mode)
    }

    async fn get(state: &WebState, uri: &str) -> Response<String> {
        handle(state, &Method::GET, &uri.parse().unwrap()).await
    }

    #[test]
    fn test_route() {
        assert_eq!(route("/"), Some(Route::Index));
        assert_eq!(route(""), Some(Route::Index));
        assert_eq!(
            route("/update/www.example.com/v4"),
            Some(Route::Update {
                domain: "www.example.com",
                kind: Some(RecordKind::V4)
            })
        );
        assert_eq!(
            route("/update/www.example.com"),
            Some(Route::Update {
                domain: "www.example.com",
                kind: None
            })
        );
        assert_eq!(route("/update/www.example.com/v5"), None);
        assert_eq!(route("/update//v4"), None);
        assert_eq!(route("/update/a/v4/extra"), None);
        assert_eq!(route("/favicon.ico"), None);
    }

    #[tokio::test]
    async fn test_index() {
        let response = get(&state(AuthPolicy::Strict, false), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "Working");
    }

    #[tokio::test]
    async fn test_update_v4() {
        let state = state(AuthPolicy::Strict, false);
        let response = get(
            &state,
            "/update/www.example.com/v4?user=alice&password=secret&ipv4=1.2.3.4",
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "OK");
        assert_eq!(
            state
                .store
                .lookup(&Fqdn::new("www.example.com.").unwrap(), RecordKind::V4)
                .as_deref(),
            Some("1.2.3.4")
        );
    }

    #[tokio::test]
    async fn test_update_combined() {
        let state = state(AuthPolicy::Strict, false);
        let response = get(
            &state,
            "/update/www.example.com?user=alice&password=secret&ipv4=1.2.3.4&ipv6=%3A%3A1",
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state
                .store
                .lookup(&Fqdn::new("www.example.com.").unwrap(), RecordKind::V6)
                .as_deref(),
            Some("::1")
        );
    }

    #[tokio::test]
    async fn test_missing_parameters() {
        let state = state(AuthPolicy::Strict, false);

        let response = get(&state, "/update/www.example.com/v4?password=secret").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), "Missing user query parameter");

        let response = get(&state, "/update/www.example.com/v4?user=alice").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), "Missing password query parameter");

        let response = get(&state, "/update/www.example.com/v4?user=alice&password=secret").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), "Missing ipv4 query parameter");

        let response = get(
            &state,
            "/update/www.example.com/v6?user=alice&password=secret&ipv6=not-an-ip",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authentication_failures() {
        let strict = state(AuthPolicy::Strict, false);

        let response = get(
            &strict,
            "/update/www.example.com/v4?user=alice&password=wrong&ipv4=1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = get(
            &strict,
            "/update/www.example.com/v4?user=mallory&password=secret&ipv4=1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let lenient = state(AuthPolicy::Lenient, false);
        let response = get(
            &lenient,
            "/update/www.example.com/v4?user=mallory&password=secret&ipv4=1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_update_outside_roots() {
        let state = state(AuthPolicy::Strict, false);
        let response = get(
            &state,
            "/update/www.other.org/v4?user=alice&password=secret&ipv4=1.2.3.4",
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.store.partitions().iter().all(|p| !p.is_v4_dirty()));
    }

    #[tokio::test]
    async fn test_not_found_and_method() {
        let state = state(AuthPolicy::Strict, false);

        assert_eq!(get(&state, "/nope").await.status(), StatusCode::NOT_FOUND);

        let response = handle(&state, &Method::POST, &"/".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET");
    }

    #[tokio::test]
    async fn test_debug_listing() {
        let state = state(AuthPolicy::Strict, true);
        state
            .store
            .update(&Fqdn::new("b.example.com.").unwrap(), RecordKind::V4, "2.2.2.2")
            .unwrap();
        state
            .store
            .update(&Fqdn::new("a.example.com.").unwrap(), RecordKind::V4, "<1>")
            .unwrap();

        let response = get(&state, "/").await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html; charset=utf-8");

        let body = response.body();
        let a = body.find("a.example.com.").unwrap();
        let b = body.find("b.example.com.").unwrap();
        assert!(a < b);
        assert!(body.contains("<td>&lt;1&gt;</td>"));
        assert!(!body.contains("<1>"));
    }
}
