//! Fallback handler: every request no host route claims goes to a plugin.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use plinth_abi::{RequestEnvelope, ResponseEnvelope};

use super::{dispatch_error, error_response};
use crate::state::AppState;

pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = to_envelope(&method, &uri, &headers, body);
    match state.host.dispatch(request).await {
        Ok(response) => into_response(response),
        Err(e) => {
            tracing::debug!(%method, path = %uri.path(), "dispatch failed: {e}");
            dispatch_error(&e).into_response()
        }
    }
}

fn to_envelope(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> RequestEnvelope {
    let mut request = RequestEnvelope::new(method.as_str(), uri.path()).with_body(body.to_vec());
    if let Some(query) = uri.query() {
        request.query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
    }
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => request.headers.push((name.as_str().to_string(), value.to_string())),
            Err(_) => tracing::debug!(header = %name, "dropping non-text request header"),
        }
    }
    request
}

fn into_response(envelope: ResponseEnvelope) -> Response {
    let Ok(status) = StatusCode::from_u16(envelope.status) else {
        tracing::warn!(status = envelope.status, "plugin returned an invalid status code");
        return error_response(
            StatusCode::BAD_GATEWAY,
            format!("plugin returned invalid status {}", envelope.status),
        )
        .into_response();
    };

    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in envelope.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid plugin response header"),
        }
    }
    response
}
