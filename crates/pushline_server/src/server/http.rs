#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::connection::{admit, reject};
use crate::server::metrics::EXPOSITION_CONTENT_TYPE;
use crate::server::send::send_message;
use crate::server::state::AppState;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(3);

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Largest `/send` form body read into memory.
const MAX_FORM_BODY: usize = 10 << 20;

type HttpResponse = Response<Full<Bytes>>;

/// Accept HTTP connections on `listener` until it fails.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	loop {
		let (stream, addr) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				warn!(error = %err, "accept failed");
				tokio::time::sleep(Duration::from_millis(50)).await;
				continue;
			}
		};

		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new()
				.timer(TokioTimer::new())
				.header_read_timeout(HEADER_READ_TIMEOUT)
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(error = %err, %addr, "http connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: AppState) -> Result<HttpResponse, hyper::Error> {
	let path = req.uri().path().to_string();

	let resp = match path.as_str() {
		"/ws" => handle_upgrade(req, state),
		"/send" => handle_send(req, state).await,
		"/metrics" => {
			if req.method() != Method::GET {
				empty_response(StatusCode::METHOD_NOT_ALLOWED)
			} else {
				let mut resp = text_response(StatusCode::OK, state.metrics.render());
				resp.headers_mut()
					.insert(header::CONTENT_TYPE, HeaderValue::from_static(EXPOSITION_CONTENT_TYPE));
				resp
			}
		}
		other => match state.health.respond(other) {
			Some(_) if req.method() != Method::GET => empty_response(StatusCode::METHOD_NOT_ALLOWED),
			Some((status, body)) => text_response(status, body),
			None => empty_response(StatusCode::NOT_FOUND),
		},
	};

	Ok(resp)
}

/// Complete the WebSocket handshake, then authenticate and admit (or reject) on the upgraded socket.
fn handle_upgrade(mut req: Request<Incoming>, state: AppState) -> HttpResponse {
	let key = match websocket_key(req.method(), req.headers()) {
		Ok(key) => key,
		Err(reason) => return text_response(StatusCode::BAD_REQUEST, format!("upgrade error: {reason}")),
	};

	let accept = match HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
		Ok(v) => v,
		Err(_) => return text_response(StatusCode::BAD_REQUEST, "upgrade error: invalid key"),
	};

	let on_upgrade = hyper::upgrade::on(&mut req);
	let (parts, _body) = req.into_parts();
	let auth = state.authenticator.authenticate(&parts);
	let conn_id = state.next_conn_id();
	let ctx = state.connections.clone();

	tokio::spawn(async move {
		let upgraded = match on_upgrade.await {
			Ok(upgraded) => upgraded,
			Err(err) => {
				warn!(conn_id, error = %err, "websocket upgrade failed");
				return;
			}
		};

		let ws = WebSocketStream::from_raw_socket(
			TokioIo::new(upgraded),
			Role::Server,
			Some(ctx.settings.websocket_config()),
		)
		.await;

		match auth {
			Ok(uid) => match admit(conn_id, uid, ws, ctx).await {
				Ok(tasks) => {
					let uid = tasks.handle.identifier().clone();
					tasks.join().await;
					debug!(conn_id, uid = %uid, "connection finished");
				}
				Err(err) => warn!(conn_id, error = %err, "connection admission failed"),
			},
			Err(err) => {
				metrics::counter!("pushline_auth_failures_total").increment(1);
				info!(conn_id, error = %err, "authentication failed");
				reject(ws, &err.to_string(), ctx.settings.auth_error_write_wait).await;
			}
		}
	});

	let mut resp = empty_response(StatusCode::SWITCHING_PROTOCOLS);
	let headers = resp.headers_mut();
	headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

/// Validate an upgrade request and return its `Sec-WebSocket-Key`.
fn websocket_key(method: &Method, headers: &HeaderMap) -> Result<String, &'static str> {
	if method != Method::GET {
		return Err("request method is not GET");
	}

	let connection_upgrade = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
	if !connection_upgrade {
		return Err("'upgrade' token not found in 'Connection' header");
	}

	let upgrade_websocket = headers
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")));
	if !upgrade_websocket {
		return Err("'websocket' token not found in 'Upgrade' header");
	}

	let version_ok = headers
		.get(header::SEC_WEBSOCKET_VERSION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.trim() == "13");
	if !version_ok {
		return Err("unsupported version: websocket protocol version must be 13");
	}

	headers
		.get(header::SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.ok_or("'Sec-WebSocket-Key' header is missing")
}

async fn handle_send(req: Request<Incoming>, state: AppState) -> HttpResponse {
	let (parts, body) = req.into_parts();

	if parts.method != Method::GET && parts.method != Method::POST {
		return empty_response(StatusCode::METHOD_NOT_ALLOWED);
	}

	let mut params = parse_form(parts.uri.query().unwrap_or_default().as_bytes());

	let is_form = parts
		.headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.trim_start().starts_with(FORM_CONTENT_TYPE));
	if parts.method == Method::POST && is_form {
		let declared = parts
			.headers
			.get(header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.trim().parse::<u64>().ok());
		if declared.is_some_and(|len| len > MAX_FORM_BODY as u64) {
			return empty_response(StatusCode::PAYLOAD_TOO_LARGE);
		}

		let body = match read_limited(body, MAX_FORM_BODY).await {
			Ok(body) => body,
			Err(status) => return empty_response(status),
		};
		params.extend(parse_form(&body));
	}

	let uid = params.get("uid").map(String::as_str);
	let text = params.get("message").cloned().unwrap_or_default();

	match send_message(&state, uid, text).await {
		Ok(()) => empty_response(StatusCode::OK),
		Err(err) => text_response(err.status(), err.to_string()),
	}
}

/// Buffer at most `limit` bytes of `body`.
async fn read_limited<B>(body: B, limit: usize) -> Result<Bytes, StatusCode>
where
	B: Body,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	match Limited::new(body, limit).collect().await {
		Ok(collected) => Ok(collected.to_bytes()),
		Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => Err(StatusCode::PAYLOAD_TOO_LARGE),
		Err(err) => {
			debug!(error = %err, "send body read failed");
			Err(StatusCode::BAD_REQUEST)
		}
	}
}

/// First value per key.
fn parse_form(input: &[u8]) -> HashMap<String, String> {
	let mut out = HashMap::new();
	for (k, v) in url::form_urlencoded::parse(input) {
		out.entry(k.into_owned()).or_insert_with(|| v.into_owned());
	}
	out
}

fn empty_response(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	fn upgrade_headers() -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		h.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
		h.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
		h
	}

	#[test]
	fn accepts_well_formed_upgrade() {
		let key = websocket_key(&Method::GET, &upgrade_headers()).unwrap();
		assert_eq!(derive_accept_key(key.as_bytes()), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn rejects_plain_http_requests() {
		assert!(websocket_key(&Method::GET, &HeaderMap::new()).is_err());
		assert!(websocket_key(&Method::POST, &upgrade_headers()).is_err());

		let mut h = upgrade_headers();
		h.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
		assert!(websocket_key(&Method::GET, &h).is_err());

		let mut h = upgrade_headers();
		h.remove(header::SEC_WEBSOCKET_KEY);
		assert!(websocket_key(&Method::GET, &h).is_err());
	}

	#[tokio::test]
	async fn form_body_over_limit_is_refused() {
		let body = Full::new(Bytes::from(vec![b'a'; 65]));
		assert_eq!(read_limited(body, 64).await, Err(StatusCode::PAYLOAD_TOO_LARGE));

		let body = Full::new(Bytes::from_static(b"uid=123"));
		assert_eq!(read_limited(body, 64).await, Ok(Bytes::from_static(b"uid=123")));
	}

	#[test]
	fn form_keeps_first_value_per_key() {
		let params = parse_form(b"uid=123&message=Hello+World&uid=456");
		assert_eq!(params.get("uid").map(String::as_str), Some("123"));
		assert_eq!(params.get("message").map(String::as_str), Some("Hello World"));
	}
}
