use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use tracing::info;

/// Request/response logging middleware.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let identity = client_identity(&request);

    let response = next.run(request).await;

    info!(
        target: "hubgate::middleware",
        method = %method,
        uri = %uri,
        identity = %identity,
        status = %response.status(),
        "request completed"
    );

    response
}

/// Resolve the client identity used for admission control.
///
/// The TLS-terminating reverse proxy in front of the gateway sets the
/// forwarding headers; the socket address is the fallback for direct
/// connections.
pub fn client_identity(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.trim().to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_takes_precedence() {
        let mut request = Request::new(axum::body::Body::empty());
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(client_identity(&request), "192.168.1.1");
    }

    #[test]
    fn real_ip_header_is_second_choice() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(client_identity(&request), "203.0.113.1");
    }

    #[test]
    fn connect_info_is_the_fallback() {
        let mut request = Request::new(axum::body::Body::empty());
        let addr: SocketAddr = "10.1.2.3:55555".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        assert_eq!(client_identity(&request), "10.1.2.3");
    }

    #[test]
    fn unknown_without_any_source() {
        let request = Request::new(axum::body::Body::empty());
        assert_eq!(client_identity(&request), "unknown");
    }
}
