use crate::address_table::Target;
use crate::routing::ParseError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::time::Duration;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Request-local failures. None of these outlive the request that hit them.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Bad routing headers: {0}")]
    Route(#[from] ParseError),

    #[error("Could not connect to {target}: {message}")]
    Connect { target: Target, message: String },

    #[error("Connecting to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: Target, timeout: Duration },

    #[error("Upstream {target} failed: {source}")]
    Upstream {
        target: Target,
        #[source]
        source: hyper::Error,
    },

    #[error("Cannot build upstream request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn upstream(target: &Target, source: hyper::Error) -> Self {
        ProxyError::Upstream {
            target: target.clone(),
            source,
        }
    }

    /// Failed before any connection was attempted
    pub fn is_validation(&self) -> bool {
        matches!(self, ProxyError::Route(_) | ProxyError::InvalidRequest(_))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    /// Plain-text response describing the failure
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status();
        let mut response = Response::new(text_body(format!("{}\n", self)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

fn text_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_response_is_plain_text_400() {
        let err = ProxyError::from(ParseError::InvalidPort {
            header: "x-server-port",
            value: "70000".to_string(),
        });
        assert!(err.is_validation());

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("port"));
        assert!(text.contains("70000"));
    }

    #[test]
    fn test_connect_error_names_target() {
        let err = ProxyError::Connect {
            target: Target::new("10.1.1.1", 81),
            message: "connection refused".to_string(),
        };
        assert!(!err.is_validation());
        assert!(err.to_string().contains("10.1.1.1:81"));
    }
}
