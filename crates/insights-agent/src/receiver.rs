// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debug sink for uploads: accepts the multipart archive upload and logs its entries.

use crate::archive::read_archive;
use axum::{
    extract::{FromRequest, Multipart, Request},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use chrono::SecondsFormat;
use std::io;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_LISTEN_ADDRESS: &str = ":8081";

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Expected a valid Content-Type")]
    MissingContentType,
    #[error("Expected a valid multipart request: {0}")]
    Multipart(String),
    #[error("Unrecognized form-data field: {0}")]
    UnknownField(String),
    #[error("Unrecognized part content-type: {0}")]
    UnknownContentType(String),
    #[error("Unrecognized tar archive: {0}")]
    Archive(String),
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        debug!("Rejecting upload: {self}");
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

pub fn router() -> Router {
    Router::new().fallback(receive)
}

/// `:8081` style addresses listen on every interface.
pub fn bind_address(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

pub async fn serve(listen: &str, cancel: CancellationToken) -> io::Result<()> {
    let listener = TcpListener::bind(bind_address(listen)).await?;
    info!("Receiver listening on {}", listener.local_addr()?);
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn receive(headers: HeaderMap, request: Request) -> Result<&'static str, ReceiverError> {
    info!("Handling {}", request.uri().path());
    if headers
        .get(header::CONTENT_TYPE)
        .map_or(true, |v| v.is_empty())
    {
        return Err(ReceiverError::MissingContentType);
    }
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let scheme = auth.split(' ').next().unwrap_or_default();
        info!("Authorization type = {scheme}");
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ReceiverError::Multipart(e.body_text()))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ReceiverError::Multipart(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != "file" {
            return Err(ReceiverError::UnknownField(name));
        }
        let content_type = field.content_type().unwrap_or_default().to_string();
        if !content_type.ends_with("+tgz") {
            return Err(ReceiverError::UnknownContentType(content_type));
        }
        info!("Got file with content type {content_type}");
        let body = field
            .bytes()
            .await
            .map_err(|e| ReceiverError::Multipart(e.body_text()))?;
        let records = read_archive(body.as_ref()).map_err(|e| ReceiverError::Archive(e.to_string()))?;
        for record in records {
            info!(
                "Received: {} {:7} {}",
                record.at.to_rfc3339_opts(SecondsFormat::Secs, true),
                record.data.len(),
                record.name
            );
        }
    }
    Ok("OK\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::io::Write;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    const BOUNDARY: &str = "insights-boundary";

    fn archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let data = br#"{"kind":"Node"}"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o640);
        header.set_mtime(1_704_164_645);
        header.set_cksum();
        builder
            .append_data(&mut header, "config/node/node-1.json", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn multipart(field: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        write!(
            body,
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"payload.tar.gz\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .unwrap();
        body.extend_from_slice(data);
        write!(body, "\r\n--{BOUNDARY}--\r\n").unwrap();
        body
    }

    fn upload(body: Vec<u8>) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(":8081"), "0.0.0.0:8081");
        assert_eq!(bind_address("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_logs_archive_entries() {
        let body = multipart(
            "file",
            "application/vnd.redhat.openshift.periodic+tgz",
            &archive(),
        );
        let response = router().oneshot(upload(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "OK\n");
        assert!(logs_contain(
            "Received: 2024-01-02T03:04:05Z      15 config/node/node-1.json"
        ));
    }

    #[tokio::test]
    async fn test_requires_content_type() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(response).await, "Expected a valid Content-Type");
    }

    #[tokio::test]
    async fn test_rejects_unknown_field_and_type() {
        let response = router()
            .oneshot(upload(multipart("other", "application/x+tgz", b"")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(response).await, "Unrecognized form-data field: other");

        let response = router()
            .oneshot(upload(multipart("file", "application/json", b"{}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            text(response).await,
            "Unrecognized part content-type: application/json"
        );
    }

    #[tokio::test]
    async fn test_rejects_broken_archive() {
        let response = router()
            .oneshot(upload(multipart("file", "application/x+tgz", b"not gzip")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(text(response).await.starts_with("Unrecognized tar archive:"));
    }
}
