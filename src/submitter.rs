use crate::payload::{ErrorBody, Submission, SubmissionAccepted, API_KEY_HEADER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Network failure, timeout, 408, 429 or 5xx. Worth another attempt.
    #[error("временная ошибка отправки: {0}")]
    Transient(String),
    #[error("сервер отклонил API-ключ (HTTP {status})")]
    FatalAuth { status: u16 },
    #[error("сервер отклонил снимок (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },
}

pub struct Submitter {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl Submitter {
    pub fn new(backend_url: &str, api_key: String, timeout: Duration) -> Result<Self, SubmitError> {
        let client = Client::builder()
            .user_agent(concat!("proccensus/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| SubmitError::Transient(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: submit_endpoint(backend_url),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn submit(&self, sub: &Submission) -> Result<SubmissionAccepted, SubmitError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(sub)
            .send()
            .await
            .map_err(|err| SubmitError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SubmissionAccepted>()
                .await
                .map_err(|err| SubmitError::Transient(format!("некорректный ответ сервера: {err}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

fn submit_endpoint(backend_url: &str) -> String {
    format!("{}/submit/", backend_url.trim_end_matches('/'))
}

fn classify_failure(status: StatusCode, body: &str) -> SubmitError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubmitError::FatalAuth {
            status: status.as_u16(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SubmitError::Transient(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => SubmitError::Transient(format!("HTTP {}", s.as_u16())),
        s => SubmitError::Rejected {
            status: s.as_u16(),
            reason: rejection_reason(body),
        },
    }
}

fn rejection_reason(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.details.is_empty() => err.message,
        Ok(err) => {
            let details: Vec<String> = err.details.iter().map(ToString::to_string).collect();
            format!("{}: {}", err.message, details.join("; "))
        }
        Err(_) => body.chars().take(200).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_has_single_trailing_slash() {
        assert_eq!(
            submit_endpoint("http://127.0.0.1:8000/api/v1/"),
            "http://127.0.0.1:8000/api/v1/submit/"
        );
        assert_eq!(
            submit_endpoint("http://collector/api/v1"),
            "http://collector/api/v1/submit/"
        );
    }

    #[test]
    fn status_classes() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, ""),
            SubmitError::FatalAuth { status: 401 }
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, ""),
            SubmitError::FatalAuth { status: 403 }
        ));
        for s in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(classify_failure(s, ""), SubmitError::Transient(_)));
        }
        assert!(matches!(
            classify_failure(StatusCode::PAYLOAD_TOO_LARGE, ""),
            SubmitError::Rejected { status: 413, .. }
        ));
    }

    #[test]
    fn rejection_reason_uses_field_errors() {
        let body = r#"{"error":"validation_error","message":"ошибка валидации","details":[{"field":"processes[0].pid","message":"должно быть >= 0"}]}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, body);
        match err {
            SubmitError::Rejected { status, reason } => {
                assert_eq!(status, 400);
                assert!(reason.contains("processes[0].pid"));
            }
            other => panic!("ожидался Rejected, получено {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out_as_transient() {
        use crate::storage::test_support::submission;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("порт");
        let addr = listener.local_addr().expect("адрес");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("соединение");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let submitter = Submitter::new(
            &format!("http://{addr}/api/v1"),
            "key".to_string(),
            Duration::from_secs(1),
        )
        .expect("клиент");
        let started = std::time::Instant::now();
        let err = submitter
            .submit(&submission("h1", vec![]))
            .await
            .expect_err("сервер молчит");
        assert!(matches!(err, SubmitError::Transient(_)), "получено {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        server.abort();
    }
}
