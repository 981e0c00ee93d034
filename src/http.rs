use anyhow::Result;
use async_trait::async_trait;
use ubcore::net::{HttpClient, HttpRequest, HttpResponse};

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx statuses come back as responses; the caller decides what they mean.
#[derive(Debug, Clone)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::task::spawn_blocking(move || {
            let response = match request.method.as_str() {
                "POST" => {
                    let mut req = ureq::post(&request.url)
                        .config()
                        .http_status_as_error(false)
                        .timeout_global(request.timeout)
                        .build();
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    match request.body {
                        Some(body) => req.send(&body[..])?,
                        None => req.send(&[])?,
                    }
                }
                method => {
                    return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
                }
            };

            let status_code = response.status().as_u16();
            let body = response.into_body().read_to_vec()?;

            Ok(HttpResponse { status_code, body })
        })
        .await?
    }
}
