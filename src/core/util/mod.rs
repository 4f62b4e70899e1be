use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http::{header, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

/// Generic HTTP client.
///
/// A trait is used here so to facilitate native HTTP/TLS when compiled for mobile applications.
/// The engine uses it to reach external authorization servers and federation entities.
#[async_trait]
pub trait AsyncHttpClient: Send + Sync {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

pub(crate) fn base_request() -> http::request::Builder {
    Request::builder().header(header::USER_AGENT, "openid4vc")
}

fn ensure_success(url: &str, response: &Response<Vec<u8>>) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        bail!(
            "request to '{url}' failed with status {status}: {}",
            String::from_utf8_lossy(response.body())
        )
    }
    Ok(())
}

/// GET `url` and return the body as text.
pub async fn fetch_text(client: &dyn AsyncHttpClient, url: &str) -> Result<String> {
    let request = base_request()
        .method(Method::GET)
        .uri(url)
        .body(vec![])
        .context("unable to build request")?;
    let response = client.execute(request).await?;
    ensure_success(url, &response)?;
    String::from_utf8(response.into_body()).context("response body was not utf-8")
}

/// POST an `application/x-www-form-urlencoded` body and decode the JSON response.
pub async fn post_form<T: DeserializeOwned>(
    client: &dyn AsyncHttpClient,
    url: &str,
    form: &[(&str, &str)],
) -> Result<T> {
    let response = send_json(client, Method::POST, url, Some(RequestBody::Form(form)), &[]).await?;
    if !response.status.is_success() {
        bail!(
            "request to '{url}' failed with status {}: {}",
            response.status,
            response.body
        )
    }
    serde_json::from_value(response.body).context("response body was not the expected json")
}

pub enum RequestBody<'a> {
    Form(&'a [(&'a str, &'a str)]),
    Json(&'a Json),
}

/// The JSON answer of an endpoint, successful or not. Empty bodies are [Json::Null].
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Json,
}

impl JsonResponse {
    /// The OAuth `error` of an error response.
    pub fn error(&self) -> Option<&str> {
        if self.status.is_success() {
            return None;
        }
        self.body.get("error").and_then(Json::as_str)
    }
}

/// Send a request with extra `headers` and read the JSON answer without judging its status.
pub async fn send_json(
    client: &dyn AsyncHttpClient,
    method: Method,
    url: &str,
    body: Option<RequestBody<'_>>,
    headers: &[(&str, String)],
) -> Result<JsonResponse> {
    let mut request = base_request()
        .method(method)
        .uri(url)
        .header(header::ACCEPT, "application/json");
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }
    let body = match body {
        Some(RequestBody::Form(form)) => {
            request = request.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
            serde_urlencoded::to_string(form)
                .context("unable to encode form")?
                .into_bytes()
        }
        Some(RequestBody::Json(json)) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            serde_json::to_vec(json).context("unable to encode json")?
        }
        None => vec![],
    };
    let request = request.body(body).context("unable to build request")?;
    let response = client.execute(request).await?;
    let status = response.status();
    let body = if response.body().is_empty() {
        Json::Null
    } else {
        match serde_json::from_slice(response.body()) {
            Ok(json) => json,
            Err(_) if !status.is_success() => {
                Json::String(String::from_utf8_lossy(response.body()).into_owned())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("response of '{url}' was not json"))
            }
        }
    };
    Ok(JsonResponse { status, body })
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::StatusCode;

    struct Fixed(StatusCode, &'static str);

    #[async_trait]
    impl AsyncHttpClient for Fixed {
        async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
            assert_eq!(
                request.headers().get(header::USER_AGENT).unwrap(),
                "openid4vc"
            );
            Ok(Response::builder()
                .status(self.0)
                .body(self.1.as_bytes().to_vec())?)
        }
    }

    #[tokio::test]
    async fn fetch_and_post() {
        let ok = Fixed(StatusCode::OK, r#"{"access_token":"abc"}"#);
        assert_eq!(
            fetch_text(&ok, "https://example.com").await.unwrap(),
            r#"{"access_token":"abc"}"#
        );
        let json: serde_json::Value = post_form(&ok, "https://example.com/token", &[("a", "b")])
            .await
            .unwrap();
        assert_eq!(json["access_token"], "abc");

        let failing = Fixed(StatusCode::BAD_REQUEST, "invalid_grant");
        let err = fetch_text(&failing, "https://example.com").await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
        let err = post_form::<serde_json::Value>(&failing, "https://example.com/token", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn error_responses_keep_their_body() {
        let oauth = Fixed(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_scope","error_description":"unknown scope"}"#,
        );
        let body = serde_json::json!({"transaction_id": "tx"});
        let response = send_json(
            &oauth,
            Method::POST,
            "https://example.com/deferred",
            Some(RequestBody::Json(&body)),
            &[("authorization", "Bearer abc".into())],
        )
        .await
        .unwrap();
        assert_eq!(response.error(), Some("invalid_scope"));

        let empty = Fixed(StatusCode::NO_CONTENT, "");
        let response = send_json(&empty, Method::POST, "https://example.com/n", None, &[])
            .await
            .unwrap();
        assert_eq!(response.body, serde_json::Value::Null);
        assert_eq!(response.error(), None);
    }
}
