use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hermes_core::error::AppError;
use hermes_core::models::{HttpResponse, OutboundRequest, Route};
use hermes_core::traits::Transport;
use reqwest::Client;
use reqwest::header::USER_AGENT;

const DEFAULT_USER_AGENT: &str = "Hermes/0.1";

/// HTTP transport using reqwest.
///
/// Sends one request per call and reports every HTTP status as a response;
/// only connect, timeout and protocol failures become errors. One client is
/// kept per proxy so connection pools are reused across attempts.
#[derive(Clone)]
pub struct ReqwestTransport {
    direct: Client,
    proxied: Arc<Mutex<HashMap<String, Client>>>,
    timeout: Duration,
}

fn builder(timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .timeout(timeout)
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Per-attempt timeout, connect through body.
    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let direct = builder(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            direct,
            proxied: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        })
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, AppError> {
        let Some(proxy_url) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Proxy client cache mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        if let Some(client) = clients.get(proxy_url) {
            return Ok(client.clone());
        }

        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| AppError::HttpError(format!("Invalid proxy '{proxy_url}': {e}")))?;
        let client = builder(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        tracing::debug!(proxy = %proxy_url, "Built proxied client");
        clients.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }

    fn map_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest, route: &Route) -> Result<HttpResponse, AppError> {
        let client = self.client_for(route.proxy.as_deref())?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        // an explicit header from the caller wins over rotation
        if request.header("user-agent").is_none()
            && let Some(agent) = &route.user_agent
        {
            builder = builder.header(USER_AGENT, agent);
        }
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_core::models::Method;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_returns_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-page", "1")
                    .set_body_string("[1,2,3]"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(
                &OutboundRequest::get(format!("{}/items", server.uri())),
                &Route::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "[1,2,3]");
        assert_eq!(response.headers.get("x-page").map(String::as_str), Some("1"));
        assert_eq!(response.json::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_error_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(&OutboundRequest::get(server.uri()), &Route::default())
            .await
            .unwrap();

        assert_eq!(response.status, 503);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_post_sends_json_and_route_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("user-agent", "agent/2.0"))
            .and(header("x-api-key", "secret"))
            .and(body_json(serde_json::json!({"page": 2})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let request = OutboundRequest::post(
            format!("{}/search", server.uri()),
            serde_json::json!({"page": 2}),
        )
        .with_header("X-Api-Key", "secret");
        let route = Route {
            user_agent: Some("agent/2.0".into()),
            proxy: None,
        };

        let response = transport.send(&request, &route).await.unwrap();
        assert_eq!(response.status, 201);
    }

    #[tokio::test]
    async fn test_explicit_user_agent_wins() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(header("user-agent", "caller/1.0"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let request =
            OutboundRequest::new(Method::Delete, server.uri()).with_header("User-Agent", "caller/1.0");
        let route = Route {
            user_agent: Some("rotated/9.9".into()),
            proxy: None,
        };

        assert_eq!(transport.send(&request, &route).await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_timeout(Duration::from_millis(200)).unwrap();
        let err = transport
            .send(&OutboundRequest::get(server.uri()), &Route::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new().unwrap();
        let err = transport
            .send(&OutboundRequest::get(format!("http://{addr}/")), &Route::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_rejected() {
        let transport = ReqwestTransport::new().unwrap();
        let route = Route {
            user_agent: None,
            proxy: Some("not a proxy url".into()),
        };

        let err = transport
            .send(&OutboundRequest::get("http://example.com/"), &route)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid proxy"));
    }

    #[test]
    fn test_proxied_clients_are_cached() {
        let transport = ReqwestTransport::new().unwrap();
        transport.client_for(Some("http://10.0.0.1:3128")).unwrap();
        transport.client_for(Some("http://10.0.0.1:3128")).unwrap();
        transport.client_for(Some("socks5://10.0.0.2:1080")).unwrap();
        assert_eq!(transport.proxied.lock().unwrap().len(), 2);
    }
}
