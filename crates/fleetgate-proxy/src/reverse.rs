//! HTTP reverse proxy in front of a load balancer's in-memory address.

use std::error::Error as StdError;

use http::uri::{PathAndQuery, Uri};
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::ForwardError;
use crate::memnet::MemoryNetwork;

/// Forwards HTTP/1.1 requests to one load balancer.
///
/// Every request gets its own connection; the balancer picks a backend
/// per connection.
#[derive(Clone)]
pub struct ReverseProxy {
    network: MemoryNetwork,
    address: String,
}

impl ReverseProxy {
    pub fn new(network: MemoryNetwork, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    /// The balancer address requests are sent to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send `req` through the balancer and return the backend's response.
    ///
    /// Method, headers and body pass through unchanged. The request
    /// target is reduced to origin form.
    pub async fn forward<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let stream = self
            .network
            .dial(&self.address)
            .await
            .map_err(ForwardError::Dial)?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(ForwardError::Handshake)?;

        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(balancer = %address, error = %e, "proxied connection error");
            }
        });

        *req.uri_mut() = origin_form(req.uri());
        sender.send_request(req).await.map_err(ForwardError::Request)
    }
}

fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;

    /// Serve one echo responder on `name` that reports what it received.
    fn echo_server(network: &MemoryNetwork, name: &str) {
        let mut listener = network.listen(name).unwrap();
        tokio::spawn(async move {
            while let Some(stream) = listener.accept().await {
                tokio::spawn(async move {
                    let svc = service_fn(|req: Request<Incoming>| async move {
                        let summary = format!(
                            "{} {} host={}",
                            req.method(),
                            req.uri(),
                            req.headers()
                                .get(http::header::HOST)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("-"),
                        );
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let text = format!("{summary} body={}", String::from_utf8_lossy(&body));
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(text))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
    }

    #[test]
    fn origin_form_strips_scheme_and_authority() {
        let uri: Uri = "http://a1.example.org/path?x=1".parse().unwrap();
        assert_eq!(origin_form(&uri), "/path?x=1");
        let uri: Uri = "http://a1.example.org".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");
    }

    #[tokio::test]
    async fn forwards_request_verbatim() {
        let network = MemoryNetwork::new();
        echo_server(&network, "lb:80");
        let proxy = ReverseProxy::new(network, "lb:80");

        let req = Request::post("http://a1.example.org/submit?q=2")
            .header(http::header::HOST, "a1.example.org")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let resp = proxy.forward(req).await.unwrap();
        assert!(resp.status().is_success());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            Bytes::from_static(b"POST /submit?q=2 host=a1.example.org body=payload")
        );
    }

    #[tokio::test]
    async fn missing_balancer_is_a_dial_error() {
        let proxy = ReverseProxy::new(MemoryNetwork::new(), "nowhere:80");
        let req = Request::get("/").body(Empty::<Bytes>::new()).unwrap();
        let err = proxy.forward(req).await.unwrap_err();
        assert!(matches!(err, ForwardError::Dial(_)));
    }
}
