use std::{net::SocketAddr, sync::Arc};

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Bytes,
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::controller::LoadBalancerController;

struct AdminState {
    registry: Registry,
    controller: Arc<LoadBalancerController>,
}

fn text(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
}

fn metrics(registry: &Registry) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn serve_req<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);
    match (&method, path.as_str()) {
        (&Method::GET, "/metrics") => metrics(&state.registry),
        (&Method::GET, "/healthz") => {
            match state.controller.cluster_manager().is_healthy().await {
                Ok(()) => text(StatusCode::OK, "ok"),
                Err(e) => text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("cluster unhealthy: {}", e),
                ),
            }
        }
        (_, "/delete-all-and-quit") => {
            info!("deleting all cloud resources and quitting on request");
            match state.controller.stop(true).await {
                Ok(()) => text(StatusCode::OK, "ok"),
                Err(e) => {
                    error!("deleting all cloud resources failed: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Binds `addr` and serves `/metrics`, `/healthz` and `/delete-all-and-quit`
/// from a background task that keeps running after the controller stopped.
pub(crate) async fn start_admin_server(
    addr: SocketAddr,
    registry: Registry,
    controller: Arc<LoadBalancerController>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("admin server listening on http://{}", local_addr);
    let state = Arc::new(AdminState {
        registry,
        controller,
    });
    let server = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accepting admin connection failed: {}", e);
                    continue;
                }
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| serve_req(req, state.clone()));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("admin connection from {} failed: {}", remote_addr, e);
                }
            });
        }
    });
    Ok((local_addr, server))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;
    use k8s_openapi::api::{
        core::v1::{Node, Service},
        networking::v1::Ingress,
    };
    use kube_runtime::reflector;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::{
        cluster_manager::tests::new_cluster_manager, fakes::FakeCloud,
        status::tests::RecordingStatusWriter,
    };

    async fn controller(fake: &FakeCloud) -> Arc<LoadBalancerController> {
        let cm = Arc::new(new_cluster_manager(fake).await);
        let (ingresses, _) = reflector::store::<Ingress>();
        let (services, _) = reflector::store::<Service>();
        let (nodes, _) = reflector::store::<Node>();
        LoadBalancerController::new(
            cm,
            ingresses,
            services,
            nodes,
            Arc::new(RecordingStatusWriter::default()),
            Duration::from_secs(30),
        )
    }

    async fn state(fake: &FakeCloud) -> Arc<AdminState> {
        Arc::new(AdminState {
            registry: Registry::new(),
            controller: controller(fake).await,
        })
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn call(state: &Arc<AdminState>, method: Method, path: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(())
            .unwrap();
        let response = serve_req(req, state.clone()).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reflects_the_default_backend() {
        let fake = FakeCloud::default();
        let state = state(&fake).await;
        assert_eq!(
            (StatusCode::OK, "ok".to_string()),
            call(&state, Method::GET, "/healthz").await
        );
        assert_eq!(
            StatusCode::NOT_FOUND,
            call(&state, Method::GET, "/nope").await.0
        );
        assert_eq!(StatusCode::OK, call(&state, Method::GET, "/metrics").await.0);

        assert_eq!(
            StatusCode::OK,
            call(&state, Method::POST, "/delete-all-and-quit").await.0
        );
        assert!(fake.backend_services.names().is_empty());
        let (status, body) = call(&state, Method::GET, "/healthz").await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, status);
        assert!(body.starts_with("cluster unhealthy"));
    }

    #[tokio::test]
    async fn server_keeps_answering_after_quit() {
        let fake = FakeCloud::default();
        let (addr, server) = start_admin_server(
            "127.0.0.1:0".parse().unwrap(),
            Registry::new(),
            controller(&fake).await,
        )
        .await
        .unwrap();

        assert!(http_get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
        assert!(
            http_get(addr, "/delete-all-and-quit")
                .await
                .starts_with("HTTP/1.1 200")
        );
        let response = http_get(addr, "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 500"));
        assert!(response.contains("cluster unhealthy"));
        assert!(http_get(addr, "/metrics").await.starts_with("HTTP/1.1 200"));
        server.abort();
    }
}
