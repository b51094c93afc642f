//! Structured request logging.
//!
//! Health probes are logged at debug to keep load-balancer noise out of the
//! default log level; everything else logs start and completion with method,
//! path, peer, status, and duration.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info};

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_health_probe(path: &str) -> bool {
    path == "/health" || path == "/api/v1/health"
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let quiet = is_health_probe(&path);

        if quiet {
            debug!(method = %method, path = %path, "health probe");
        } else {
            info!(
                method = %method,
                path = %path,
                remote_addr = %remote_addr,
                "request started"
            );
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration = start_time.elapsed();

            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if quiet {
                        debug!(method = %method, path = %path, status = %status, "health probe completed");
                    } else {
                        info!(
                            method = %method,
                            path = %path,
                            remote_addr = %remote_addr,
                            status = %status,
                            duration_ms = %duration.as_millis(),
                            "request completed"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        method = %method,
                        path = %path,
                        remote_addr = %remote_addr,
                        duration_ms = %duration.as_millis(),
                        error = %err,
                        "request failed"
                    );
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_probe_detection() {
        assert!(is_health_probe("/health"));
        assert!(is_health_probe("/api/v1/health"));
        assert!(!is_health_probe("/api/v1/chat"));
        assert!(!is_health_probe("/ws/audio"));
    }
}
