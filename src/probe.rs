// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::{Future, Ready, ready};

use http::{Request, Response, StatusCode};
use tower::{Service, ServiceExt};

use crate::network;

fn empty_response<B: Default>(code: StatusCode) -> Response<B> {
    let mut resp = Response::new(B::default());
    *resp.status_mut() = code;
    resp
}

/// Answers a probe from another infrastructure component. The hash header is echoed back
/// so the prober can tell which revision of its configuration we observed; a probe
/// without one is malformed.
pub fn serve_network_probe<B, R: Default>(req: &Request<B>) -> Response<R> {
    match req
        .headers()
        .get(network::HASH_HEADER_NAME)
        .filter(|h| !h.is_empty())
    {
        Some(hash) => {
            let mut resp = empty_response(StatusCode::OK);
            resp.headers_mut()
                .insert(network::HASH_HEADER_NAME, hash.clone());
            resp
        }
        None => empty_response(StatusCode::BAD_REQUEST),
    }
}

/// The response every health probe gets once a drain has started.
pub fn draining_response<R: Default>() -> Response<R> {
    empty_response(StatusCode::SERVICE_UNAVAILABLE)
}

/// HealthCheck answers health probes while the drainer is not draining.
///
/// `E` is the error type of the wrapped service, so a health check can fail in the same
/// way the application can.
pub trait HealthCheck<Req, Res, E> {
    type Future: Future<Output = Result<Res, E>>;

    fn check(&self, req: Req) -> Self::Future;
}

/// Reports healthy for every probe.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHealthCheck;

impl<B, R: Default, E> HealthCheck<Request<B>, Response<R>, E> for DefaultHealthCheck {
    type Future = Ready<Result<Response<R>, E>>;

    fn check(&self, _req: Request<B>) -> Self::Future {
        ready(Ok(empty_response(StatusCode::OK)))
    }
}

/// Delegates health probes to an arbitrary service. Its responses, errors included, are
/// passed through untouched.
#[derive(Clone, Debug)]
pub struct ServiceHealthCheck<S>(pub S);

impl<S, Req, Res, E> HealthCheck<Req, Res, E> for ServiceHealthCheck<S>
where
    S: Service<Req, Response = Res, Error = E> + Clone,
{
    type Future = tower::util::Oneshot<S, Req>;

    fn check(&self, req: Req) -> Self::Future {
        self.0.clone().oneshot(req)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    fn probe(hash: Option<&str>) -> Request<()> {
        let mut req =
            Request::get("/").header(network::PROBE_HEADER_NAME, network::PROBE_HEADER_VALUE);
        if let Some(hash) = hash {
            req = req.header(network::HASH_HEADER_NAME, hash);
        }
        req.body(()).unwrap()
    }

    #[test]
    fn network_probe_echoes_hash() {
        let resp: Response<String> = serve_network_probe(&probe(Some("hash")));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(network::HASH_HEADER_NAME).unwrap(), "hash");
        assert!(resp.body().is_empty());
    }

    #[test]
    fn network_probe_without_hash_is_bad_request() {
        let resp: Response<String> = serve_network_probe(&probe(None));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers().get(network::HASH_HEADER_NAME).is_none());
    }

    #[test]
    fn network_probe_with_empty_hash_is_bad_request() {
        let resp: Response<String> = serve_network_probe(&probe(Some("")));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn default_health_check_is_ok() {
        let resp = <DefaultHealthCheck as HealthCheck<_, Response<String>, Infallible>>::check(
            &DefaultHealthCheck,
            Request::new(()),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn service_health_check_passes_response_through() {
        let svc = tower::service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body("checked".to_string())
                    .unwrap(),
            )
        });
        let resp = ServiceHealthCheck(svc)
            .check(Request::new(()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.body(), "checked");
    }

    #[test]
    fn draining_is_unavailable() {
        let resp: Response<String> = draining_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
