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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response};
use pin_project_lite::pin_project;
use tower::{Layer, Service};
use tracing::trace;

use crate::classify::RequestKind;
use crate::drain::Drainer;
use crate::probe::{self, DefaultHealthCheck, HealthCheck, ServiceHealthCheck};

/// DrainLayer applies [`DrainService`] to a service.
#[derive(Clone, Debug)]
pub struct DrainLayer<H = DefaultHealthCheck> {
    drainer: Drainer,
    health: H,
}

impl DrainLayer {
    pub fn new(drainer: Drainer) -> Self {
        DrainLayer {
            drainer,
            health: DefaultHealthCheck,
        }
    }
}

impl<H> DrainLayer<H> {
    /// Answer health probes with `svc` instead of a bare 200 while not draining.
    pub fn with_health_check<S>(self, svc: S) -> DrainLayer<ServiceHealthCheck<S>> {
        DrainLayer {
            drainer: self.drainer,
            health: ServiceHealthCheck(svc),
        }
    }
}

impl<S, H: Clone> Layer<S> for DrainLayer<H> {
    type Service = DrainService<S, H>;

    fn layer(&self, inner: S) -> Self::Service {
        DrainService {
            inner,
            health: self.health.clone(),
            drainer: self.drainer.clone(),
        }
    }
}

/// DrainService routes each request according to its [`RequestKind`]:
/// * network probes are answered directly and never touch drain state;
/// * health probes get a 503 once draining, and otherwise go to the health check;
/// * everything else is forwarded to the inner service, restarting the quiet period if
///   a drain is in progress.
#[derive(Clone, Debug)]
pub struct DrainService<S, H = DefaultHealthCheck> {
    inner: S,
    health: H,
    drainer: Drainer,
}

impl<S, H, ReqBody, ResBody> Service<Request<ReqBody>> for DrainService<S, H>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    H: HealthCheck<Request<ReqBody>, Response<ResBody>, S::Error>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, H::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        match self.drainer.classifier().classify(&req) {
            RequestKind::NetworkProbe => {
                trace!(uri = %req.uri(), "answering network probe");
                ResponseFuture::direct(probe::serve_network_probe(&req))
            }
            RequestKind::HealthProbe if self.drainer.is_draining() => {
                trace!(uri = %req.uri(), "failing health probe while draining");
                ResponseFuture::direct(probe::draining_response())
            }
            RequestKind::HealthProbe => ResponseFuture::Health {
                future: self.health.check(req),
            },
            RequestKind::Ordinary => {
                self.drainer.on_request();
                ResponseFuture::Inner {
                    future: self.inner.call(req),
                }
            }
        }
    }
}

pin_project! {
    /// Response future for [`DrainService`].
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F, H, B> {
        Inner {
            #[pin]
            future: F,
        },
        Health {
            #[pin]
            future: H,
        },
        Direct {
            response: Option<Response<B>>,
        },
    }
}

impl<F, H, B> ResponseFuture<F, H, B> {
    fn direct(response: Response<B>) -> Self {
        ResponseFuture::Direct {
            response: Some(response),
        }
    }
}

impl<F, H, B, E> Future for ResponseFuture<F, H, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    H: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Inner { future } => future.poll(cx),
            ResponseFutureProj::Health { future } => future.poll(cx),
            ResponseFutureProj::Direct { response } => {
                Poll::Ready(Ok(response.take().expect("polled after completion")))
            }
        }
    }
}
