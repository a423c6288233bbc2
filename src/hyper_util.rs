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

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1 and HTTP/2 plaintext
/// * Keeps accepting until told to stop, then waits for open connections to finish
pub struct Server {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(name: &str, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Serves `svc` on a background task until `stop` resolves. The returned handle completes
    /// once every connection accepted before that has closed.
    pub fn spawn<S, B, F>(self, svc: S, stop: F) -> JoinHandle<()>
    where
        S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<Box<dyn StdError + Send + Sync>>,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            name,
            addr,
            listener,
        } = self;
        info!(address=%addr, component=name, "listener established");
        tokio::spawn(async move {
            let builder = auto::Builder::new(TokioExecutor::new());
            let graceful = GracefulShutdown::new();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    res = listener.accept() => {
                        let (stream, peer) = match res {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!(component=name, "accept failed: {e}");
                                continue;
                            }
                        };
                        let conn = builder
                            .serve_connection_with_upgrades(
                                TokioIo::new(stream),
                                TowerToHyperService::new(svc.clone()),
                            )
                            .into_owned();
                        let conn = graceful.watch(conn);
                        let name = name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                debug!(component=name, %peer, "connection closed with error: {e}");
                            }
                        });
                    }
                    _ = &mut stop => break,
                }
            }
            drop(listener);
            info!(component = name, "stopped accepting, waiting for open connections");
            graceful.shutdown().await;
            info!(component = name, "server terminated");
        })
    }
}
