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

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tower::Layer;
use tracing::{info, warn};

use crate::drain::{DrainOutcome, Drainer};
use crate::hyper_util::Server;
use crate::service::DrainLayer;
use crate::time::deadline_after;
use crate::{config, signal, telemetry};

/// Starts serving `config.listen_addr` with a trivial application behind the drainer.
pub async fn build(config: config::Config) -> anyhow::Result<Bound> {
    let drainer = Drainer::new(config.drainer.clone());
    let shutdown = signal::Shutdown::new();

    let server = Server::bind("http", config.listen_addr)
        .await
        .context("http server starts")?;
    let address = server.address();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let svc = DrainLayer::new(drainer.clone()).layer(tower::service_fn(handle));
    let server = server.spawn(svc, async move {
        let _ = stop_rx.await;
    });

    Ok(Bound {
        address,
        drainer,
        shutdown,
        config,
        stop_tx,
        server,
    })
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(Response::new(Full::new(Bytes::from(format!(
        "{} {}\n",
        req.method(),
        req.uri().path()
    )))))
}

pub struct Bound {
    pub address: SocketAddr,
    pub drainer: Drainer,
    pub shutdown: signal::Shutdown,

    config: config::Config,
    stop_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Bound {
    /// Waits for a shutdown signal, then drains: health probes start failing and we wait for
    /// traffic to go quiet before closing the listener and letting open connections finish.
    /// The whole sequence is bounded by the termination grace period.
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        let Bound {
            drainer,
            shutdown,
            config,
            stop_tx,
            server,
            ..
        } = self;
        shutdown.wait().await;

        let deadline = deadline_after(config.termination_grace_period);
        match time::timeout_at(deadline, drainer.drain()).await {
            Ok(DrainOutcome::Drained) => info!("traffic went quiet, closing listener"),
            Ok(DrainOutcome::Aborted) => warn!("drain was reset, closing listener anyway"),
            Err(_) => warn!(
                "traffic did not go quiet within {:?}, closing listener",
                config.termination_grace_period
            ),
        }

        let _ = stop_tx.send(());
        match time::timeout_at(deadline, server).await {
            Ok(Ok(())) => info!(
                uptime = ?telemetry::APPLICATION_START_TIME.elapsed(),
                "shutdown completed gracefully"
            ),
            Ok(Err(e)) => return Err(e).context("http server task"),
            Err(_) => warn!(
                "graceful shutdown did not complete in {:?}, terminating now",
                config.termination_grace_period
            ),
        }
        Ok(())
    }
}
