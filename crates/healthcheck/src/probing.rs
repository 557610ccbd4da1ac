//! Probe request construction and execution.

use crate::types::{DestinationProbingResult, ProbeResponse};
use common::{Error, Result};
use model::{ClusterModel, DestinationModel, DestinationState};
use reqwest::header::{HOST, HeaderValue, USER_AGENT};
use reqwest::{Request, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

const PROBE_USER_AGENT: &str = concat!("gateway-health-probe/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP request sent to a destination's health endpoint
pub trait ProbingRequestFactory: Send + Sync {
    fn create_request(&self, cluster: &ClusterModel, destination: &DestinationModel)
    -> Result<Request>;
}

/// GET `<probe address><path>?<query>` with the cluster's HTTP client.
///
/// Uses the destination's health address when set. A destination `host`
/// overrides the Host header.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProbingRequestFactory;

impl ProbingRequestFactory for DefaultProbingRequestFactory {
    fn create_request(
        &self,
        cluster: &ClusterModel,
        destination: &DestinationModel,
    ) -> Result<Request> {
        let active = cluster.config.active_health_check();
        let path = active.and_then(|a| a.path.as_deref()).unwrap_or("");
        let query = active.and_then(|a| a.query.as_deref());

        let url = probe_url(destination.probe_address(), path, query)?;

        let mut request = cluster
            .http_client
            .get(url)
            .header(USER_AGENT, PROBE_USER_AGENT);

        if let Some(host) = &destination.config.host {
            let value = HeaderValue::from_str(host)
                .map_err(|e| Error::probe(format!("invalid host header '{}': {}", host, e)))?;
            request = request.header(HOST, value);
        }

        request.build().map_err(Error::probe)
    }
}

/// Join a destination address with a probe path and query.
pub fn probe_url(address: &str, path: &str, query: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(address)
        .map_err(|e| Error::probe(format!("invalid probe address '{}': {}", address, e)))?;

    let base = url.path().trim_end_matches('/');
    let joined = match path {
        "" => format!("{}/", base),
        p if p.starts_with('/') => format!("{}{}", base, p),
        p => format!("{}/{}", base, p),
    };
    url.set_path(&joined);

    let query = query.map(|q| q.trim_start_matches('?')).filter(|q| !q.is_empty());
    url.set_query(query);

    Ok(url)
}

/// Send one probe, bounded by `probe_timeout`.
pub(crate) async fn probe_destination(
    factory: &dyn ProbingRequestFactory,
    cluster: &ClusterModel,
    destination: Arc<DestinationState>,
    probe_timeout: Duration,
) -> DestinationProbingResult {
    let request = match factory.create_request(cluster, &destination.model()) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                destination_id = %destination.destination_id(),
                error = %e,
                "Failed to build probe request"
            );
            return DestinationProbingResult::failed(destination, e);
        }
    };

    let start = Instant::now();
    match timeout(probe_timeout, cluster.http_client.execute(request)).await {
        Ok(Ok(response)) => {
            let latency = start.elapsed();
            debug!(
                destination_id = %destination.destination_id(),
                status = response.status().as_u16(),
                latency_ms = latency.as_millis(),
                "Probe completed"
            );
            DestinationProbingResult::responded(
                destination,
                ProbeResponse {
                    status: response.status(),
                    latency,
                },
            )
        }
        Ok(Err(e)) => {
            debug!(destination_id = %destination.destination_id(), error = %e, "Probe failed");
            DestinationProbingResult::failed(destination, Error::probe(e))
        }
        Err(_) => {
            debug!(destination_id = %destination.destination_id(), "Probe timed out");
            DestinationProbingResult::failed(destination, Error::ProbeTimeout(probe_timeout))
        }
    }
}
