//! SLA Router
//!
//! Forwards opaque key material to the downstream service group bound to an
//! SLA on a switch. Deliveries are independent: one unreachable endpoint does
//! not stop the others.

use crate::store::ChannelStore;
use crate::{Result, SteerError};
use bytes::Bytes;
use futures::future::join_all;
use std::fmt::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of one endpoint delivery
#[derive(Debug)]
pub struct Delivery {
    /// Endpoint URL
    pub url: String,
    /// Response body, or why nothing came back
    pub outcome: Result<String>,
}

/// Per-request forwarding transcript
#[derive(Debug)]
pub enum RouteReport {
    /// No outport (or no service group) carries the SLA; nothing was sent
    Unresolved {
        /// Requested SLA id
        sla: String,
    },
    /// Payload offered to every endpoint of the group, in configured order
    Forwarded {
        /// Caller address
        addr: IpAddr,
        /// Payload as text
        payload: String,
        /// Delivery results
        deliveries: Vec<Delivery>,
    },
}

impl RouteReport {
    /// Plain-text transcript returned to the caller
    pub fn render(&self) -> String {
        match self {
            RouteReport::Unresolved { sla } => format!("{}\n", SteerError::UnresolvedSla(sla.clone())),
            RouteReport::Forwarded {
                addr,
                payload,
                deliveries,
            } => {
                let mut out = format!("ADDR: {} QKEY: {}\n", addr, payload);
                for delivery in deliveries {
                    let _ = writeln!(out, "URL {} RESULT:", delivery.url);
                    match &delivery.outcome {
                        Ok(body) => out.push_str(body),
                        Err(e) => out.push_str(&e.to_string()),
                    }
                    out.push('\n');
                }
                out
            }
        }
    }
}

/// Key forwarding by SLA
pub struct SlaRouter {
    store: Arc<ChannelStore>,
    client: reqwest::Client,
}

impl SlaRouter {
    /// Create router; `timeout` bounds each delivery
    pub fn new(store: Arc<ChannelStore>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| SteerError::MalformedRequest(format!("http client: {}", e)))?;
        Ok(Self { store, client })
    }

    /// Forward `payload` to the service group behind `sla` on switch `ovs`.
    pub async fn route(&self, ovs: &str, sla: &str, payload: Bytes, caller: IpAddr) -> Result<RouteReport> {
        let switch = self
            .store
            .switch(ovs)
            .ok_or_else(|| SteerError::UnknownSwitch(ovs.to_string()))?;

        let group = match switch.port_for_sla(sla) {
            Some((_, outport)) => outport.mzvs.clone(),
            None => None,
        };
        let Some(group) = group else {
            info!("ovs {}: no service group for sla {}", ovs, sla);
            return Ok(RouteReport::Unresolved { sla: sla.to_string() });
        };

        let urls = switch.group_urls(&group).map(|u| u.to_vec()).unwrap_or_else(|| {
            warn!("ovs {}: service group {} has no endpoint list", ovs, group);
            Vec::new()
        });
        info!(
            "Forwarding key from {} via ovs {} sla {} to {} endpoints",
            caller,
            ovs,
            sla,
            urls.len()
        );

        let deliveries = join_all(urls.into_iter().map(|url| self.deliver(url, payload.clone()))).await;
        Ok(RouteReport::Forwarded {
            addr: caller,
            payload: String::from_utf8_lossy(&payload).into_owned(),
            deliveries,
        })
    }

    async fn deliver(&self, url: String, payload: Bytes) -> Delivery {
        let response = match self.client.post(&url).body(payload).send().await {
            Ok(response) => response.text().await,
            Err(e) => Err(e),
        };
        let outcome = response.map_err(|e| {
            warn!("Delivery to {} failed: {}", url, e);
            SteerError::DeliveryFailure {
                url: url.clone(),
                reason: e.to_string(),
            }
        });
        Delivery { url, outcome }
    }
}
