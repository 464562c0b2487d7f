//! Status and statistics commands

use super::ApiClient;
use crate::output::OutputFormat;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

#[derive(Debug, Serialize, Deserialize)]
pub struct PortCounters {
    pub port: String,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchStats {
    pub dpid: String,
    pub packets: u64,
    #[serde(default)]
    pub ports: Vec<PortCounters>,
}

#[derive(Serialize, Tabled)]
struct SwitchRow {
    dpid: String,
    packets: u64,
    ports: usize,
    rx_packets: u64,
    tx_packets: u64,
}

impl From<&SwitchStats> for SwitchRow {
    fn from(s: &SwitchStats) -> Self {
        Self {
            dpid: s.dpid.clone(),
            packets: s.packets,
            ports: s.ports.len(),
            rx_packets: s.ports.iter().map(|p| p.rx_packets).sum(),
            tx_packets: s.ports.iter().map(|p| p.tx_packets).sum(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Tabled)]
pub struct ActivationFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub result: String,
    #[serde(default)]
    pub failed: Vec<ActivationFailure>,
}

#[derive(Serialize, Tabled)]
struct DpidRow {
    dpid: String,
}

pub async fn status(client: &ApiClient) -> Result<(), String> {
    let body = client.get_text("/status").await?;
    if body.trim() == "1" {
        println!("{} {}", client.base_url, "up".green());
        Ok(())
    } else {
        Err(format!("unexpected status reply: {:?}", body))
    }
}

pub async fn channels(client: &ApiClient) -> Result<(), String> {
    println!("{}", client.get_text("/channels").await?.trim());
    Ok(())
}

pub async fn statistics(client: &ApiClient, per_switch: bool, format: OutputFormat) -> Result<(), String> {
    if !per_switch {
        println!("{}", client.get_text("/statistics").await?.trim());
        return Ok(());
    }

    let stats: Vec<SwitchStats> = client.get("/statistics/switches").await?;
    match format {
        OutputFormat::Table => {
            let rows: Vec<SwitchRow> = stats.iter().map(SwitchRow::from).collect();
            format.print_rows(&rows);
        }
        _ => format.print(&stats),
    }
    Ok(())
}

pub async fn switches(client: &ApiClient, format: OutputFormat) -> Result<(), String> {
    let dpids: Vec<String> = client.get("/switches").await?;
    let rows: Vec<DpidRow> = dpids.into_iter().map(|dpid| DpidRow { dpid }).collect();
    format.print_rows(&rows);
    Ok(())
}

pub async fn activate(client: &ApiClient, format: OutputFormat) -> Result<(), String> {
    let response: ActivateResponse = client.get("/activate").await?;
    match format {
        OutputFormat::Table => {
            println!("{}", response.result.green());
            if !response.failed.is_empty() {
                println!("{}", "Channels not installed:".yellow());
                format.print_rows(&response.failed);
            }
        }
        _ => format.print(&response),
    }
    Ok(())
}
