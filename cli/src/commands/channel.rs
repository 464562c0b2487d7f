//! Channel commands

use super::{read_document, ApiClient};
use crate::{output::OutputFormat, ChannelCommands};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

#[derive(Debug, Serialize, Deserialize, Tabled)]
pub struct ChannelResult {
    pub id: String,
    pub result: String,
}

pub async fn handle(action: ChannelCommands, client: &ApiClient, format: OutputFormat) -> Result<(), String> {
    match action {
        ChannelCommands::Apply { file } => {
            let body = read_document(&file)?;
            let results: Vec<ChannelResult> = client.post("/channel", &body).await?;
            format.print_rows(&results);
        }
        ChannelCommands::Switch { channel, sla } => {
            let result: ChannelResult = client.get(&format!("/channel/{}/{}", channel, sla)).await?;
            match format {
                OutputFormat::Table => println!("{} {}", result.id.bold(), result.result),
                _ => format.print(&result),
            }
        }
    }
    Ok(())
}
