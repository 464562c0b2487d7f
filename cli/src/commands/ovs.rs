//! Switch descriptor commands

use super::{read_document, ApiClient};
use crate::{output::OutputFormat, OvsCommands};
use colored::Colorize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct OvsResult {
    pub result: String,
}

pub async fn handle(action: OvsCommands, client: &ApiClient, format: OutputFormat) -> Result<(), String> {
    match action {
        OvsCommands::Update { file } => {
            let body = read_document(&file)?;
            if !body.is_object() {
                return Err(format!("{}: expected a map of switch id to descriptor", file));
            }
            let result: OvsResult = client.post("/ovs", &body).await?;
            match format {
                OutputFormat::Table => println!("{}", result.result.green()),
                _ => format.print(&result),
            }
        }
    }
    Ok(())
}
