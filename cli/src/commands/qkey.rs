//! Key forwarding command

use super::ApiClient;

/// Post the payload and print the controller's transcript as is.
pub async fn send(client: &ApiClient, ovs: &str, sla: &str, payload: String) -> Result<(), String> {
    let transcript = client.post_text(&format!("/qkey/{}/{}", ovs, sla), payload).await?;
    print!("{}", transcript);
    Ok(())
}
