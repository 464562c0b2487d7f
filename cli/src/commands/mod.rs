//! CLI Commands

pub mod channel;
pub mod config;
pub mod ovs;
pub mod qkey;
pub mod status;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;

/// Control API client
pub struct ApiClient {
    pub base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// GET returning the plain-text body
    pub async fn get_text(&self, path: &str) -> Result<String, String> {
        let resp = self.client.get(self.url(path)).send().await.map_err(|e| e.to_string())?;
        Self::body(resp).await
    }

    /// GET returning a JSON body
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let text = self.get_text(path).await?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }

    /// POST a JSON document, returning a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, String> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let text = Self::body(resp).await?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }

    /// POST raw text, returning the plain-text body
    pub async fn post_text(&self, path: &str, body: String) -> Result<String, String> {
        let resp = self
            .client
            .post(self.url(path))
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Self::body(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Error responses carry a plain-text explanation
    async fn body(resp: reqwest::Response) -> Result<String, String> {
        let status = resp.status();
        let text = resp.text().await.map_err(|e| e.to_string())?;
        if status.is_success() {
            Ok(text)
        } else if text.is_empty() {
            Err(status.to_string())
        } else {
            Err(format!("{} ({})", text.trim_end(), status))
        }
    }
}

/// Read a JSON or YAML document
pub fn read_document(file: &str) -> Result<serde_json::Value, String> {
    let content = fs::read_to_string(file).map_err(|e| format!("{}: {}", file, e))?;
    if file.ends_with(".yaml") || file.ends_with(".yml") {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_and_json_documents_agree() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("channels.json");
        let yaml = dir.path().join("channels.yaml");
        std::fs::write(&json, r#"{"1": {"sla": "2", "active": "1"}}"#).unwrap();
        std::fs::write(&yaml, "\"1\":\n  sla: \"2\"\n  active: \"1\"\n").unwrap();

        let from_json = read_document(json.to_str().unwrap()).unwrap();
        let from_yaml = read_document(yaml.to_str().unwrap()).unwrap();
        assert_eq!(from_json, from_yaml);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = ApiClient::new("http://127.0.0.1:8080/");
        assert_eq!(client.url("/status"), "http://127.0.0.1:8080/status");
    }
}
