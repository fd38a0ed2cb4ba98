use crate::{Error, Result, get_client_name, tools::encode_base64};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tracing::*;

#[derive(Clone, Debug)]
pub struct RestClient {
    baseurl: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl RestClient {
    #[must_use]
    pub fn new(base: &str) -> Self {
        Self {
            baseurl: base.trim_end_matches('/').to_string(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut RestClient {
        self.timeout = timeout;
        self
    }

    pub fn add_header(&mut self, key: &str, value: &str) -> &mut RestClient {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn add_header_json_content(&mut self) -> &mut RestClient {
        if self.headers.contains_key("Content-Type") {
            self
        } else {
            self.add_header("Content-Type", "application/json; charset=utf-8")
        }
    }

    pub fn add_header_json_accept(&mut self) -> &mut RestClient {
        if self.headers.contains_key("Accept") {
            self
        } else {
            self.add_header("Accept", "application/json")
        }
    }

    pub fn add_header_json(&mut self) {
        self.add_header_json_content().add_header_json_accept();
    }

    pub fn add_header_basic(&mut self, username: &str, password: &str) {
        let hash = encode_base64(&format!("{username}:{password}"));
        self.add_header("Authorization", format!("Basic {hash}").as_str());
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.baseurl, path.trim_start_matches('/'))
    }

    fn get_client(&self) -> std::result::Result<Client, reqwest::Error> {
        Client::builder()
            .user_agent(get_client_name())
            .timeout(self.timeout)
            .build()
    }

    async fn send(
        &self,
        req: RequestBuilder,
        content_type: Option<&str>,
    ) -> std::result::Result<Response, reqwest::Error> {
        let mut req = req;
        for (key, val) in self.headers.iter() {
            if content_type.is_some() && key.eq_ignore_ascii_case("Content-Type") {
                continue;
            }
            req = req.header(key, val);
        }
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        req.send().await
    }

    pub async fn http_get(&self, path: &str) -> std::result::Result<Response, reqwest::Error> {
        debug!("http_get '{}' ", self.url(path));
        let client = self.get_client()?;
        self.send(client.get(self.url(path)), None).await
    }

    pub async fn http_post(&self, path: &str, body: String) -> std::result::Result<Response, reqwest::Error> {
        debug!("http_post '{}' ", self.url(path));
        let client = self.get_client()?;
        self.send(client.post(self.url(path)).body(body), None).await
    }

    pub async fn http_put(
        &self,
        path: &str,
        body: String,
        content_type: &str,
    ) -> std::result::Result<Response, reqwest::Error> {
        debug!("http_put '{}' ", self.url(path));
        let client = self.get_client()?;
        self.send(client.put(self.url(path)).body(body), Some(content_type))
            .await
    }

    /// Turn a non-2xx response into `Error::MethodFailed`, return the body otherwise
    async fn check(method: &str, response: Response) -> Result<String> {
        let status = response.status();
        let text = response.text().await.map_err(Error::ReqwestError)?;
        if !status.is_success() {
            return Err(Error::MethodFailed(
                method.to_string(),
                status.as_u16(),
                format!(
                    "The server returned the error: {} {} | {text}",
                    status.as_str(),
                    status.canonical_reason().unwrap_or("unknown")
                ),
            ));
        }
        Ok(text)
    }

    pub async fn body_get(&self, path: &str) -> Result<String> {
        let response = self.http_get(path).await.map_err(Error::ReqwestError)?;
        Self::check("Get", response).await
    }

    pub async fn json_get(&self, path: &str) -> Result<Value> {
        let text = self.body_get(path).await?;
        serde_json::from_str(&text).map_err(Error::JsonError)
    }

    pub async fn body_post(&self, path: &str, body: String) -> Result<String> {
        let response = self.http_post(path, body).await.map_err(Error::ReqwestError)?;
        Self::check("Post", response).await
    }

    pub async fn json_post(&self, path: &str, input: &Value) -> Result<String> {
        let body = serde_json::to_string(input).map_err(Error::JsonError)?;
        self.body_post(path, body).await
    }

    pub async fn body_put(&self, path: &str, body: String, content_type: &str) -> Result<String> {
        let response = self
            .http_put(path, body, content_type)
            .await
            .map_err(Error::ReqwestError)?;
        Self::check("Put", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = RestClient::new("http://10.0.0.1:18083/api/v5/");
        assert_eq!(client.url(""), "http://10.0.0.1:18083/api/v5/");
        assert_eq!(client.url("/nodes"), "http://10.0.0.1:18083/api/v5/nodes");
        assert_eq!(client.url("nodes"), "http://10.0.0.1:18083/api/v5/nodes");
    }

    #[test]
    fn test_json_headers_are_not_duplicated() {
        let mut client = RestClient::new("http://localhost");
        client.add_header("Accept", "text/plain");
        client.add_header_json();
        assert_eq!(client.headers["Accept"], "text/plain");
        assert_eq!(client.headers["Content-Type"], "application/json; charset=utf-8");
    }

    #[test]
    fn test_basic_auth_header() {
        let mut client = RestClient::new("http://localhost");
        client.add_header_basic("key", "secret");
        assert_eq!(client.headers["Authorization"], "Basic a2V5OnNlY3JldA==");
    }
}
