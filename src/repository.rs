// Copyright 2019 CoreOS, Inc.
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

//! HTTP client for the recipe server: recipe bodies (`configs`) and volume
//! manifests (`labels`).
//!
//! Listing calls use a short timeout since they should always be cheap;
//! body calls get a longer one since a recipe or manifest fetch can
//! contend with other traffic on a booting machine's network link. A
//! failure listing either collection aborts startup (there's nothing
//! useful to fall back to); a failure fetching one named item is logged
//! and that item is skipped, so one broken recipe doesn't block every
//! other recipe from being offered.

use std::time::Duration;

use reqwest::blocking::{self, Response};
use reqwest::{StatusCode, Url};

use crate::errors::{Error, Result};

const LISTING_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(20);

pub struct RepositoryClient {
    base_url: Url,
    listing_client: blocking::Client,
    body_client: blocking::Client,
}

impl RepositoryClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let base_url = Url::parse(&format!("http://{host}:{port}/"))
            .map_err(|e| Error::Config(format!("invalid repository host/port: {e}")))?;
        let listing_client = build_client(LISTING_TIMEOUT)?;
        let body_client = build_client(BODY_TIMEOUT)?;
        Ok(RepositoryClient { base_url, listing_client, body_client })
    }

    pub fn list_configs(&self) -> Result<Vec<String>> {
        self.list("configs/")
    }

    pub fn list_labels(&self) -> Result<Vec<String>> {
        self.list("labels/")
    }

    /// Fetches every listed recipe, skipping (with a warning) any that
    /// fail to fetch individually.
    pub fn fetch_all_configs(&self) -> Result<Vec<(String, String)>> {
        self.fetch_all("configs", self.list_configs()?)
    }

    /// Fetches every listed volume manifest, skipping (with a warning) any
    /// that fail to fetch individually.
    pub fn fetch_all_labels(&self) -> Result<Vec<(String, String)>> {
        self.fetch_all("labels", self.list_labels()?)
    }

    pub fn fetch_config(&self, name: &str) -> Result<String> {
        self.fetch_body("configs", name)
    }

    pub fn fetch_label(&self, name: &str) -> Result<String> {
        self.fetch_body("labels", name)
    }

    fn fetch_all(&self, collection: &str, names: Vec<String>) -> Result<Vec<(String, String)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.fetch_body(collection, &name) {
                Ok(body) => out.push((name, body)),
                Err(e) => plog_warn!("repository", "failed to fetch {collection}/{name}: {e}"),
            }
        }
        Ok(out)
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Config(format!("building URL for {path}: {e}")))?;
        let resp = get(&self.listing_client, &url)?;
        resp.json::<Vec<String>>()
            .map_err(|e| Error::External {
                command: format!("GET {url}"),
                status: "decoding JSON listing".to_string(),
                stderr: Some(e.to_string()),
            })
    }

    fn fetch_body(&self, collection: &str, name: &str) -> Result<String> {
        let url = self
            .base_url
            .join(&format!("{collection}/{name}"))
            .map_err(|e| Error::Config(format!("building URL for {collection}/{name}: {e}")))?;
        let resp = get(&self.body_client, &url)?;
        resp.text().map_err(|e| Error::External {
            command: format!("GET {url}"),
            status: "decoding response body".to_string(),
            stderr: Some(e.to_string()),
        })
    }
}

fn build_client(timeout: Duration) -> Result<blocking::Client> {
    blocking::ClientBuilder::new()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("building HTTP client: {e}")))
}

fn get(client: &blocking::Client, url: &Url) -> Result<Response> {
    let resp = client.get(url.as_str()).send().map_err(|e| Error::External {
        command: format!("GET {url}"),
        status: "request failed".to_string(),
        stderr: Some(e.to_string()),
    })?;
    match resp.status() {
        StatusCode::OK => Ok(resp),
        status => Err(Error::External {
            command: format!("GET {url}"),
            status: status.to_string(),
            stderr: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_host_with_embedded_whitespace() {
        let err = RepositoryClient::new("not a host", 80).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builds_expected_listing_url() {
        let client = RepositoryClient::new("10.0.0.1", 2021).unwrap();
        let url = client.base_url.join("configs/").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:2021/configs/");
    }

    #[test]
    fn builds_expected_body_url() {
        let client = RepositoryClient::new("10.0.0.1", 2021).unwrap();
        let url = client.base_url.join("labels/cluster-a.yaml").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:2021/labels/cluster-a.yaml");
    }
}
