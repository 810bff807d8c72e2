//! # WebHDFS Driver
//!
//! HDFS artifacts over the namenode's WebHDFS REST interface. Namenode
//! addresses are tried in order until one answers. `OPEN` and `CREATE` are
//! two-step operations: the namenode redirects to a datanode, which serves or
//! accepts the data.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, redirect, Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::driver::{
    collect_upload_files, local_target, normalize_key, relative_key, upload_key, write_local,
    ArtifactDriver, ByteStream,
};
use super::errors::{ArtifactError, ArtifactResult};
use super::types::{Artifact, ArtifactLocation};
use crate::logging::log_artifact_operation;

#[derive(Debug, Deserialize)]
struct FileStatusReply {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
struct ListStatusReply {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatuses,
}

#[derive(Debug, Deserialize)]
struct FileStatuses {
    #[serde(rename = "FileStatus", default)]
    file_status: Vec<FileStatus>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileStatus {
    #[serde(rename = "pathSuffix", default)]
    path_suffix: String,
    #[serde(rename = "type")]
    file_type: String,
}

impl FileStatus {
    fn is_directory(&self) -> bool {
        self.file_type == "DIRECTORY"
    }
}

#[derive(Debug, Clone)]
pub struct WebHdfsDriver {
    client: Client,
    addresses: Vec<String>,
    user: Option<String>,
}

impl WebHdfsDriver {
    pub fn new(addresses: Vec<String>, user: Option<String>) -> ArtifactResult<Self> {
        if addresses.is_empty() {
            return Err(ArtifactError::invalid_location(
                "HDFS location requires at least one namenode address",
            ));
        }
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ArtifactError::invalid_location(e.to_string()))?;
        Ok(Self {
            client,
            addresses,
            user,
        })
    }

    pub fn for_location(location: &ArtifactLocation) -> ArtifactResult<Self> {
        match location {
            ArtifactLocation::Hdfs {
                addresses, user, ..
            } => Self::new(addresses.clone(), user.clone()),
            other => Err(ArtifactError::invalid_location(format!(
                "{} is not an HDFS location",
                other.to_uri()
            ))),
        }
    }

    fn url(address: &str, path: &str) -> String {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        format!("{base}/webhdfs/v1/{}", path.trim_start_matches('/'))
    }

    /// Send `op` to the first namenode that accepts the connection
    async fn request(
        &self,
        method: Method,
        path: &str,
        op: &str,
        extra: &[(&str, &str)],
    ) -> ArtifactResult<Response> {
        let mut last_error = None;
        for address in &self.addresses {
            let mut query: Vec<(&str, &str)> = vec![("op", op)];
            if let Some(user) = &self.user {
                query.push(("user.name", user.as_str()));
            }
            query.extend_from_slice(extra);

            match self
                .client
                .request(method.clone(), Self::url(address, path))
                .query(&query)
                .send()
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() => {
                    debug!(namenode = %address, error = %e, "🔀 Namenode unreachable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(ArtifactError::from_reqwest(op, e)),
            }
        }
        Err(match last_error {
            Some(e) => ArtifactError::from_reqwest(op, e),
            None => ArtifactError::transient(op, "no namenode reachable"),
        })
    }

    async fn check(op: &str, path: &str, response: Response) -> ArtifactResult<Response> {
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ArtifactError::from_status(op, path, status.as_u16(), &body))
    }

    fn redirect_target(response: &Response) -> Option<String> {
        if !response.status().is_redirection() {
            return None;
        }
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    async fn status(&self, path: &str) -> ArtifactResult<Option<FileStatus>> {
        let response = self.request(Method::GET, path, "GETFILESTATUS", &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let reply: FileStatusReply = Self::check("GETFILESTATUS", path, response)
            .await?
            .json()
            .await
            .map_err(|e| ArtifactError::from_reqwest("GETFILESTATUS", e))?;
        Ok(Some(reply.file_status))
    }

    async fn list_status(&self, path: &str) -> ArtifactResult<Vec<FileStatus>> {
        let response = self.request(Method::GET, path, "LISTSTATUS", &[]).await?;
        let reply: ListStatusReply = Self::check("LISTSTATUS", path, response)
            .await?
            .json()
            .await
            .map_err(|e| ArtifactError::from_reqwest("LISTSTATUS", e))?;
        Ok(reply.file_statuses.file_status)
    }

    /// Every file below `path`, depth first
    async fn walk(&self, path: &str) -> ArtifactResult<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![path.trim_end_matches('/').to_string()];
        while let Some(dir) = pending.pop() {
            for entry in self.list_status(&dir).await? {
                let child = format!("{dir}/{}", entry.path_suffix);
                if entry.is_directory() {
                    pending.push(child);
                } else {
                    files.push(child);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn open(&self, path: &str) -> ArtifactResult<Response> {
        let response = self.request(Method::GET, path, "OPEN", &[]).await?;
        let response = Self::check("OPEN", path, response).await?;
        match Self::redirect_target(&response) {
            Some(location) => {
                let datanode = self
                    .client
                    .get(location)
                    .send()
                    .await
                    .map_err(|e| ArtifactError::from_reqwest("OPEN", e))?;
                Self::check("OPEN", path, datanode).await
            }
            None => Ok(response),
        }
    }

    async fn create(&self, path: &str, contents: Vec<u8>) -> ArtifactResult<()> {
        let response = self
            .request(Method::PUT, path, "CREATE", &[("overwrite", "true")])
            .await?;
        let response = Self::check("CREATE", path, response).await?;
        if let Some(location) = Self::redirect_target(&response) {
            let datanode = self
                .client
                .put(location)
                .body(contents)
                .send()
                .await
                .map_err(|e| ArtifactError::from_reqwest("CREATE", e))?;
            Self::check("CREATE", path, datanode).await?;
        }
        Ok(())
    }
}

fn hdfs_path(artifact: &Artifact) -> String {
    let key = normalize_key(artifact.key());
    if key.starts_with('/') {
        key
    } else {
        format!("/{key}")
    }
}

#[async_trait]
impl ArtifactDriver for WebHdfsDriver {
    fn name(&self) -> &str {
        "hdfs"
    }

    async fn load(&self, artifact: &Artifact, local_path: &Path) -> ArtifactResult<()> {
        let path = hdfs_path(artifact);
        let status = self
            .status(&path)
            .await?
            .ok_or_else(|| ArtifactError::not_found(&path))?;

        if !status.is_directory() {
            let contents = self
                .open(&path)
                .await?
                .bytes()
                .await
                .map_err(|e| ArtifactError::from_reqwest("OPEN", e))?;
            write_local(local_path, &contents).await?;
            log_artifact_operation("load", "hdfs", &path, "downloaded", None);
            return Ok(());
        }

        let files = self.walk(&path).await?;
        if files.is_empty() {
            return Err(ArtifactError::not_found(&path));
        }
        let mut fetched = Vec::with_capacity(files.len());
        for file in &files {
            let contents = self
                .open(file)
                .await?
                .bytes()
                .await
                .map_err(|e| ArtifactError::from_reqwest("OPEN", e))?;
            fetched.push((file, contents));
        }
        for (file, contents) in fetched {
            write_local(&local_target(local_path, relative_key(&path, file)), &contents).await?;
        }
        log_artifact_operation(
            "load",
            "hdfs",
            &path,
            "downloaded",
            Some(&format!("{} files", files.len())),
        );
        Ok(())
    }

    async fn save(&self, local_path: &Path, artifact: &Artifact) -> ArtifactResult<()> {
        let path = hdfs_path(artifact);
        let files = collect_upload_files(local_path)?;
        for (file, relative) in &files {
            let contents = tokio::fs::read(file)
                .await
                .map_err(|e| ArtifactError::io(file, &e))?;
            self.create(&upload_key(&path, relative), contents).await?;
        }
        log_artifact_operation(
            "save",
            "hdfs",
            &path,
            "uploaded",
            Some(&format!("{} files", files.len())),
        );
        Ok(())
    }

    async fn open_stream(&self, artifact: &Artifact) -> ArtifactResult<ByteStream> {
        let path = hdfs_path(artifact);
        let response = self.open(&path).await?;
        Ok(response
            .bytes_stream()
            .map_err(|e| ArtifactError::from_reqwest("OPEN", e))
            .boxed())
    }

    async fn delete(&self, artifact: &Artifact) -> ArtifactResult<()> {
        let path = hdfs_path(artifact);
        let response = self
            .request(Method::DELETE, &path, "DELETE", &[("recursive", "true")])
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check("DELETE", &path, response).await?;
        log_artifact_operation("delete", "hdfs", &path, "deleted", None);
        Ok(())
    }

    async fn list_objects(&self, artifact: &Artifact) -> ArtifactResult<Vec<String>> {
        let path = hdfs_path(artifact);
        match self.status(&path).await? {
            None => Ok(Vec::new()),
            Some(status) if !status.is_directory() => Ok(vec![path]),
            Some(_) => self.walk(&path).await,
        }
    }

    async fn is_directory(&self, artifact: &Artifact) -> ArtifactResult<bool> {
        let path = hdfs_path(artifact);
        Ok(self
            .status(&path)
            .await?
            .map(|status| status.is_directory())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn artifact(server: &MockServer, key: &str) -> (WebHdfsDriver, Artifact) {
        let location = ArtifactLocation::Hdfs {
            path: key.into(),
            addresses: vec![server.uri()],
            user: Some("flowmill".into()),
        };
        let driver = WebHdfsDriver::for_location(&location).unwrap();
        (driver, Artifact::new("data", location))
    }

    #[tokio::test]
    async fn test_load_single_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/webhdfs/v1/data/out.csv"))
            .and(query_param("op", "GETFILESTATUS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "FileStatus": {"pathSuffix": "", "type": "FILE"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/webhdfs/v1/data/out.csv"))
            .and(query_param("op", "OPEN"))
            .and(query_param("user.name", "flowmill"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n1,2\n"))
            .mount(&server)
            .await;

        let (driver, artifact) = artifact(&server, "/data/out.csv");
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.csv");
        driver.load(&artifact, &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "a,b\n1,2\n");
        assert!(!driver.is_directory(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("op", "GETFILESTATUS"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (driver, artifact) = artifact(&server, "/missing");
        let dir = tempfile::tempdir().unwrap();
        let err = driver.load(&artifact, dir.path()).await.unwrap_err();
        assert_eq!(err, ArtifactError::not_found("/missing"));
        assert!(driver.list_objects(&artifact).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_namenode_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503).set_body_string("safe mode"))
            .mount(&server)
            .await;

        let (driver, artifact) = artifact(&server, "/data");
        let err = driver.delete(&artifact).await.unwrap_err();
        assert!(err.is_transient());
    }
}
