//! HTTP client for a Hugging Face style content hub.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::{ContentSource, ProduceError};
use crate::models::RepoType;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Path characters that must be escaped in a repository file path. `/` is kept.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'`')
	.add(b'{')
	.add(b'}');

#[derive(Debug, Deserialize)]
struct RepoInfo {
	#[serde(default)]
	siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
	rfilename: String,
}

#[derive(Debug, Deserialize)]
struct DatasetSummary {
	id: String,
}

#[derive(Debug, Clone)]
pub struct HubClient {
	http: reqwest::Client,
	endpoint: String,
}

impl HubClient {
	/// `timeout` bounds connecting and each read; a download that keeps
	/// receiving bytes may take as long as it needs.
	pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
		let http = reqwest::Client::builder()
			.connect_timeout(timeout)
			.read_timeout(timeout)
			.user_agent(concat!("cellar/", env!("CARGO_PKG_VERSION")))
			.build()?;
		Ok(Self { http, endpoint: endpoint.into().trim_end_matches('/').to_string() })
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	fn info_url(&self, repo_id: &str, repo_type: RepoType) -> String {
		format!("{}/api/{}s/{}", self.endpoint, repo_type, repo_id)
	}

	fn file_url(&self, repo_id: &str, repo_type: RepoType, file: &str) -> String {
		let prefix = match repo_type {
			RepoType::Dataset => "datasets/",
			RepoType::Space => "spaces/",
			RepoType::Model => "",
		};
		let file = utf8_percent_encode(file, PATH_SEGMENT);
		format!("{}/{prefix}{repo_id}/resolve/main/{file}", self.endpoint)
	}

	fn get(&self, url: &str, token: Option<&str>) -> RequestBuilder {
		let req = self.http.get(url);
		match token {
			Some(t) => req.bearer_auth(t),
			None => req,
		}
	}

	/// Dataset ids owned by `author`.
	pub async fn list_datasets(&self, author: &str, token: Option<&str>) -> Result<Vec<String>, ProduceError> {
		let url = format!("{}/api/datasets", self.endpoint);
		let response = self
			.get(&url, token)
			.query(&[("author", author)])
			.send()
			.await
			.map_err(transport_error)?;
		let status = response.status();
		if !status.is_success() {
			return Err(status_error(status, author));
		}
		let datasets: Vec<DatasetSummary> = response.json().await.map_err(transport_error)?;
		Ok(datasets.into_iter().map(|d| d.id).collect())
	}
}

fn transport_error(err: reqwest::Error) -> ProduceError {
	// a stalled body surfaces as a decode error wrapping the timeout
	if err.is_timeout() || err.is_connect() {
		ProduceError::Transient(err.to_string())
	} else if err.is_decode() {
		ProduceError::Io(format!("unexpected hub response: {err}"))
	} else {
		ProduceError::Transient(err.to_string())
	}
}

fn status_error(status: StatusCode, what: &str) -> ProduceError {
	if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
		ProduceError::Transient(format!("{what}: hub answered {status}"))
	} else {
		ProduceError::NotFound(format!("{what}: hub answered {status}"))
	}
}

#[async_trait]
impl ContentSource for HubClient {
	async fn resolve(
		&self,
		repo_id: &str,
		repo_type: RepoType,
		token: Option<&str>,
	) -> Result<Option<Vec<String>>, ProduceError> {
		let response = self
			.get(&self.info_url(repo_id, repo_type), token)
			.send()
			.await
			.map_err(transport_error)?;

		match response.status() {
			s if s.is_success() => {
				let info: RepoInfo = response.json().await.map_err(transport_error)?;
				Ok(Some(info.siblings.into_iter().map(|s| s.rfilename).collect()))
			}
			// private or missing repos answer 401 as well as 404
			StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
			s => Err(status_error(s, repo_id)),
		}
	}

	async fn download(
		&self,
		repo_id: &str,
		repo_type: RepoType,
		file: &str,
		token: Option<&str>,
		dest: &Path,
	) -> Result<u64, ProduceError> {
		let url = self.file_url(repo_id, repo_type, file);
		let mut response = self.get(&url, token).send().await.map_err(transport_error)?;
		let status = response.status();
		if !status.is_success() {
			return Err(status_error(status, file));
		}

		let mut out = tokio::fs::File::create(dest)
			.await
			.map_err(|e| ProduceError::Io(format!("{}: {e}", dest.display())))?;
		let mut written = 0u64;
		while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
			out.write_all(&chunk)
				.await
				.map_err(|e| ProduceError::Io(format!("{}: {e}", dest.display())))?;
			written += chunk.len() as u64;
		}
		out.flush()
			.await
			.map_err(|e| ProduceError::Io(format!("{}: {e}", dest.display())))?;

		Ok(written)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> HubClient {
		HubClient::new("https://hub.example/", Duration::from_secs(5)).unwrap()
	}

	#[test]
	fn urls_follow_repo_type_layout() {
		let c = client();
		assert_eq!(c.endpoint(), "https://hub.example");
		assert_eq!(c.info_url("alice/data1", RepoType::Dataset), "https://hub.example/api/datasets/alice/data1");
		assert_eq!(
			c.file_url("alice/data1", RepoType::Dataset, "dir/a b.txt"),
			"https://hub.example/datasets/alice/data1/resolve/main/dir/a%20b.txt"
		);
		assert_eq!(
			c.file_url("alice/model", RepoType::Model, "config.json"),
			"https://hub.example/alice/model/resolve/main/config.json"
		);
		assert_eq!(
			c.file_url("alice/app", RepoType::Space, "app.py"),
			"https://hub.example/spaces/alice/app/resolve/main/app.py"
		);
	}

	#[test]
	fn server_errors_are_transient() {
		assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_retryable());
		assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
		assert!(!status_error(StatusCode::GONE, "x").is_retryable());
	}

	/// Serves one response whose body goes out a byte at a time, `gap` apart.
	async fn trickling_server(body: &'static [u8], gap: Duration) -> String {
		use tokio::io::AsyncReadExt;

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 4096];
			let _ = socket.read(&mut buf).await;
			let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n", body.len());
			if socket.write_all(head.as_bytes()).await.is_err() {
				return;
			}
			for byte in body {
				tokio::time::sleep(gap).await;
				if socket.write_all(&[*byte]).await.is_err() {
					return;
				}
			}
		});
		format!("http://{addr}")
	}

	#[tokio::test]
	async fn download_outlasting_the_timeout_completes_while_bytes_flow() {
		let endpoint = trickling_server(b"0123456789", Duration::from_millis(100)).await;
		let hub = HubClient::new(endpoint, Duration::from_millis(400)).unwrap();
		let tmp = tempfile::tempdir().unwrap();
		let dest = tmp.path().join("f.bin");

		let written = hub.download("alice/m", RepoType::Model, "f.bin", None, &dest).await.unwrap();

		assert_eq!(written, 10);
		assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
	}

	#[tokio::test]
	async fn stalled_download_is_transient() {
		let endpoint = trickling_server(b"01", Duration::from_secs(3)).await;
		let hub = HubClient::new(endpoint, Duration::from_millis(200)).unwrap();
		let tmp = tempfile::tempdir().unwrap();

		let err = hub
			.download("alice/m", RepoType::Model, "f.bin", None, &tmp.path().join("f.bin"))
			.await
			.unwrap_err();

		assert!(err.is_retryable(), "{err:?}");
	}

	#[test]
	fn repo_info_parses_siblings() {
		let info: RepoInfo =
			serde_json::from_str(r#"{"id":"alice/data1","siblings":[{"rfilename":"a.zip"},{"rfilename":"b/c.txt"}]}"#)
				.unwrap();
		let names: Vec<_> = info.siblings.into_iter().map(|s| s.rfilename).collect();
		assert_eq!(names, vec!["a.zip", "b/c.txt"]);
	}
}
