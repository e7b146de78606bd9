//! WebDAV store over reqwest.
//!
//! Only the handful of verbs a backup target needs: `PROPFIND` (depth 1),
//! `MKCOL`, `PUT`, `MOVE` and `DELETE`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Method, RequestBuilder, StatusCode, Url};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{RemoteStore, StoreError, is_partial, partial_name, segments};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// Everything outside RFC 3986 unreserved characters gets escaped, `/`
/// included, since this encodes one path segment at a time.
const SEGMENT: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'!')
	.add(b'"')
	.add(b'#')
	.add(b'$')
	.add(b'%')
	.add(b'&')
	.add(b'\'')
	.add(b'(')
	.add(b')')
	.add(b'*')
	.add(b'+')
	.add(b',')
	.add(b'/')
	.add(b':')
	.add(b';')
	.add(b'<')
	.add(b'=')
	.add(b'>')
	.add(b'?')
	.add(b'@')
	.add(b'[')
	.add(b'\\')
	.add(b']')
	.add(b'^')
	.add(b'`')
	.add(b'{')
	.add(b'|')
	.add(b'}');

#[derive(Debug, Clone)]
pub struct WebDavStore {
	http: reqwest::Client,
	/// Deadline for everything but `PUT`, whose duration grows with the file.
	timeout: Duration,
	base: Url,
	username: Option<String>,
	password: Option<String>,
	propfind: Method,
	mkcol: Method,
	move_: Method,
}

impl WebDavStore {
	pub fn new(
		url: &str,
		username: Option<String>,
		password: Option<String>,
		timeout: Duration,
	) -> Result<Self, StoreError> {
		let mut base = Url::parse(url).map_err(|e| StoreError::Other(format!("invalid store url {url}: {e}")))?;
		if !base.path().ends_with('/') {
			let path = format!("{}/", base.path());
			base.set_path(&path);
		}

		let http = reqwest::Client::builder()
			.connect_timeout(timeout)
			.tcp_keepalive(timeout)
			.build()
			.map_err(|e| StoreError::Other(e.to_string()))?;
		let method = |name: &[u8]| Method::from_bytes(name).map_err(|e| StoreError::Other(e.to_string()));

		Ok(Self {
			http,
			timeout,
			base,
			username,
			password,
			propfind: method(b"PROPFIND")?,
			mkcol: method(b"MKCOL")?,
			move_: method(b"MOVE")?,
		})
	}

	/// URL of `dir` (as a collection, trailing slash) or of `dir/name`.
	fn url_for(&self, dir: &str, name: Option<&str>) -> Url {
		let mut path = self.base.path().trim_end_matches('/').to_string();
		for segment in segments(dir) {
			path.push('/');
			path.extend(utf8_percent_encode(segment, SEGMENT));
		}
		match name {
			Some(name) => {
				path.push('/');
				path.extend(utf8_percent_encode(name, SEGMENT));
			}
			None => path.push('/'),
		}
		let mut url = self.base.clone();
		url.set_path(&path);
		url
	}

	fn request(&self, method: Method, url: Url) -> RequestBuilder {
		let req = if method == Method::PUT {
			self.http.request(method, url)
		} else {
			self.http.request(method, url).timeout(self.timeout)
		};
		match &self.username {
			Some(user) => req.basic_auth(user, self.password.as_deref()),
			None => req,
		}
	}

	/// `MKCOL` every segment of `dir` below the base URL, top down.
	async fn ensure_collection(&self, dir: &str) -> Result<(), StoreError> {
		let mut built = String::new();
		for segment in segments(dir) {
			built.push('/');
			built.push_str(segment);
			let url = self.url_for(&built, None);
			let response = self
				.request(self.mkcol.clone(), url.clone())
				.send()
				.await
				.map_err(transport_error)?;
			match response.status() {
				s if s.is_success() => debug!(%url, "created collection"),
				// already there
				StatusCode::METHOD_NOT_ALLOWED | StatusCode::MOVED_PERMANENTLY => {}
				s => return Err(status_error(s, &url)),
			}
		}
		Ok(())
	}

	async fn put(&self, local_path: &Path, url: Url) -> Result<(), StoreError> {
		let file = tokio::fs::File::open(local_path)
			.await
			.map_err(|e| StoreError::Other(format!("{}: {e}", local_path.display())))?;
		let len = file
			.metadata()
			.await
			.map_err(|e| StoreError::Other(format!("{}: {e}", local_path.display())))?
			.len();

		let response = self
			.request(Method::PUT, url.clone())
			.header(CONTENT_LENGTH, len)
			.body(Body::wrap_stream(ReaderStream::new(file)))
			.send()
			.await
			.map_err(transport_error)?;
		match response.status() {
			s if s.is_success() => Ok(()),
			s => Err(status_error(s, &url)),
		}
	}

	async fn remove(&self, url: Url) -> Result<(), StoreError> {
		let response = self
			.request(Method::DELETE, url.clone())
			.send()
			.await
			.map_err(transport_error)?;
		match response.status() {
			s if s.is_success() => Ok(()),
			StatusCode::NOT_FOUND => Ok(()),
			s => Err(status_error(s, &url)),
		}
	}
}

fn transport_error(err: reqwest::Error) -> StoreError {
	if err.is_connect() || err.is_timeout() {
		StoreError::ConnectFailed(err.to_string())
	} else {
		StoreError::Other(err.to_string())
	}
}

fn status_error(status: StatusCode, url: &Url) -> StoreError {
	let what = format!("{url} answered {status}");
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::AuthFailed(what),
		StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE => StoreError::QuotaExceeded(what),
		_ => StoreError::Other(what),
	}
}

#[async_trait]
impl RemoteStore for WebDavStore {
	async fn list(&self, remote_dir: &str) -> Result<Vec<String>, StoreError> {
		let url = self.url_for(remote_dir, None);
		let response = self
			.request(self.propfind.clone(), url.clone())
			.header("Depth", "1")
			.header(CONTENT_TYPE, "application/xml; charset=utf-8")
			.body(PROPFIND_BODY)
			.send()
			.await
			.map_err(transport_error)?;

		match response.status() {
			StatusCode::NOT_FOUND => return Ok(Vec::new()),
			s if s.is_success() => {}
			s => return Err(status_error(s, &url)),
		}

		let body = response.text().await.map_err(transport_error)?;
		let own_path = decode(url.path());
		Ok(file_names(&body, own_path.trim_end_matches('/')))
	}

	async fn upload(&self, local_path: &Path, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		self.ensure_collection(remote_dir).await?;

		let partial = self.url_for(remote_dir, Some(&partial_name(remote_name)));
		let dest = self.url_for(remote_dir, Some(remote_name));

		if let Err(err) = self.put(local_path, partial.clone()).await {
			let _ = self.remove(partial).await;
			return Err(err);
		}

		let response = self
			.request(self.move_.clone(), partial.clone())
			.header("Destination", dest.as_str())
			.header("Overwrite", "T")
			.send()
			.await
			.map_err(transport_error)?;

		match response.status() {
			s if s.is_success() => Ok(()),
			StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
				warn!(%dest, "server cannot MOVE, uploading under the final name");
				let _ = self.remove(partial).await;
				self.put(local_path, dest).await
			}
			s => {
				let _ = self.remove(partial).await;
				Err(status_error(s, &dest))
			}
		}
	}

	async fn delete(&self, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		self.remove(self.url_for(remote_dir, Some(remote_name))).await
	}
}

fn decode(s: &str) -> String {
	percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Plain file names in a depth-1 multistatus body, sorted. Skips the listed
/// collection itself, sub-collections and in-flight uploads.
fn file_names(multistatus: &str, own_path: &str) -> Vec<String> {
	let mut names = Vec::new();
	for response in elements(multistatus, "response") {
		let Some(href) = elements(response, "href").first().map(|h| unescape(h.trim())) else {
			continue;
		};
		if !elements(response, "collection").is_empty() {
			continue;
		}

		let path = match Url::parse(&href) {
			Ok(url) => decode(url.path()),
			Err(_) => decode(&href),
		};
		let path = path.trim_end_matches('/');
		if path == own_path || path.is_empty() {
			continue;
		}

		let name = path.rsplit('/').next().unwrap_or(path);
		if !name.is_empty() && !is_partial(name) {
			names.push(name.to_string());
		}
	}
	names.sort();
	names.dedup();
	names
}

/// Bodies of every element whose local name is `local`, whatever its
/// namespace prefix. Self-closing elements yield an empty body. Good enough
/// for multistatus responses; not a general XML parser.
fn elements<'a>(xml: &'a str, local: &str) -> Vec<&'a str> {
	let mut found = Vec::new();
	let mut rest = xml;

	while let Some(open) = rest.find('<') {
		let after = &rest[open + 1..];
		let name_end = after
			.find(|c: char| c.is_whitespace() || c == '>' || c == '/')
			.unwrap_or(after.len());
		let name = &after[..name_end];
		let local_name = name.rsplit(':').next().unwrap_or(name);

		if name.is_empty() || local_name != local {
			rest = after;
			continue;
		}

		let Some(gt) = after.find('>') else { break };
		if after[..gt].ends_with('/') {
			found.push("");
			rest = &after[gt + 1..];
			continue;
		}

		let body = &after[gt + 1..];
		let close = format!("</{name}>");
		match body.find(&close) {
			Some(end) => {
				found.push(&body[..end]);
				rest = &body[end + close.len()..];
			}
			None => break,
		}
	}

	found
}

fn unescape(s: &str) -> String {
	s.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&quot;", "\"")
		.replace("&apos;", "'")
		.replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
	use super::*;

	const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/%E5%A4%87%E4%BB%BD/alice/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/%E5%A4%87%E4%BB%BD/alice/data1_20240102_030000.tar.gz</d:href>
    <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>https://dav.example/dav/%E5%A4%87%E4%BB%BD/alice/my%20notes_20240101_030000.zip</d:href>
    <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/%E5%A4%87%E4%BB%BD/alice/old/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/%E5%A4%87%E4%BB%BD/alice/.data1_20240103_030000.tar.gz.partial</d:href>
    <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

	fn store() -> WebDavStore {
		WebDavStore::new("https://dav.example/dav", Some("u".into()), Some("p".into()), Duration::from_secs(5)).unwrap()
	}

	#[test]
	fn listing_keeps_files_only() {
		let names = file_names(LISTING, "/dav/备份/alice");
		assert_eq!(names, vec!["data1_20240102_030000.tar.gz", "my notes_20240101_030000.zip"]);
	}

	#[test]
	fn listing_without_namespace_prefix() {
		let body = r#"<multistatus xmlns="DAV:"><response><href>/a/b&amp;c.sql</href>
			<propstat><prop><resourcetype/></prop></propstat></response></multistatus>"#;
		assert_eq!(file_names(body, "/a"), vec!["b&c.sql"]);
	}

	#[test]
	fn urls_encode_each_segment() {
		let s = store();
		assert_eq!(s.url_for("/备份/alice/", None).as_str(), "https://dav.example/dav/%E5%A4%87%E4%BB%BD/alice/");
		assert_eq!(
			s.url_for("db", Some("my notes#1.sql")).as_str(),
			"https://dav.example/dav/db/my%20notes%231.sql"
		);
	}

	#[test]
	fn statuses_map_to_store_errors() {
		let url = Url::parse("https://dav.example/x").unwrap();
		assert!(matches!(status_error(StatusCode::UNAUTHORIZED, &url), StoreError::AuthFailed(_)));
		assert!(matches!(status_error(StatusCode::FORBIDDEN, &url), StoreError::AuthFailed(_)));
		assert!(matches!(status_error(StatusCode::INSUFFICIENT_STORAGE, &url), StoreError::QuotaExceeded(_)));
		assert!(matches!(status_error(StatusCode::PAYLOAD_TOO_LARGE, &url), StoreError::QuotaExceeded(_)));
		assert!(matches!(status_error(StatusCode::CONFLICT, &url), StoreError::Other(_)));
	}

	/// Accepts one connection, waits `stall` after the request head, drains
	/// the body and answers `reply`.
	async fn slow_server(stall: Duration, reply: &'static str) -> String {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut request = Vec::new();
			let mut buf = [0u8; 8192];
			let head_end = loop {
				let n = socket.read(&mut buf).await.unwrap();
				if n == 0 {
					return;
				}
				request.extend_from_slice(&buf[..n]);
				if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
					break pos + 4;
				}
			};
			let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
			let body_len: usize = head
				.lines()
				.find_map(|l| l.strip_prefix("content-length:"))
				.map(|v| v.trim().parse().unwrap())
				.unwrap_or(0);

			tokio::time::sleep(stall).await;
			let mut received = request.len() - head_end;
			while received < body_len {
				let n = socket.read(&mut buf).await.unwrap();
				if n == 0 {
					return;
				}
				received += n;
			}
			let _ = socket.write_all(reply.as_bytes()).await;
		});
		format!("http://{addr}/dav/")
	}

	#[tokio::test]
	async fn slow_upload_is_not_cut_off_by_the_timeout() {
		let base = slow_server(
			Duration::from_millis(800),
			"HTTP/1.1 201 Created\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
		)
		.await;
		let tmp = tempfile::tempdir().unwrap();
		let file = tmp.path().join("big.bin");
		std::fs::write(&file, vec![7u8; 256 * 1024]).unwrap();

		let s = WebDavStore::new(&base, None, None, Duration::from_millis(200)).unwrap();
		s.put(&file, s.url_for("/db/", Some("big.bin"))).await.unwrap();
	}

	#[tokio::test]
	async fn stalled_listing_times_out() {
		let base = slow_server(Duration::from_secs(5), "").await;
		let s = WebDavStore::new(&base, None, None, Duration::from_millis(200)).unwrap();

		let err = s.list("/db/").await.unwrap_err();
		assert!(matches!(err, StoreError::ConnectFailed(_)), "{err:?}");
	}

	#[tokio::test]
	async fn unreachable_server_is_connect_failed() {
		// nothing listens on the discard port
		let s = WebDavStore::new("http://127.0.0.1:9/dav/", None, None, Duration::from_secs(2)).unwrap();
		let err = s.list("/db/").await.unwrap_err();
		assert!(matches!(err, StoreError::ConnectFailed(_)), "{err:?}");
	}
}
