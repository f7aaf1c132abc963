use crate::config::FetchPolicy;
use crate::error::{IngestError, Result};
use crate::models::{ArchiveDescriptor, ArchiveLocation};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Anything that can turn a descriptor into archive bytes
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>>;
}

/// HTTP fetcher for NEMWEB with retry, request spacing and listing resolution
pub struct ArchiveFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    last_request: tokio::sync::Mutex<Option<Instant>>,
    listings: Mutex<HashMap<String, (Instant, Vec<String>)>>,
    href: Regex,
}

impl ArchiveFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(policy.user_agent.clone())
            .timeout(Duration::from_secs(policy.timeout_secs))
            .build()
            .map_err(|e| IngestError::InvalidConfig(format!("http client: {}", e)))?;
        let href = Regex::new(r#"(?i)href\s*=\s*"([^"]+\.zip)""#)
            .map_err(|e| IngestError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            policy,
            last_request: tokio::sync::Mutex::new(None),
            listings: Mutex::new(HashMap::new()),
            href,
        })
    }

    /// Hold back until `min_spacing_ms` has passed since the previous request started
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        let spacing = Duration::from_millis(self.policy.min_spacing_ms);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET with bounded retries. 404 is `NotPublished`, other 4xx are terminal.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let mut reason = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            let backoff = self.policy.backoff_for(attempt);
            if !backoff.is_zero() {
                debug!("retrying {} in {:?} (attempt {})", url, backoff, attempt);
                tokio::time::sleep(backoff).await;
            }
            self.pace().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.bytes().await {
                            Ok(body) => return Ok(body.to_vec()),
                            Err(e) => {
                                reason = format!("body read failed: {}", e);
                            }
                        }
                    } else if status == StatusCode::NOT_FOUND {
                        return Err(IngestError::NotPublished {
                            url: url.to_string(),
                        });
                    } else if is_retryable(status) {
                        reason = format!("HTTP {}", status);
                    } else {
                        return Err(IngestError::FetchFailed {
                            url: url.to_string(),
                            attempts: attempt,
                            reason: format!("HTTP {}", status),
                        });
                    }
                }
                Err(e) => {
                    reason = if e.is_timeout() {
                        format!("timed out: {}", e)
                    } else {
                        e.to_string()
                    };
                }
            }
            warn!("fetch attempt {}/{} for {} failed: {}", attempt, self.policy.max_attempts, url, reason);
        }

        Err(IngestError::FetchFailed {
            url: url.to_string(),
            attempts: self.policy.max_attempts,
            reason,
        })
    }

    /// Zip file names in a directory listing, cached for `listing_ttl_secs`
    async fn listing(&self, directory: &str, force: bool) -> Result<Vec<String>> {
        let ttl = Duration::from_secs(self.policy.listing_ttl_secs);
        if !force {
            if let Some((fetched, names)) = self.listings.lock().get(directory) {
                if fetched.elapsed() < ttl {
                    return Ok(names.clone());
                }
            }
        }

        let html = self.get(directory).await?;
        let html = String::from_utf8_lossy(&html);
        let mut names: Vec<String> = self
            .href
            .captures_iter(&html)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().rsplit('/').next().unwrap_or(m.as_str()).to_string())
            .collect();
        names.sort();
        names.dedup();

        self.listings
            .lock()
            .insert(directory.to_string(), (Instant::now(), names.clone()));
        Ok(names)
    }

    /// Concrete URL of the newest listed file starting with `prefix`
    pub async fn resolve(&self, directory: &str, prefix: &str) -> Result<String> {
        let find = |names: &[String]| {
            names
                .iter()
                .rev()
                .find(|n| n.to_ascii_uppercase().starts_with(&prefix.to_ascii_uppercase()))
                .cloned()
        };

        let names = self.listing(directory, false).await?;
        let found = match find(&names) {
            Some(name) => Some(name),
            // the cached listing may predate the file
            None => find(&self.listing(directory, true).await?),
        };

        match found {
            Some(name) => Ok(format!("{}{}", directory, name)),
            None => Err(IngestError::NotPublished {
                url: format!("{}{}*", directory, prefix),
            }),
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl ArchiveSource for ArchiveFetcher {
    async fn fetch(&self, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>> {
        let url = match &descriptor.location {
            ArchiveLocation::Direct(url) => url.clone(),
            ArchiveLocation::Listed { directory, prefix } => self.resolve(directory, prefix).await?,
        };
        debug!("{}: fetching {}", descriptor.series, url);
        self.get(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SourceKind, TableTag, TimeWindow};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `responses` in order, one connection each, recording raw requests
    async fn scripted_server(responses: Vec<(u16, Vec<u8>)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                recorder.lock().push(String::from_utf8_lossy(&request).to_lowercase());

                let head = format!(
                    "HTTP/1.1 {} Scripted\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), seen)
    }

    fn policy() -> FetchPolicy {
        FetchPolicy {
            initial_backoff_ms: 10,
            min_spacing_ms: 1,
            timeout_secs: 5,
            user_agent: "nem-test-agent".to_string(),
            ..FetchPolicy::default()
        }
    }

    fn direct(url: String) -> ArchiveDescriptor {
        let day = NaiveDate::from_ymd_opt(2025, 10, 9).unwrap().and_hms_opt(0, 0, 0).unwrap();
        ArchiveDescriptor {
            series: "prices5".into(),
            source: SourceKind::PeriodArchive,
            location: ArchiveLocation::Direct(url),
            depth: 1,
            table: TableTag::new("DISPATCH", "PRICE"),
            window: TimeWindow::new(day, day + chrono::Duration::days(1)),
        }
    }

    #[tokio::test]
    async fn test_retries_server_errors_with_identifying_header() {
        let (base, seen) =
            scripted_server(vec![(503, vec![]), (200, b"archive-bytes".to_vec())]).await;
        let fetcher = ArchiveFetcher::new(policy()).unwrap();

        let bytes = fetcher.fetch(&direct(format!("{}/a.zip", base))).await.unwrap();
        assert_eq!(bytes, b"archive-bytes");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.contains("user-agent: nem-test-agent")));
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let (base, seen) = scripted_server(vec![(403, vec![]), (200, vec![])]).await;
        let fetcher = ArchiveFetcher::new(policy()).unwrap();

        let result = fetcher.fetch(&direct(format!("{}/a.zip", base))).await;
        match result {
            Err(IngestError::FetchFailed { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected terminal failure, got {:?}", other.map(|b| b.len())),
        }
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_published() {
        let (base, _) = scripted_server(vec![(404, vec![])]).await;
        let fetcher = ArchiveFetcher::new(policy()).unwrap();
        let result = fetcher.fetch(&direct(format!("{}/a.zip", base))).await;
        assert!(matches!(result, Err(IngestError::NotPublished { .. })));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (base, seen) =
            scripted_server(vec![(500, vec![]), (502, vec![]), (503, vec![])]).await;
        let fetcher = ArchiveFetcher::new(policy()).unwrap();
        let result = fetcher.fetch(&direct(format!("{}/a.zip", base))).await;
        assert!(matches!(result, Err(IngestError::FetchFailed { attempts: 3, .. })));
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_listed_location_resolves_newest_match() {
        let listing = br#"<html><body>
            <a href="/Reports/CURRENT/DispatchIS_Reports/PUBLIC_DISPATCHIS_202510091000_0000000484092400.zip">x</a>
            <a href="/Reports/CURRENT/DispatchIS_Reports/PUBLIC_DISPATCHIS_202510091005_0000000484092485.zip">y</a>
            </body></html>"#
            .to_vec();
        let (base, seen) = scripted_server(vec![(200, listing), (200, b"zip".to_vec())]).await;
        let fetcher = ArchiveFetcher::new(policy()).unwrap();

        let mut descriptor = direct(String::new());
        descriptor.location = ArchiveLocation::Listed {
            directory: format!("{}/Reports/CURRENT/DispatchIS_Reports/", base),
            prefix: "PUBLIC_DISPATCHIS_202510091005".into(),
        };
        let bytes = fetcher.fetch(&descriptor).await.unwrap();
        assert_eq!(bytes, b"zip");
        assert!(seen.lock()[1].contains("public_dispatchis_202510091005_0000000484092485.zip"));
    }
}
