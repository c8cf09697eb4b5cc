use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};

use crate::auth::{AuthToken, TokenProvider};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::util::{backoff, retriable_status};

const MAX_REDIRECTS: usize = 10;

/// A request that could not be completed even after retrying.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Connection error, timeout or similar, retries exhausted.
    Transport(reqwest::Error),
    Auth(Error),
    TooManyRedirects,
    Cancelled,
}

/// Retry policy shared by every outbound call.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: usize,
    pub(crate) backoff: Duration,
    pub(crate) max_backoff: Duration,
}

/// Blocking HTTP plumbing shared by the token provider, the catalog and the
/// downloader. Cloning is cheap.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: HttpClient,
    retry: RetryPolicy,
}

impl Transport {
    pub(crate) fn new(cfg: &ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cdse-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("cdse-rs")),
        );

        // Redirects are followed by hand so the bearer header survives the hop
        // from the download host to the storage host.
        let http = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(cfg.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(Error::HttpClient)?;

        Ok(Self {
            http,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff: cfg.backoff,
                max_backoff: cfg.max_backoff,
            },
        })
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends the request built by `f`, retrying connection failures and
    /// retriable statuses. After the last attempt a retriable status is
    /// returned to the caller as-is.
    pub(crate) fn robust_request<F>(
        &self,
        cancelled: &dyn Fn() -> bool,
        mut f: F,
    ) -> std::result::Result<Response, Failure>
    where
        F: FnMut(&HttpClient) -> RequestBuilder,
    {
        let mut tries = 0usize;
        let mut sleep = self.retry.backoff;
        loop {
            if cancelled() {
                return Err(Failure::Cancelled);
            }
            match f(&self.http).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if retriable_status(status.as_u16()) && tries < self.retry.max_retries {
                        tries += 1;
                        tracing::warn!(%status, url = %resp.url(), attempt = tries, "retriable status, backing off");
                        thread::sleep(sleep);
                        sleep = backoff(sleep, self.retry.max_backoff);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    // A request that cannot be built fails the same way every time.
                    if err.is_builder() || tries >= self.retry.max_retries {
                        return Err(Failure::Transport(err));
                    }
                    tries += 1;
                    tracing::warn!(error = %err, attempt = tries, "request failed, backing off");
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.retry.max_backoff);
                }
            }
        }
    }

    /// GET `url` with a bearer token, following redirects by hand.
    ///
    /// A 401 invalidates the token and the request is repeated once with a
    /// freshly issued one.
    pub(crate) fn authorized_get(
        &self,
        auth: &TokenProvider,
        url: &str,
        query: &[(&str, String)],
        cancelled: &dyn Fn() -> bool,
    ) -> std::result::Result<Response, Failure> {
        let token = auth.token().map_err(Failure::Auth)?;
        let resp = self.follow_redirects(&token, url, query, cancelled)?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        tracing::info!(url, "bearer token rejected, refreshing once");
        auth.invalidate(&token);
        let token = auth.token().map_err(Failure::Auth)?;
        self.follow_redirects(&token, url, query, cancelled)
    }

    fn follow_redirects(
        &self,
        token: &AuthToken,
        url: &str,
        query: &[(&str, String)],
        cancelled: &dyn Fn() -> bool,
    ) -> std::result::Result<Response, Failure> {
        let mut current = url.to_string();
        let mut query = query;
        for _ in 0..=MAX_REDIRECTS {
            let resp = self.robust_request(cancelled, |http| {
                let req = http.get(&current).bearer_auth(token.access_token());
                if query.is_empty() { req } else { req.query(query) }
            })?;

            if !resp.status().is_redirection() {
                return Ok(resp);
            }
            let next = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| resp.url().join(location).ok())
                .map(|u| u.to_string());
            let Some(next) = next else {
                return Ok(resp);
            };
            tracing::debug!(from = %resp.url(), to = %next, "following redirect");
            current = next;
            // The redirect target carries its own query string.
            query = &[];
        }
        Err(Failure::TooManyRedirects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::cell::Cell;

    #[test]
    fn malformed_urls_fail_without_retrying() {
        let cfg = ClientConfig::new(Credentials::new("alice", "secret"))
            .with_max_retries(3)
            .with_backoff(Duration::from_secs(5));
        let transport = Transport::new(&cfg).unwrap();
        let attempts = Cell::new(0);

        let result = transport.robust_request(&|| false, |http| {
            attempts.set(attempts.get() + 1);
            http.get("Products(p0)/$value")
        });

        match result {
            Err(Failure::Transport(err)) => assert!(err.is_builder(), "{err:?}"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(attempts.get(), 1);
    }
}
