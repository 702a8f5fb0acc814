//! HTTP/HTTPS `Transport` implementation on top of `reqwest::blocking`.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE, REFERER, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;

use crate::error::DownloadError;
use crate::source::Source;
use crate::transport::{FetchDataResult, FetchInfoResult, Transport};

/// Redirect cap used in place of "infinite" (`max_redirects < 0`),
/// since reqwest has no unbounded redirect policy.
const UNLIMITED_REDIRECTS: usize = 64;

pub struct HttpTransport {
    /// Used for info-requests; follows up to `source.max_redirects`.
    info_client: Client,
    /// Used for data-requests; never follows redirects, matching the
    /// original's "no redirects on chunk fetches" rule.
    data_client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, DownloadError> {
        let info_client = Client::builder()
            .cookie_store(true)
            .redirect(Policy::limited(UNLIMITED_REDIRECTS))
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        let data_client = Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        Ok(Self { info_client, data_client })
    }

    fn common_headers(source: &Source) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !source.referrer.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&source.referrer) {
                headers.insert(REFERER, value);
            }
        }
        if !source.user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&source.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        let cookies = source.cookies();
        if !cookies.is_empty() {
            let cookie_header = cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }
        headers
    }

    /// Parses any `Set-Cookie` response headers into name/value pairs
    /// and folds them back into the source's jar.
    fn observe_set_cookie(source: &Source, response: &Response) {
        let observed: Vec<(String, String)> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| {
                let first = raw.split(';').next()?;
                let (name, value) = first.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        source.observe_response_cookies(&observed);
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new().expect("failed to build the default reqwest clients")
    }
}

impl Transport for HttpTransport {
    fn fetch_infos(&self, source: &Source) -> Result<FetchInfoResult, DownloadError> {
        let max_redirects = if source.max_redirects < 0 {
            UNLIMITED_REDIRECTS
        } else {
            source.max_redirects as usize
        };
        // `reqwest::redirect::Policy` is set per-client, not per-request,
        // so a tighter custom policy is built only when the source asks
        // for fewer redirects than the shared client allows.
        let client = if max_redirects == UNLIMITED_REDIRECTS {
            &self.info_client
        } else {
            return fetch_infos_with_policy(source, Policy::limited(max_redirects));
        };

        let response = client
            .get(source.url())
            .headers(Self::common_headers(source))
            .timeout(source.timeout)
            .send()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Self::observe_set_cookie(source, &response);
        parse_info_response(response)
    }

    fn fetch_data(&self, source: &Source, offset: u64) -> Result<FetchDataResult, DownloadError> {
        let mut headers = Self::common_headers(source);
        if offset > 0 {
            headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={offset}-")).unwrap());
        }

        let response = self
            .data_client
            .get(source.url())
            .headers(headers)
            .timeout(source.timeout)
            .send()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DownloadError::Http(response.status().as_u16()));
        }

        Self::observe_set_cookie(source, &response);
        let partial_content_confirmed = response.headers().contains_key(CONTENT_RANGE);
        Ok(FetchDataResult {
            partial_content_confirmed,
            reader: Box::new(response),
        })
    }
}

fn fetch_infos_with_policy(source: &Source, policy: Policy) -> Result<FetchInfoResult, DownloadError> {
    let client = Client::builder()
        .cookie_store(true)
        .redirect(policy)
        .build()
        .map_err(|e| DownloadError::Network(e.to_string()))?;
    let response = client
        .get(source.url())
        .headers(HttpTransport::common_headers(source))
        .timeout(source.timeout)
        .send()
        .map_err(|e| DownloadError::Network(e.to_string()))?;
    HttpTransport::observe_set_cookie(source, &response);
    parse_info_response(response)
}

fn parse_info_response(response: reqwest::blocking::Response) -> Result<FetchInfoResult, DownloadError> {
    if !response.status().is_success() {
        return Err(DownloadError::Http(response.status().as_u16()));
    }

    let real_url = response.url().to_string();
    let filename = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_filename_from_content_disposition);
    let filesize = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    Ok(FetchInfoResult { real_url, filename, filesize })
}

fn extract_filename_from_content_disposition(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let candidate = rest.split(';').next().unwrap_or("").trim().trim_matches('"');
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_filename_from_content_disposition() {
        assert_eq!(
            extract_filename_from_content_disposition(r#"attachment; filename="archive.zip""#),
            Some("archive.zip".to_string())
        );
        assert_eq!(
            extract_filename_from_content_disposition("attachment"),
            None
        );
    }

    #[test]
    fn treats_negative_max_redirects_as_the_shared_unlimited_client() {
        let source = Source::new("https://example.com/f", -1, -1, Duration::from_secs(1));
        assert_eq!(source.max_redirects, -1);
    }
}
