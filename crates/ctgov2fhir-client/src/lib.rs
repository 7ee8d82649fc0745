// ctgov2fhir-client - ClinicalTrials.gov v2 API client
//
// Minimal read-only client for `GET {endpoint}/studies`. One batch of NCT
// ids maps to one request (plus any `nextPageToken` continuations). The
// `StudyFetcher` trait is the seam the cache coordinator depends on, so
// tests can swap the network out entirely.

use async_trait::async_trait;
use ctgov2fhir_core::{ClinicalStudy, NctId};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Production ClinicalTrials.gov v2 API root.
pub const DEFAULT_ENDPOINT: &str = "https://clinicaltrials.gov/api/v2";

/// Transport timeout for a single request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a usable response (connect, timeout,
    /// redirect-loop, body-read failures).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-2xx status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The body was not recognizable as a studies bundle.
    #[error("response from {url} is not a studies bundle: {reason}")]
    Parse { url: String, reason: String },

    /// The client itself could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// Fetch study records for a batch of NCT ids.
///
/// One attempt per batch; retrying is the caller's policy decision, and the
/// coordinator deliberately has none.
#[async_trait]
pub trait StudyFetcher: Send + Sync + 'static {
    async fn fetch_studies(&self, ids: &[NctId]) -> Result<Vec<ClinicalStudy>, FetchError>;
}

/// Shape of a `GET /studies` response page.
///
/// A JSON body that does not carry a `studies` array of objects fails
/// deserialization here and surfaces as [`FetchError::Parse`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudiesPage {
    studies: Vec<ClinicalStudy>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct CtGovClient {
    http: reqwest::Client,
    endpoint: String,
}

impl CtGovClient {
    /// Build a client against `endpoint` (no trailing slash).
    ///
    /// Redirects are followed up to reqwest's default of 10 hops; a longer
    /// chain is reported as a transport failure.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(FetchError::Build)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    fn studies_url(&self) -> String {
        format!("{}/studies", self.endpoint)
    }

    async fn fetch_page(
        &self,
        filter_ids: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<StudiesPage, FetchError> {
        let url = self.studies_url();
        let page_size = page_size.to_string();
        let mut request = self.http.get(&url).query(&[
            ("filter.ids", filter_ids),
            ("pageSize", page_size.as_str()),
        ]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request.send().await.map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;
        serde_json::from_slice(&body).map_err(|error| FetchError::Parse {
            url,
            reason: error.to_string(),
        })
    }
}

#[async_trait]
impl StudyFetcher for CtGovClient {
    async fn fetch_studies(&self, ids: &[NctId]) -> Result<Vec<ClinicalStudy>, FetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter_ids = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut studies = Vec::with_capacity(ids.len());
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .fetch_page(&filter_ids, ids.len(), page_token.as_deref())
                .await?;
            debug!(
                target: "ctgovservice",
                requested = ids.len(),
                received = page.studies.len(),
                has_next = page.next_page_token.is_some(),
                "fetched studies page"
            );
            studies.extend(page.studies);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(studies)
    }
}

impl std::fmt::Debug for CtGovClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtGovClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
