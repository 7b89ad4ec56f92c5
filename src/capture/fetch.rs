use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cli::config::CrawlerSettings;
use crate::crawler::task::TaskError;

/// Response of the fetch that precedes every capture
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: String,

    /// Where redirects led; `url` as given when there were none
    pub final_url: String,
    pub body: String,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        is_html(&self.content_type)
    }
}

/// Plain HTTP fetcher used to learn status and content type
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new(settings: &CrawlerSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self { client })
    }

    /// Fetch `url`, classifying failures: transport errors, 408, 429 and 5xx
    /// are retryable, any other non-2xx status is terminal
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, TaskError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TaskError::Retryable(format!("fetching {} failed: {}", url, e)))?;

        let status = response.status();
        let final_url = match Url::parse(url) {
            Ok(requested) if requested == *response.url() => url.to_string(),
            _ => response.url().to_string(),
        };
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        check_status(url, status)?;

        let body = response
            .text()
            .await
            .map_err(|e| TaskError::Retryable(format!("reading {} failed: {}", url, e)))?;

        debug!("Fetched {} ({}, {}, {} bytes)", url, status.as_u16(), content_type, body.len());
        if final_url != url {
            debug!("{} redirected to {}", url, final_url);
        }

        Ok(FetchedPage {
            status: status.as_u16(),
            content_type,
            final_url,
            body,
        })
    }

    /// Status code of `url`, or the transport error when nothing answered
    pub async fn probe(&self, url: &str) -> Result<u16, String> {
        self.client
            .get(url)
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), TaskError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{} answered {}", url, status);
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        Err(TaskError::Retryable(message))
    } else {
        Err(TaskError::Terminal(message))
    }
}

pub fn is_html(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime.eq_ignore_ascii_case("text/html") || mime.eq_ignore_ascii_case("application/xhtml+xml")
}

/// Raw `href` values of every anchor, in document order
pub fn extract_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return vec![];
    };

    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .collect()
}
