use regex::Regex;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::cli::config::CrawlerSettings;
use crate::crawler::canonical::{canonicalize, origin, url_path};

/// Breadth-first crawl state: the visited set plus the pending frontier
pub struct CrawlState {
    /// `scheme://authority` every followed URL must share
    origin: String,

    /// Path prefixes (`/ignore`) or absolute URL prefixes that are never crawled
    ignore_prefixes: Vec<String>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Upper bound on the number of visited URLs
    max_pages: Option<usize>,

    /// Canonical URLs already enqueued
    visited: HashSet<String>,

    /// URLs waiting for a capture, in discovery order
    frontier: VecDeque<String>,

    /// Every accepted URL in discovery order
    discovered: Vec<String>,
}

impl CrawlState {
    /// Create crawl state scoped to the origin of `start_url`
    pub fn new(start_url: &str, settings: &CrawlerSettings) -> Option<Self> {
        let origin = origin(start_url)?;

        let exclude_patterns = settings
            .exclude_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Some(Self {
            origin,
            ignore_prefixes: settings.ignore_prefixes.clone(),
            exclude_patterns,
            max_pages: settings.max_pages,
            visited: HashSet::new(),
            frontier: VecDeque::new(),
            discovered: Vec::new(),
        })
    }

    /// Enqueue the start URL
    pub fn seed(&mut self, start_url: &str) -> bool {
        self.enqueue(start_url, start_url)
    }

    /// Canonicalize `href` against `base` and append it to the frontier unless
    /// it was already visited, is out of scope or matches an ignore prefix
    pub fn enqueue(&mut self, base: &str, href: &str) -> bool {
        let Some(url) = canonicalize(base, href) else {
            debug!("Skipping unusable link {} on {}", href, base);
            return false;
        };

        if self.visited.contains(&url) {
            return false;
        }

        if !self.in_scope(&url) {
            debug!("Skipping URL outside of {}: {}", self.origin, url);
            return false;
        }

        if self.is_ignored(&url) {
            debug!("Skipping ignored URL: {}", url);
            return false;
        }

        if let Some(limit) = self.max_pages {
            if self.visited.len() >= limit {
                debug!("Page limit {} reached, dropping {}", limit, url);
                return false;
            }
        }

        self.visited.insert(url.clone());
        self.discovered.push(url.clone());
        self.frontier.push_back(url);

        true
    }

    /// Pop the earliest discovered URL that has not been handed out yet
    pub fn next(&mut self) -> Option<String> {
        self.frontier.pop_front()
    }

    /// Whether a URL matches one of the ignore prefixes or exclude patterns
    pub fn is_ignored(&self, url: &str) -> bool {
        let path = url_path(url);
        let prefixed = self.ignore_prefixes.iter().any(|prefix| {
            if prefix.starts_with('/') {
                path.starts_with(prefix.as_str())
            } else {
                url.starts_with(prefix.as_str())
            }
        });

        prefixed || self.exclude_patterns.iter().any(|pattern| pattern.is_match(url))
    }

    fn in_scope(&self, url: &str) -> bool {
        match url.strip_prefix(self.origin.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }

    /// Accepted URLs in discovery order
    pub fn discovered(&self) -> &[String] {
        &self.discovered
    }

    /// Paths of the accepted URLs, the content of `url_paths.txt`
    pub fn discovered_paths(&self) -> Vec<String> {
        self.discovered.iter().map(|url| url_path(url)).collect()
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }
}
