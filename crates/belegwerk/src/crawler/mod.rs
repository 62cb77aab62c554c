//! URL crawling: plain HTTP fetch with content extraction, falling back to a
//! headless browser when the page demands JavaScript.

pub mod markdown;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CrawlerConfig;
use crate::error::{Error, Result};
use markdown::element_to_markdown;

/// Browser-backed fetch for pages that require JavaScript. Returns rendered
/// HTML. Deployment decides the binding (driver, remote service, MCP tool).
#[async_trait]
pub trait HeadlessFetcher: Send + Sync {
    async fn fetch_rendered(&self, url: &str, timeout: Duration) -> anyhow::Result<String>;
}

/// The crawl seam the orchestration depends on; the production impl is
/// [`Crawler`], tests substitute scripted fetchers.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn crawl(&self, url: &str, options: &CrawlOptions) -> CrawlResult;
}

#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub timeout: Option<Duration>,
    /// Truncate extracted content to this many characters.
    pub max_content_chars: Option<usize>,
    /// Also extract Open-Graph image and category hints.
    pub enhanced_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub success: bool,
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub title: String,
    pub description: String,
    pub canonical: Option<String>,
    pub published_date: Option<String>,
    pub content: String,
    pub markdown: String,
    pub word_count: usize,
    pub char_count: usize,
    pub og_image: Option<String>,
    pub category_hint: Option<String>,
    pub error: Option<String>,
}

impl CrawlResult {
    pub fn failure(url: &str, status_code: u16, error: String) -> Self {
        Self {
            success: false,
            url: url.to_string(),
            final_url: url.to_string(),
            status_code,
            title: String::new(),
            description: String::new(),
            canonical: None,
            published_date: None,
            content: String::new(),
            markdown: String::new(),
            word_count: 0,
            char_count: 0,
            og_image: None,
            category_hint: None,
            error: Some(error),
        }
    }
}

pub struct Crawler {
    client: Client,
    config: CrawlerConfig,
    headless: Option<Arc<dyn HeadlessFetcher>>,
}

#[async_trait]
impl PageFetcher for Crawler {
    async fn crawl(&self, url: &str, options: &CrawlOptions) -> CrawlResult {
        Crawler::crawl(self, url, options).await
    }
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Permanent(format!("crawler client: {e}")))?;

        Ok(Self {
            client,
            config,
            headless: None,
        })
    }

    pub fn with_headless(mut self, fetcher: Arc<dyn HeadlessFetcher>) -> Self {
        self.headless = Some(fetcher);
        self
    }

    /// Fetch and extract a page. Failures never panic or propagate: they come
    /// back as `success: false` with a reason, so orchestration nodes can
    /// merge partial results.
    pub async fn crawl(&self, url: &str, options: &CrawlOptions) -> CrawlResult {
        if let Err(e) = validate_url(url, self.config.production) {
            return CrawlResult::failure(url, 0, e.to_string());
        }

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.timeout_secs));

        match self.fetch_html(url, timeout).await {
            Ok((html, final_url, status)) => {
                if looks_javascript_required(&html) {
                    tracing::debug!(url, "page looks JavaScript-rendered");
                    match self.headless_fetch(url, timeout).await {
                        Some(Ok(rendered)) => {
                            self.extract(url, &final_url, status, &rendered, options)
                        }
                        Some(Err(e)) => CrawlResult::failure(
                            url,
                            status,
                            format!("headless fetch failed: {e}"),
                        ),
                        None => CrawlResult::failure(
                            url,
                            status,
                            "javascript required and no headless fetcher configured".into(),
                        ),
                    }
                } else {
                    self.extract(url, &final_url, status, &html, options)
                }
            }
            Err(FetchFailure::BotBlocked(status)) => {
                // Bot walls often let a real browser through.
                match self.headless_fetch(url, timeout).await {
                    Some(Ok(rendered)) => self.extract(url, url, status, &rendered, options),
                    _ => CrawlResult::failure(url, status, format!("bot protection (HTTP {status})")),
                }
            }
            Err(FetchFailure::Other(status, reason)) => CrawlResult::failure(url, status, reason),
        }
    }

    async fn headless_fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Option<anyhow::Result<String>> {
        let fetcher = self.headless.as_ref()?;
        Some(fetcher.fetch_rendered(url, timeout).await)
    }

    async fn fetch_html(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<(String, String, u16), FetchFailure> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request failed: {e}")
                };
                FetchFailure::Other(0, reason)
            })?;

        let status = response.status();
        let final_url = response.url().to_string();

        if status.as_u16() == 403 || status.as_u16() == 429 {
            return Err(FetchFailure::BotBlocked(status.as_u16()));
        }
        if status.as_u16() >= 400 {
            return Err(FetchFailure::Other(
                status.as_u16(),
                format!("HTTP {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
            return Err(FetchFailure::Other(
                status.as_u16(),
                format!("unsupported content type: {content_type}"),
            ));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.config.max_content_bytes {
                return Err(FetchFailure::Other(
                    status.as_u16(),
                    format!("content too large: {length} bytes"),
                ));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchFailure::Other(status.as_u16(), format!("body read: {e}")))?;
        if bytes.len() > self.config.max_content_bytes {
            return Err(FetchFailure::Other(
                status.as_u16(),
                format!("content too large: {} bytes", bytes.len()),
            ));
        }

        Ok((
            String::from_utf8_lossy(&bytes).into_owned(),
            final_url,
            status.as_u16(),
        ))
    }

    fn extract(
        &self,
        url: &str,
        final_url: &str,
        status_code: u16,
        html: &str,
        options: &CrawlOptions,
    ) -> CrawlResult {
        let doc = Html::parse_document(html);

        let title = select_text(&doc, "title")
            .or_else(|| meta_content(&doc, "og:title"))
            .unwrap_or_default();
        let description = meta_content(&doc, "og:description")
            .or_else(|| meta_name_content(&doc, "description"))
            .unwrap_or_default();
        let canonical = select_attr(&doc, r#"link[rel="canonical"]"#, "href");
        let published_date = meta_content(&doc, "article:published_time")
            .or_else(|| meta_name_content(&doc, "date"))
            .or_else(|| select_attr(&doc, "time[datetime]", "datetime"));

        let (og_image, category_hint) = if options.enhanced_metadata {
            (
                meta_content(&doc, "og:image"),
                meta_content(&doc, "article:section")
                    .or_else(|| meta_name_content(&doc, "category")),
            )
        } else {
            (None, None)
        };

        let mut markdown = extract_main_content(&doc);
        let mut content = markdown_to_plain(&markdown);

        if let Some(cap) = options.max_content_chars {
            markdown = truncate_chars(&markdown, cap);
            content = truncate_chars(&content, cap);
        }

        if content.trim().is_empty() {
            return CrawlResult::failure(url, status_code, "no extractable content".into());
        }

        let word_count = content.split_whitespace().count();
        let char_count = content.chars().count();

        CrawlResult {
            success: true,
            url: url.to_string(),
            final_url: final_url.to_string(),
            status_code,
            title,
            description,
            canonical,
            published_date,
            content,
            markdown,
            word_count,
            char_count,
            og_image,
            category_hint,
            error: None,
        }
    }
}

enum FetchFailure {
    BotBlocked(u16),
    Other(u16, String),
}

/// Only http/https; in production additionally refuse loopback, RFC-1918,
/// link-local and the cloud metadata address.
pub fn validate_url(url: &str, production: bool) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::InvalidInput(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidInput(format!(
                "unsupported URL scheme: {other}"
            )))
        }
    }

    if !production {
        return Ok(());
    }

    let Some(host) = parsed.host_str() else {
        return Err(Error::InvalidInput("URL has no host".into()));
    };

    if host.eq_ignore_ascii_case("localhost") {
        return Err(Error::InvalidInput("loopback target refused".into()));
    }

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        let refused = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.octets() == [169, 254, 169, 254]
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if refused {
            return Err(Error::InvalidInput(format!(
                "private or loopback target refused: {ip}"
            )));
        }
    }

    Ok(())
}

/// Very thin body with many scripts, or a known SPA bootstrap marker.
fn looks_javascript_required(html: &str) -> bool {
    const MARKERS: [&str; 4] = [
        "__NEXT_DATA__",
        "window.__NUXT__",
        "Please enable JavaScript",
        "You need to enable JavaScript",
    ];
    if MARKERS.iter().any(|m| html.contains(m)) {
        // Marker plus substantial server-rendered text still counts as
        // renderable; only bail when the visible body is thin too.
        return visible_text_len(html) < 600;
    }

    let script_count = html.matches("<script").count();
    script_count >= 10 && visible_text_len(html) < 200
}

fn visible_text_len(html: &str) -> usize {
    let doc = Html::parse_document(html);
    let Ok(body) = Selector::parse("body") else {
        return 0;
    };
    doc.select(&body)
        .next()
        .map(|b| b.text().map(|t| t.trim().len()).sum())
        .unwrap_or(0)
}

/// Try semantic containers in order; fall back to `body` with boilerplate
/// stripped by the markdown walker.
fn extract_main_content(doc: &Html) -> String {
    const CANDIDATES: [&str; 8] = [
        "article",
        "main",
        r#"[role="main"]"#,
        ".post-content",
        ".article-content",
        ".entry-content",
        ".content",
        "#content",
    ];

    for candidate in CANDIDATES {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        if let Some(element) = doc.select(&selector).next() {
            let markdown = element_to_markdown(element);
            if markdown.split_whitespace().count() >= 30 {
                return markdown;
            }
        }
    }

    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    doc.select(&body)
        .next()
        .map(element_to_markdown)
        .unwrap_or_default()
}

fn markdown_to_plain(markdown: &str) -> String {
    markdown
        .lines()
        .map(|line| {
            line.trim_start_matches('#')
                .trim_start_matches("- ")
                .trim()
        })
        .filter(|line| !line.is_empty() && *line != "```")
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    text.chars().take(cap).collect()
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text: String = doc.select(&sel).next()?.text().collect();
    let trimmed = text.trim().to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn select_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()?
        .value()
        .attr(attr)
        .map(|s| s.to_string())
}

fn meta_content(doc: &Html, property: &str) -> Option<String> {
    select_attr(doc, &format!(r#"meta[property="{property}"]"#), "content")
}

fn meta_name_content(doc: &Html, name: &str) -> Option<String> {
    select_attr(doc, &format!(r#"meta[name="{name}"]"#), "content")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_loopback_in_production_only() {
        assert!(validate_url("http://127.0.0.1/status", true).is_err());
        assert!(validate_url("http://localhost:3000/", true).is_err());
        assert!(validate_url("http://10.1.2.3/internal", true).is_err());
        assert!(validate_url("http://192.168.1.1/", true).is_err());
        assert!(validate_url("http://169.254.169.254/latest/meta-data", true).is_err());

        assert!(validate_url("http://127.0.0.1/status", false).is_ok());
        assert!(validate_url("https://www.freiburg.de/klimaschutz", true).is_ok());
    }

    #[test]
    fn refuses_non_http_schemes() {
        assert!(validate_url("ftp://example.org/file", false).is_err());
        assert!(validate_url("file:///etc/passwd", false).is_err());
        assert!(validate_url("not a url", false).is_err());
    }

    #[test]
    fn detects_javascript_shells() {
        let shell = format!(
            "<html><head>{}</head><body><div id=\"root\"></div></body></html>",
            "<script src=\"/app.js\"></script>".repeat(12)
        );
        assert!(looks_javascript_required(&shell));

        let article = format!(
            "<html><body><article>{}</article></body></html>",
            "Ein langer Artikeltext über kommunale Verkehrspolitik. ".repeat(30)
        );
        assert!(!looks_javascript_required(&article));
    }

    #[test]
    fn extracts_article_over_body() {
        let html = format!(
            "<html><body><nav>Menü Menü Menü</nav><article><h1>Titel</h1>{}</article></body></html>",
            "<p>Inhaltssatz mit einigen Wörtern für die Mindestlänge.</p>".repeat(8)
        );
        let doc = Html::parse_document(&html);
        let markdown = extract_main_content(&doc);
        assert!(markdown.contains("# Titel"));
        assert!(!markdown.contains("Menü"));
    }

    #[test]
    fn metadata_extraction_reads_og_tags() {
        let html = r#"<html><head>
            <title>Seite</title>
            <meta property="og:description" content="Beschreibung der Seite">
            <meta property="article:published_time" content="2025-03-01T10:00:00Z">
            <link rel="canonical" href="https://example.org/artikel">
        </head><body><p>x</p></body></html>"#;
        let doc = Html::parse_document(html);
        assert_eq!(select_text(&doc, "title").unwrap(), "Seite");
        assert_eq!(
            meta_content(&doc, "og:description").unwrap(),
            "Beschreibung der Seite"
        );
        assert_eq!(
            select_attr(&doc, r#"link[rel="canonical"]"#, "href").unwrap(),
            "https://example.org/artikel"
        );
        assert!(meta_content(&doc, "article:published_time")
            .unwrap()
            .starts_with("2025-03-01"));
    }
}
