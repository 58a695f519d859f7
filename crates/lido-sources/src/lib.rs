//! Source scraper contracts + directory-site implementations, candidate
//! discovery and website enrichment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lido_storage::{FetchError, HttpGateway};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "lido-sources";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to parse {context}: {message}")]
    Parse { context: &'static str, message: String },
}

/// Target parameters for one scraping run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeQuery {
    pub city: String,
    pub industry: String,
    pub max_pages: u32,
}

/// One parsed directory entry, the handoff contract into the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub name: String,
    pub city: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    pub detail_url: Option<String>,
    /// Provenance tags, first entry is the originating source.
    pub sources: Vec<String>,
}

impl ScrapedListing {
    pub fn new(name: impl Into<String>, source: &str) -> Self {
        Self {
            name: name.into(),
            sources: vec![source.to_string()],
            ..Default::default()
        }
    }
}

/// Receives scraping progress as (current_page, total_pages).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, current: u32, total: u32);
}

/// Sink for callers that do not track progress.
#[derive(Debug, Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _current: u32, _total: u32) {}
}

/// A named listing source. Transport retry/backoff lives inside the
/// gateway the implementation holds; callers only see the final result.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    fn name(&self) -> &'static str;

    async fn scrape(
        &self,
        query: &ScrapeQuery,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ScrapedListing>, ScrapeError>;
}

/// Scraper lookup by source name. Unknown names are a configuration
/// error the worker treats as fatal.
#[derive(Clone, Default)]
pub struct ScraperRegistry {
    scrapers: HashMap<&'static str, Arc<dyn SourceScraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scraper: Arc<dyn SourceScraper>) {
        self.scrapers.insert(scraper.name(), scraper);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceScraper>> {
        self.scrapers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.scrapers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Registry with all built-in directory scrapers.
pub fn builtin_registry(http: Arc<HttpGateway>) -> ScraperRegistry {
    let mut registry = ScraperRegistry::new();
    registry.register(Arc::new(ElevenEightyScraper::new(http.clone())));
    registry.register(Arc::new(GelbeSeitenScraper::new(http)));
    registry
}

fn selector(css: &'static str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Parse {
        context: "selector",
        message: format!("{css}: {e}"),
    })
}

fn text_of(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn first_match<'a>(
    entry: ElementRef<'a>,
    selectors: &[Selector],
) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|s| entry.select(s).next())
}

// ---------------------------------------------------------------------------
// 11880.com
// ---------------------------------------------------------------------------

pub struct ElevenEightyScraper {
    http: Arc<HttpGateway>,
}

impl ElevenEightyScraper {
    pub const BASE_URL: &'static str = "https://www.11880.com";

    pub fn new(http: Arc<HttpGateway>) -> Self {
        Self { http }
    }

    fn search_url(city: &str, industry: &str, page: u32) -> String {
        let industry = urlencoding::encode(industry);
        let city = urlencoding::encode(city);
        if page <= 1 {
            format!("{}/suche/{industry}/{city}", Self::BASE_URL)
        } else {
            format!("{}/suche/{industry}/{city}?page={page}", Self::BASE_URL)
        }
    }

    /// Parse one result page into listings. Entries live in
    /// `article` elements whose class carries `mod-Treffer`.
    pub fn parse_search_page(html: &str) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let document = Html::parse_document(html);
        let entry_sel = selector("article[class*='mod-Treffer']")?;
        let name_sels = [selector("h2[class*='name']")?, selector("a[class*='company']")?];
        let address_sels = [selector("address")?, selector("div[class*='address']")?];
        let phone_sel = selector("a[href^='tel:']")?;
        let website_sels = [
            selector("a[class*='website']")?,
            selector("a[class*='homepage']")?,
        ];
        let email_sel = selector("a[href^='mailto:']")?;
        let desc_sels = [
            selector("div[class*='description']")?,
            selector("div[class*='category']")?,
        ];
        let detail_sel = selector("a[href*='/branchenbuch/']")?;

        let mut listings = Vec::new();
        for entry in document.select(&entry_sel) {
            let Some(name_el) = first_match(entry, &name_sels) else {
                continue;
            };
            let name = text_of(name_el);
            if name.is_empty() {
                continue;
            }

            let mut listing = ScrapedListing::new(name, "11880");
            if let Some(el) = first_match(entry, &address_sels) {
                let (address, postal_code, city) = split_address(&text_of(el));
                listing.address = address;
                listing.postal_code = postal_code;
                listing.city = city;
            }
            if let Some(el) = entry.select(&phone_sel).next() {
                listing.phone = el
                    .value()
                    .attr("href")
                    .map(clean_phone)
                    .filter(|p| !p.is_empty());
            }
            if let Some(el) = first_match(entry, &website_sels) {
                listing.website = el.value().attr("href").map(str::to_string);
            }
            if let Some(el) = entry.select(&email_sel).next() {
                listing.email = el
                    .value()
                    .attr("href")
                    .map(clean_email)
                    .filter(|e| !e.is_empty());
            }
            if let Some(el) = first_match(entry, &desc_sels) {
                let desc = text_of(el);
                if !desc.is_empty() {
                    listing.description = Some(desc);
                }
            }
            if let Some(el) = entry.select(&detail_sel).next() {
                listing.detail_url = el
                    .value()
                    .attr("href")
                    .map(|href| format!("{}{href}", Self::BASE_URL));
            }
            listings.push(listing);
        }
        Ok(listings)
    }
}

#[async_trait]
impl SourceScraper for ElevenEightyScraper {
    fn name(&self) -> &'static str {
        "11880"
    }

    async fn scrape(
        &self,
        query: &ScrapeQuery,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let total = query.max_pages.max(1);
        let mut listings = Vec::new();
        for page in 1..=total {
            let url = Self::search_url(&query.city, &query.industry, page);
            let html = self.http.fetch_text(&url).await?;
            let mut page_listings = Self::parse_search_page(&html)?;
            let found = page_listings.len();
            for listing in &mut page_listings {
                if listing.city.is_none() {
                    listing.city = Some(query.city.clone());
                }
            }
            listings.append(&mut page_listings);
            progress.report(page, total).await;
            debug!(source = "11880", page, found, "parsed result page");
            if found == 0 {
                break;
            }
        }
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// gelbeseiten.de
// ---------------------------------------------------------------------------

pub struct GelbeSeitenScraper {
    http: Arc<HttpGateway>,
}

impl GelbeSeitenScraper {
    pub const BASE_URL: &'static str = "https://www.gelbeseiten.de";

    pub fn new(http: Arc<HttpGateway>) -> Self {
        Self { http }
    }

    fn search_url(city: &str, industry: &str, page: u32) -> String {
        let industry = urlencoding::encode(industry);
        let city = urlencoding::encode(city);
        if page <= 1 {
            format!("{}/suche/{industry}/{city}", Self::BASE_URL)
        } else {
            format!("{}/suche/{industry}/{city}/seite-{page}", Self::BASE_URL)
        }
    }

    /// Gelbe Seiten marks entries with `mod-Treffer`/`gs-result` classes
    /// and microdata address spans.
    pub fn parse_search_page(html: &str) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let document = Html::parse_document(html);
        let entry_sels = [
            selector("article[class*='mod-Treffer']")?,
            selector("article[class*='gs-result']")?,
            selector("div[data-wipe-name]")?,
        ];
        let name_sels = [selector("h2")?, selector("a[data-wipe-name]")?];
        let street_sel = selector("span[itemprop='streetAddress']")?;
        let postal_sel = selector("span[itemprop='postalCode']")?;
        let city_sel = selector("span[itemprop='addressLocality']")?;
        let phone_sel = selector("a[href^='tel:']")?;
        let website_sels = [
            selector("a[data-wipe-name='Homepage']")?,
            selector("a[class*='website']")?,
            selector("a[class*='homepage']")?,
        ];
        let email_sel = selector("a[href^='mailto:']")?;
        let detail_sel = selector("a[href*='/branchenbuch/']")?;

        let mut seen = Vec::new();
        let mut listings = Vec::new();
        for entry_sel in &entry_sels {
            for entry in document.select(entry_sel) {
                let Some(name_el) = first_match(entry, &name_sels) else {
                    continue;
                };
                let name = text_of(name_el);
                if name.is_empty() || seen.contains(&name) {
                    continue;
                }
                seen.push(name.clone());

                let mut listing = ScrapedListing::new(name, "gelbe_seiten");
                if let Some(el) = entry.select(&street_sel).next() {
                    listing.address = Some(text_of(el)).filter(|s| !s.is_empty());
                }
                if let Some(el) = entry.select(&postal_sel).next() {
                    listing.postal_code = Some(text_of(el)).filter(|s| !s.is_empty());
                }
                if let Some(el) = entry.select(&city_sel).next() {
                    listing.city = Some(text_of(el)).filter(|s| !s.is_empty());
                }
                if let Some(el) = entry.select(&phone_sel).next() {
                    listing.phone = el
                        .value()
                        .attr("href")
                        .map(clean_phone)
                        .filter(|p| !p.is_empty());
                }
                if let Some(el) = first_match(entry, &website_sels) {
                    listing.website = el.value().attr("href").map(str::to_string);
                }
                if let Some(el) = entry.select(&email_sel).next() {
                    listing.email = el
                        .value()
                        .attr("href")
                        .map(clean_email)
                        .filter(|e| !e.is_empty());
                }
                if let Some(el) = entry.select(&detail_sel).next() {
                    listing.detail_url = el.value().attr("href").map(str::to_string);
                }
                listings.push(listing);
            }
            if !listings.is_empty() {
                break;
            }
        }
        Ok(listings)
    }
}

#[async_trait]
impl SourceScraper for GelbeSeitenScraper {
    fn name(&self) -> &'static str {
        "gelbe_seiten"
    }

    async fn scrape(
        &self,
        query: &ScrapeQuery,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ScrapedListing>, ScrapeError> {
        let total = query.max_pages.max(1);
        let mut listings = Vec::new();
        for page in 1..=total {
            let url = Self::search_url(&query.city, &query.industry, page);
            let html = self.http.fetch_text(&url).await?;
            let mut page_listings = Self::parse_search_page(&html)?;
            let found = page_listings.len();
            for listing in &mut page_listings {
                if listing.city.is_none() {
                    listing.city = Some(query.city.clone());
                }
            }
            listings.append(&mut page_listings);
            progress.report(page, total).await;
            if found == 0 {
                break;
            }
        }
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// Discovery (fallback candidate search)
// ---------------------------------------------------------------------------

/// External search used when a directory scrape comes back empty.
#[async_trait]
pub trait DiscoverySearcher: Send + Sync {
    async fn discover(
        &self,
        industry: &str,
        city: &str,
        max_results: usize,
    ) -> Result<Vec<(String, String)>, ScrapeError>;
}

/// DuckDuckGo Lite HTML search; returns (title, url) pairs filtered
/// against search-engine and social domains.
pub struct DuckDuckGoDiscovery {
    http: Arc<HttpGateway>,
}

impl DuckDuckGoDiscovery {
    pub fn new(http: Arc<HttpGateway>) -> Self {
        Self { http }
    }

    fn search_url(industry: &str, city: &str) -> String {
        let query = urlencoding::encode(&format!("{industry} {city}")).into_owned();
        format!("https://lite.duckduckgo.com/lite/?q={query}")
    }

    pub fn extract_results(html: &str, max_results: usize) -> Vec<(String, String)> {
        let document = Html::parse_document(html);
        let link_sel = match Selector::parse("a[href]") {
            Ok(sel) => sel,
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<(String, String)> = Vec::new();
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            if !href.starts_with("http") || href.contains("/lite/") {
                continue;
            }
            if !is_plausible_company_site(href) {
                continue;
            }
            let title = text_of(link);
            if title.is_empty() {
                continue;
            }
            if out.iter().any(|(_, url)| url.as_str() == href) {
                continue;
            }
            out.push((title, href.to_string()));
            if out.len() >= max_results {
                break;
            }
        }
        out
    }
}

#[async_trait]
impl DiscoverySearcher for DuckDuckGoDiscovery {
    async fn discover(
        &self,
        industry: &str,
        city: &str,
        max_results: usize,
    ) -> Result<Vec<(String, String)>, ScrapeError> {
        let url = Self::search_url(industry, city);
        let html = self.http.fetch_text(&url).await?;
        let results = Self::extract_results(&html, max_results);
        debug!(industry, city, found = results.len(), "discovery search finished");
        Ok(results)
    }
}

const EXCLUDED_DOMAINS: &[&str] = &[
    "duckduckgo.com",
    "google.",
    "bing.com",
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "xing.com",
    "youtube.com",
    "wikipedia.org",
    "gelbeseiten.de",
    "11880.com",
    "dasoertliche.de",
];

fn is_plausible_company_site(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    !EXCLUDED_DOMAINS.iter().any(|d| host.contains(d))
}

// ---------------------------------------------------------------------------
// Website enrichment
// ---------------------------------------------------------------------------

/// Fills missing contact fields on a listing from its own website.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Returns `true` when at least one field was filled.
    async fn enrich(&self, listing: &mut ScrapedListing) -> Result<bool, ScrapeError>;
}

/// Fetches the listing's website and pulls email/phone out of the page
/// text with plain pattern matching.
pub struct WebsiteEnricher {
    http: Arc<HttpGateway>,
}

impl WebsiteEnricher {
    pub const SOURCE_TAG: &'static str = "website_enrichment";

    pub fn new(http: Arc<HttpGateway>) -> Self {
        Self { http }
    }
}

/// Extract the first email and phone found in page text.
pub fn extract_contacts(html: &str) -> (Option<String>, Option<String>) {
    // Compiled per call; enrichment is bounded by max_sites so this is
    // not on a hot path.
    let email_re = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
        .ok();
    let phone_re = Regex::new(r"(?:\+49|0)[0-9][0-9 /().-]{6,20}[0-9]").ok();

    let email = email_re
        .and_then(|re| re.find(html).map(|m| m.as_str().to_lowercase()))
        .filter(|e| !e.ends_with(".png") && !e.ends_with(".jpg") && !e.ends_with(".svg"));
    let phone = phone_re.and_then(|re| re.find(html).map(|m| collapse_whitespace(m.as_str())));
    (email, phone)
}

#[async_trait]
impl Enricher for WebsiteEnricher {
    async fn enrich(&self, listing: &mut ScrapedListing) -> Result<bool, ScrapeError> {
        let Some(website) = listing.website.clone() else {
            return Ok(false);
        };
        let html = self.http.fetch_text(&website).await?;
        let (email, phone) = extract_contacts(&html);

        let mut filled = false;
        if listing.email.is_none() {
            if let Some(email) = email {
                listing.email = Some(email);
                filled = true;
            }
        }
        if listing.phone.is_none() {
            if let Some(phone) = phone {
                listing.phone = Some(phone);
                filled = true;
            }
        }
        if filled && !listing.sources.iter().any(|s| s == Self::SOURCE_TAG) {
            listing.sources.push(Self::SOURCE_TAG.to_string());
        }
        if !filled {
            warn!(website, name = %listing.name, "enrichment found no new contact data");
        }
        Ok(filled)
    }
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip a `tel:` prefix and surrounding noise, keep display formatting.
pub fn clean_phone(raw: &str) -> String {
    collapse_whitespace(raw.trim_start_matches("tel:").trim())
}

/// Strip a `mailto:` prefix plus query parameters, lowercase.
pub fn clean_email(raw: &str) -> String {
    let email = raw.trim_start_matches("mailto:");
    let email = email.split('?').next().unwrap_or(email);
    email.trim().to_lowercase()
}

/// Break a one-line German address into (street, postal_code, city).
/// `"Königstraße 1, 70173 Stuttgart"` splits on the 5-digit code.
pub fn split_address(raw: &str) -> (Option<String>, Option<String>, Option<String>) {
    let text = collapse_whitespace(raw);
    if text.is_empty() {
        return (None, None, None);
    }
    let Some(re) = Regex::new(r"\b(\d{5})\s+(.+)$").ok() else {
        return (Some(text), None, None);
    };
    match re.captures(&text) {
        Some(caps) => {
            let postal = caps.get(1).map(|m| m.as_str().to_string());
            let city = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|c| !c.is_empty());
            let street = text[..caps.get(0).map(|m| m.start()).unwrap_or(0)]
                .trim()
                .trim_end_matches(',')
                .trim()
                .to_string();
            let street = if street.is_empty() { None } else { Some(street) };
            (street, postal, city)
        }
        None => (Some(text), None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELEVEN_EIGHTY_PAGE: &str = r#"
        <html><body>
        <article class="mod-Treffer">
            <h2 class="name">Musterfirma IT-Service GmbH</h2>
            <address>Königstraße 1, 70173 Stuttgart</address>
            <a href="tel:+49 711 8829810">+49 711 8829810</a>
            <a class="website" href="https://www.musterfirma.example">Webseite</a>
            <a href="mailto:Info@Musterfirma.example?subject=Anfrage">Mail</a>
            <div class="description">IT-Dienstleistungen</div>
            <a href="/branchenbuch/stuttgart/musterfirma">Details</a>
        </article>
        <article class="mod-Treffer">
            <h2 class="name">Zweite Firma</h2>
        </article>
        <article class="mod-TrefferAd"><div>ad block without name</div></article>
        </body></html>
    "#;

    #[test]
    fn eleven_eighty_page_parses_entries() {
        let listings = ElevenEightyScraper::parse_search_page(ELEVEN_EIGHTY_PAGE).unwrap();
        // The ad block has no name element and is dropped.
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.name, "Musterfirma IT-Service GmbH");
        assert_eq!(first.address.as_deref(), Some("Königstraße 1"));
        assert_eq!(first.postal_code.as_deref(), Some("70173"));
        assert_eq!(first.city.as_deref(), Some("Stuttgart"));
        assert_eq!(first.phone.as_deref(), Some("+49 711 8829810"));
        assert_eq!(first.email.as_deref(), Some("info@musterfirma.example"));
        assert_eq!(first.website.as_deref(), Some("https://www.musterfirma.example"));
        assert_eq!(
            first.detail_url.as_deref(),
            Some("https://www.11880.com/branchenbuch/stuttgart/musterfirma")
        );
        assert_eq!(first.sources, vec!["11880".to_string()]);

        let second = &listings[1];
        assert_eq!(second.name, "Zweite Firma");
        assert!(second.phone.is_none());
    }

    #[test]
    fn gelbe_seiten_page_parses_microdata_addresses() {
        let html = r#"
            <article class="gs-result">
                <h2>Beispiel Consulting</h2>
                <span itemprop="streetAddress">Hauptstraße 5</span>
                <span itemprop="postalCode">10115</span>
                <span itemprop="addressLocality">Berlin</span>
                <a href="tel:030 1234567">anrufen</a>
                <a data-wipe-name="Homepage" href="https://beispiel-consulting.example">Homepage</a>
            </article>
        "#;
        let listings = GelbeSeitenScraper::parse_search_page(html).unwrap();
        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.name, "Beispiel Consulting");
        assert_eq!(listing.address.as_deref(), Some("Hauptstraße 5"));
        assert_eq!(listing.postal_code.as_deref(), Some("10115"));
        assert_eq!(listing.city.as_deref(), Some("Berlin"));
        assert_eq!(listing.phone.as_deref(), Some("030 1234567"));
        assert_eq!(listing.sources, vec!["gelbe_seiten".to_string()]);
    }

    #[test]
    fn discovery_extraction_skips_portals_and_search_links() {
        let html = r#"
            <body>
            <a href="/lite/?q=next">next</a>
            <a href="https://duckduckgo.com/about">about</a>
            <a href="https://www.linkedin.com/company/foo">Foo on LinkedIn</a>
            <a href="https://www.foo-it.example/">Foo IT Service</a>
            <a href="https://www.foo-it.example/">Foo IT Service (dup)</a>
            <a href="https://bar-systems.example/kontakt">Bar Systems</a>
            </body>
        "#;
        let results = DuckDuckGoDiscovery::extract_results(html, 10);
        assert_eq!(
            results,
            vec![
                ("Foo IT Service".to_string(), "https://www.foo-it.example/".to_string()),
                ("Bar Systems".to_string(), "https://bar-systems.example/kontakt".to_string()),
            ]
        );
        // max_results caps the walk
        assert_eq!(DuckDuckGoDiscovery::extract_results(html, 1).len(), 1);
    }

    #[test]
    fn contact_extraction_finds_email_and_phone() {
        let html = r#"
            <footer>
              Kontakt: <a href="mailto:kontakt@firma.example">kontakt@firma.example</a>
              Telefon: 0711 / 882 98-10
            </footer>
        "#;
        let (email, phone) = extract_contacts(html);
        assert_eq!(email.as_deref(), Some("kontakt@firma.example"));
        assert!(phone.is_some());
    }

    #[test]
    fn phone_and_email_cleaning() {
        assert_eq!(clean_phone("tel:+49 711 8829810"), "+49 711 8829810");
        assert_eq!(clean_email("mailto:Info@Firma.DE?subject=Hi"), "info@firma.de");
    }

    #[test]
    fn address_split_handles_missing_postal_code() {
        assert_eq!(
            split_address("Königstraße 1, 70173 Stuttgart"),
            (
                Some("Königstraße 1".to_string()),
                Some("70173".to_string()),
                Some("Stuttgart".to_string())
            )
        );
        assert_eq!(
            split_address("Nur eine Straße 12"),
            (Some("Nur eine Straße 12".to_string()), None, None)
        );
        assert_eq!(split_address("   "), (None, None, None));
    }

    #[test]
    fn registry_resolves_by_name() {
        let http = Arc::new(HttpGateway::new(
            Default::default(),
            Arc::new(lido_storage::DirectEgress),
        ));
        let registry = builtin_registry(http);
        assert!(registry.get("11880").is_some());
        assert!(registry.get("gelbe_seiten").is_some());
        assert!(registry.get("handelsregister").is_none());
        assert_eq!(registry.names(), vec!["11880", "gelbe_seiten"]);
    }
}
