//! Result collector.
//!
//! Walks the result listing a submitted search lands on, page by page,
//! and turns every card into a notice number (plus, for regime B, the
//! link to its registry page). Regime-B numbers are then resolved to
//! registry ids by visiting each detail page.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use thirtyfour::prelude::*;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{RetryConfig, SiteConfig, TimeoutConfig};
use crate::locator::Locator;
use crate::models::{CollectedRecord, Regime};
use crate::wait::{self, find_opt, find_opt_in};

static NOTICE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"№?\s*(\d+)").expect("valid notice number regex"));

/// Leading numeric token of a card label, e.g. the number in
/// `"Извещение № 0123456789012345678"`.
pub fn parse_notice_number(label: &str) -> Option<String> {
    NOTICE_NUMBER
        .captures(label)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Value of query parameter `name` in `url`.
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Whether `url` is served from `domain` or one of its subdomains.
pub fn on_domain(url: &Url, domain: &str) -> bool {
    match url.host_str() {
        Some(host) => host == domain || host.ends_with(&format!(".{}", domain)),
        None => false,
    }
}

/// One card of the result listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub number: String,
    pub link: Option<String>,
}

/// Everything one search produced.
#[derive(Debug, Default)]
pub struct Collection {
    pub listings: Vec<Listing>,
    pub pages: u32,
    /// Set when a page transition kept failing and collection stopped early.
    pub truncated: bool,
}

/// Result of one try at opening a result page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    /// The link was there but the page did not change in time.
    TimedOut,
    /// No pager, or no link to the wanted page: the results end here.
    NoPage,
}

enum PageTurn {
    Turned,
    NoMorePages,
    GaveUp,
}

/// The browser side of collection: result pages and registry detail pages.
#[async_trait]
pub trait ResultPages: Send + Sync {
    /// Listings on the current result page.
    async fn listings(&self) -> Result<Vec<Listing>>;

    /// Try once to open result page `page`.
    async fn open_page(&self, page: u32) -> Result<Transition>;

    /// Follow a detail link. The registry URL it lands on, or `None` when
    /// it never reaches the registry.
    async fn open_detail(&self, link: &str) -> Result<Option<Url>>;

    /// `href` of the registry page's header link, `None` while the header
    /// has not rendered. A header link without `href` gives an empty string.
    async fn header_href(&self) -> Result<Option<String>>;

    async fn reload(&self) -> Result<()>;
}

/// Collect every listing across all result pages, starting from the one
/// the session is on.
pub async fn collect_pages<P: ResultPages + ?Sized>(pages: &P, page_retries: u32) -> Result<Collection> {
    let mut collection = Collection::default();
    collection.listings.extend(pages.listings().await?);
    collection.pages = 1;

    let mut next = 2u32;
    loop {
        match turn_page(pages, next, page_retries).await? {
            PageTurn::Turned => {
                collection.listings.extend(pages.listings().await?);
                collection.pages += 1;
                next += 1;
            }
            PageTurn::NoMorePages => break,
            PageTurn::GaveUp => {
                warn!(page = next, "could not open result page, stopping collection");
                collection.truncated = true;
                break;
            }
        }
    }

    info!(
        pages = collection.pages,
        listings = collection.listings.len(),
        "collection finished"
    );
    Ok(collection)
}

/// Open result page `page`, reloading after every transition that times out.
async fn turn_page<P: ResultPages + ?Sized>(pages: &P, page: u32, retries: u32) -> Result<PageTurn> {
    for attempt in 0..=retries {
        match pages.open_page(page).await? {
            Transition::Opened => return Ok(PageTurn::Turned),
            Transition::NoPage => return Ok(PageTurn::NoMorePages),
            Transition::TimedOut => {
                warn!(page, attempt, "page transition timed out, reloading");
                pages.reload().await?;
            }
        }
    }
    Ok(PageTurn::GaveUp)
}

/// Registry ids of the notice behind `link`: its notice id, and the
/// platform file id from the page header. Either is empty when it could
/// not be read.
pub async fn lookup_detail<P: ResultPages + ?Sized>(
    pages: &P,
    link: &str,
    locator: &Locator,
    retries: u32,
) -> Result<(String, String)> {
    let Some(registry_url) = pages.open_detail(link).await? else {
        warn!(link, "detail link did not reach the registry");
        return Ok((String::new(), String::new()));
    };
    let notice_info_id =
        query_param(&registry_url, &locator.registry_notice_param).unwrap_or_default();
    if notice_info_id.is_empty() {
        warn!(url = %registry_url, "registry url carries no notice id");
    }

    for attempt in 0..=retries {
        if let Some(href) = pages.header_href().await? {
            let platform_file_id = registry_url
                .join(&href)
                .ok()
                .filter(|_| !href.is_empty())
                .and_then(|url| query_param(&url, &locator.platform_file_param))
                .unwrap_or_default();
            return Ok((notice_info_id, platform_file_id));
        }
        debug!(attempt, url = %registry_url, "registry header not rendered, reloading");
        pages.reload().await?;
    }

    warn!(url = %registry_url, "registry header never rendered");
    Ok((notice_info_id, String::new()))
}

/// Resolve regime-B listings to full records by visiting each detail
/// page. Listings whose page cannot be resolved keep empty registry ids.
pub async fn resolve_listings<P: ResultPages + ?Sized>(
    pages: &P,
    listings: Vec<Listing>,
    locator: &Locator,
    retries: u32,
) -> Result<Vec<CollectedRecord>> {
    let mut records = Vec::with_capacity(listings.len());
    for listing in listings {
        let (notice_info_id, platform_file_id) = match listing.link.as_deref() {
            Some(link) => lookup_detail(pages, link, locator, retries).await?,
            None => (String::new(), String::new()),
        };
        records.push(CollectedRecord::Detailed {
            number: listing.number,
            notice_info_id,
            platform_file_id,
        });
    }
    Ok(records)
}

/// Turn listings into regime-A records.
pub fn identifiers(listings: Vec<Listing>) -> Vec<CollectedRecord> {
    listings
        .into_iter()
        .map(|listing| CollectedRecord::Identifier(listing.number))
        .collect()
}

/// Turn a finished collection into records for `regime`. Numbers the
/// regime rejects are dropped before any detail page is visited.
pub async fn into_records<P: ResultPages + ?Sized>(
    pages: &P,
    collection: Collection,
    regime: Regime,
    locator: &Locator,
    retry: &RetryConfig,
) -> Result<Vec<CollectedRecord>> {
    let listings: Vec<Listing> = collection
        .listings
        .into_iter()
        .filter(|listing| {
            let ok = regime.accepts(&listing.number);
            if !ok {
                debug!(regime = %regime, number = listing.number.as_str(), "dropping malformed listing");
            }
            ok
        })
        .collect();
    match regime {
        Regime::A => Ok(identifiers(listings)),
        Regime::B => resolve_listings(pages, listings, locator, retry.detail_retries).await,
    }
}

/// Collects listings from the results page of one session.
pub struct Collector<'a> {
    driver: &'a WebDriver,
    locator: &'a Locator,
    site: &'a SiteConfig,
    timeouts: &'a TimeoutConfig,
    retry: &'a RetryConfig,
}

impl<'a> Collector<'a> {
    pub fn new(
        driver: &'a WebDriver,
        locator: &'a Locator,
        site: &'a SiteConfig,
        timeouts: &'a TimeoutConfig,
        retry: &'a RetryConfig,
    ) -> Self {
        Self {
            driver,
            locator,
            site,
            timeouts,
            retry,
        }
    }

    /// Collect every listing across all result pages.
    pub async fn collect_all(&self) -> Result<Collection> {
        collect_pages(self, self.retry.page_retries).await
    }

    /// Turn `collection` into records for `regime`, visiting detail pages
    /// where the regime needs them.
    pub async fn records(&self, collection: Collection, regime: Regime) -> Result<Vec<CollectedRecord>> {
        into_records(self, collection, regime, self.locator, self.retry).await
    }

    async fn card_listing(&self, card: &WebElement) -> WebDriverResult<Option<Listing>> {
        let Some(link) = find_opt(card, By::Css(self.locator.result_link.as_str())).await? else {
            return Ok(None);
        };
        let label = link.text().await?;
        let Some(number) = parse_notice_number(&label) else {
            debug!(label = label.as_str(), "card label has no notice number");
            return Ok(None);
        };
        Ok(Some(Listing {
            number,
            link: link.prop("href").await?,
        }))
    }

    async fn try_open_page(&self, page: u32) -> WebDriverResult<Transition> {
        let interval = self.timeouts.poll_interval();
        let wanted = page.to_string();

        let Some(pager) = find_opt_in(self.driver, By::Css(self.locator.pager.as_str())).await?
        else {
            return Ok(Transition::NoPage);
        };
        if wait::displayed_within(&pager, By::Tag("li"), self.timeouts.pager(), interval)
            .await
            .is_none()
        {
            return Ok(Transition::NoPage);
        }

        let mut target = None;
        for link in pager.find_all(By::Css(self.locator.page_link.as_str())).await? {
            if link.text().await?.trim() == wanted {
                target = Some(link);
                break;
            }
        }
        let Some(link) = target else {
            return Ok(Transition::NoPage);
        };

        let origin = self.driver.current_url().await?;
        let clicked = self
            .locator
            .click_through_popup(self.driver, &link, self.timeouts.element(), interval)
            .await?;
        if clicked && wait::url_changed(self.driver, &origin, self.timeouts.url_change(), interval).await {
            Ok(Transition::Opened)
        } else {
            Ok(Transition::TimedOut)
        }
    }
}

#[async_trait]
impl ResultPages for Collector<'_> {
    /// A page whose cards never render is an empty result, not an error.
    /// A card that re-renders while it is read is skipped.
    async fn listings(&self) -> Result<Vec<Listing>> {
        let interval = self.timeouts.poll_interval();
        let Some(containers) = wait::displayed(
            self.driver,
            &self.locator.results_container,
            self.timeouts.pager(),
            interval,
        )
        .await
        else {
            return Ok(Vec::new());
        };
        let Some(cards) = wait::displayed_within(
            &containers[0],
            By::Css(self.locator.result_item.as_str()),
            self.timeouts.results(),
            interval,
        )
        .await
        else {
            return Ok(Vec::new());
        };

        let mut listings = Vec::with_capacity(cards.len());
        for card in &cards {
            match self.card_listing(card).await {
                Ok(Some(listing)) => listings.push(listing),
                Ok(None) => {}
                Err(e) if wait::is_transient(&e) => debug!(error = %e, "result card unreadable, skipping"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(listings)
    }

    async fn open_page(&self, page: u32) -> Result<Transition> {
        match self.try_open_page(page).await {
            Ok(transition) => Ok(transition),
            Err(e) if wait::is_transient(&e) => {
                debug!(page, error = %e, "page transition interrupted");
                Ok(Transition::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_detail(&self, link: &str) -> Result<Option<Url>> {
        if let Err(e) = self.driver.goto(link).await {
            warn!(link, error = %e, "could not open detail page");
            return Ok(None);
        }
        let driver = self.driver;
        let domain = self.site.registry_domain.as_str();
        Ok(wait::poll_until(self.timeouts.element(), self.timeouts.poll_interval(), || async move {
            let url = driver.current_url().await?;
            Ok(on_domain(&url, domain).then_some(url))
        })
        .await)
    }

    async fn header_href(&self) -> Result<Option<String>> {
        let Some(links) = wait::displayed(
            self.driver,
            &self.locator.registry_header_link,
            self.timeouts.element(),
            self.timeouts.poll_interval(),
        )
        .await
        else {
            return Ok(None);
        };
        match links[0].attr("href").await {
            Ok(href) => Ok(Some(href.unwrap_or_default())),
            Err(e) if wait::is_transient(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self) -> Result<()> {
        self.driver.refresh().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const REGISTRY_PAGE: &str =
        "https://zakupki.gov.ru/epz/order/notice/notice223/common-info.html?noticeInfoId=555";

    /// In-memory result pages and registry.
    #[derive(Default)]
    struct FakePages {
        /// Listings of page 1, 2, ...
        pages: Vec<Vec<Listing>>,
        current: Mutex<usize>,
        /// Transitions to a page that time out before it opens.
        stalls: Mutex<HashMap<u32, u32>>,
        /// Where each detail link lands; absent links never reach the registry.
        details: HashMap<String, Url>,
        /// Successive header lookups; `None` once exhausted.
        headers: Mutex<VecDeque<Option<String>>>,
        visited: Mutex<Vec<String>>,
        reloads: AtomicU32,
    }

    impl FakePages {
        fn with_pages(pages: Vec<Vec<Listing>>) -> Self {
            Self {
                pages,
                ..Self::default()
            }
        }

        fn stall(self, page: u32, times: u32) -> Self {
            self.stalls.lock().unwrap().insert(page, times);
            self
        }

        fn reloads(&self) -> u32 {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResultPages for FakePages {
        async fn listings(&self) -> Result<Vec<Listing>> {
            let current = *self.current.lock().unwrap();
            Ok(self.pages.get(current).cloned().unwrap_or_default())
        }

        async fn open_page(&self, page: u32) -> Result<Transition> {
            if page as usize > self.pages.len() {
                return Ok(Transition::NoPage);
            }
            if let Some(left) = self.stalls.lock().unwrap().get_mut(&page) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(Transition::TimedOut);
                }
            }
            *self.current.lock().unwrap() = page as usize - 1;
            Ok(Transition::Opened)
        }

        async fn open_detail(&self, link: &str) -> Result<Option<Url>> {
            self.visited.lock().unwrap().push(link.to_string());
            Ok(self.details.get(link).cloned())
        }

        async fn header_href(&self) -> Result<Option<String>> {
            Ok(self.headers.lock().unwrap().pop_front().flatten())
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn listing(number: &str, link: Option<&str>) -> Listing {
        Listing {
            number: number.to_string(),
            link: link.map(str::to_string),
        }
    }

    fn numbers(collection: &Collection) -> Vec<&str> {
        collection.listings.iter().map(|l| l.number.as_str()).collect()
    }

    fn three_pages() -> Vec<Vec<Listing>> {
        vec![
            vec![listing("1", None), listing("2", None)],
            vec![listing("3", None)],
            vec![listing("4", None)],
        ]
    }

    fn registry_with(link: &str) -> FakePages {
        let mut pages = FakePages::default();
        pages
            .details
            .insert(link.to_string(), Url::parse(REGISTRY_PAGE).unwrap());
        pages
    }

    #[tokio::test]
    async fn test_collects_until_pager_ends() {
        let pages = FakePages::with_pages(three_pages());
        let collection = collect_pages(&pages, 3).await.unwrap();
        assert_eq!(numbers(&collection), vec!["1", "2", "3", "4"]);
        assert_eq!(collection.pages, 3);
        assert!(!collection.truncated);
        assert_eq!(pages.reloads(), 0);
    }

    #[tokio::test]
    async fn test_single_page_without_pager_is_complete() {
        let pages = FakePages::with_pages(vec![vec![listing("1", None)]]);
        let collection = collect_pages(&pages, 3).await.unwrap();
        assert_eq!(collection.pages, 1);
        assert!(!collection.truncated);
    }

    #[tokio::test]
    async fn test_stalled_transition_recovers_after_reload() {
        let pages = FakePages::with_pages(three_pages()).stall(2, 2);
        let collection = collect_pages(&pages, 3).await.unwrap();
        assert_eq!(collection.pages, 3);
        assert!(!collection.truncated);
        assert_eq!(pages.reloads(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_on_page_and_flags_truncation() {
        let pages = FakePages::with_pages(three_pages()).stall(2, u32::MAX);
        let collection = collect_pages(&pages, 2).await.unwrap();
        assert_eq!(numbers(&collection), vec!["1", "2"]);
        assert_eq!(collection.pages, 1);
        assert!(collection.truncated);
        assert_eq!(pages.reloads(), 3);
    }

    #[tokio::test]
    async fn test_detail_reads_both_registry_ids() {
        let pages = registry_with("https://www.rts-tender.ru/poisk/1");
        pages
            .headers
            .lock()
            .unwrap()
            .extend([None, Some("/epz/order/notice/printForm/view.html?id=77".to_string())]);
        let ids = lookup_detail(&pages, "https://www.rts-tender.ru/poisk/1", &Locator::default(), 3)
            .await
            .unwrap();
        assert_eq!(ids, ("555".to_string(), "77".to_string()));
        assert_eq!(pages.reloads(), 1);
    }

    #[tokio::test]
    async fn test_detail_header_retries_end_with_empty_platform_id() {
        let pages = registry_with("https://www.rts-tender.ru/poisk/1");
        let ids = lookup_detail(&pages, "https://www.rts-tender.ru/poisk/1", &Locator::default(), 2)
            .await
            .unwrap();
        assert_eq!(ids, ("555".to_string(), String::new()));
        assert_eq!(pages.reloads(), 3);
    }

    #[tokio::test]
    async fn test_detail_off_registry_gives_empty_fields() {
        let pages = FakePages::default();
        let records = resolve_listings(
            &pages,
            vec![listing("31000000001", Some("/poisk/relative"))],
            &Locator::default(),
            3,
        )
        .await
        .unwrap();
        assert_eq!(records[0].to_line(), "31000000001");
        assert_eq!(pages.reloads(), 0);
    }

    #[tokio::test]
    async fn test_malformed_numbers_are_never_visited() {
        let pages = registry_with("https://x/valid");
        pages.headers.lock().unwrap().push_back(Some(String::new()));
        let collection = Collection {
            listings: vec![
                listing("31000000001", Some("https://x/valid")),
                listing("21000000004", Some("https://x/wrong-prefix")),
                listing("12345", Some("https://x/short")),
            ],
            pages: 1,
            truncated: false,
        };
        let records = into_records(
            &pages,
            collection,
            Regime::B,
            &Locator::default(),
            &RetryConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_line(), "31000000001;555");
        assert_eq!(*pages.visited.lock().unwrap(), vec!["https://x/valid".to_string()]);
    }

    #[test]
    fn test_parse_notice_number_with_marker() {
        assert_eq!(
            parse_notice_number("Извещение № 0123456789012345678").as_deref(),
            Some("0123456789012345678")
        );
    }

    #[test]
    fn test_parse_notice_number_without_space_or_marker() {
        assert_eq!(
            parse_notice_number("Извещение №0123456789012345678").as_deref(),
            Some("0123456789012345678")
        );
        assert_eq!(
            parse_notice_number("  0123456789012345678  ").as_deref(),
            Some("0123456789012345678")
        );
    }

    #[test]
    fn test_parse_notice_number_missing() {
        assert!(parse_notice_number("Извещение").is_none());
    }

    #[test]
    fn test_query_param() {
        let url = Url::parse(
            "https://zakupki.gov.ru/epz/order/notice/notice223/common-info.html?noticeInfoId=15512345&x=",
        )
        .unwrap();
        assert_eq!(query_param(&url, "noticeInfoId").as_deref(), Some("15512345"));
        assert!(query_param(&url, "x").is_none());
        assert!(query_param(&url, "id").is_none());
    }

    #[test]
    fn test_on_domain() {
        let registry = Url::parse("https://zakupki.gov.ru/epz/main").unwrap();
        let sub = Url::parse("https://new.zakupki.gov.ru/epz/main").unwrap();
        let other = Url::parse("https://www.rts-tender.ru/poisk").unwrap();
        let lookalike = Url::parse("https://notzakupki.gov.ru/").unwrap();
        assert!(on_domain(&registry, "zakupki.gov.ru"));
        assert!(on_domain(&sub, "zakupki.gov.ru"));
        assert!(!on_domain(&other, "zakupki.gov.ru"));
        assert!(!on_domain(&lookalike, "zakupki.gov.ru"));
    }

    #[test]
    fn test_identifiers_keep_order() {
        let listings = vec![
            Listing {
                number: "1".to_string(),
                link: None,
            },
            Listing {
                number: "2".to_string(),
                link: Some("https://x".to_string()),
            },
        ];
        assert_eq!(
            identifiers(listings),
            vec![
                CollectedRecord::Identifier("1".to_string()),
                CollectedRecord::Identifier("2".to_string()),
            ]
        );
    }
}
