//! Filter-fill engine.
//!
//! Drives one browser session through the site's filter form: open the
//! form, wait for it to settle, normalise every section (expanded, "show
//! more" clicked, defaults cleared), fill each [`SearchEntry`] into its
//! widget, and submit.
//!
//! A page that never settles is reloaded and the whole protocol starts
//! over, up to `retry.fill_restarts` times. Values that could not be put
//! into the form are returned in a [`FillReport`] so the caller can decide
//! on a fallback search.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use thirtyfour::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, SiteConfig, TimeoutConfig};
use crate::locator::{has_class, text_matches, FilterSection, Locator};
use crate::search_spec::{SearchEntry, SearchSpecification, TreeTraversal, Widget, WidgetKind};
use crate::tree::{self, WebTreeNode};
use crate::wait::{self, find_opt, find_opt_in};

/// Date format the site's date pickers accept.
const DATE_FORMAT: &str = "%d-%m-%Y";

/// Values that did not make it into the form, grouped by widget kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillReport {
    unfilled: BTreeMap<WidgetKind, Vec<String>>,
}

impl FillReport {
    fn record(&mut self, kind: WidgetKind, values: Vec<String>) {
        if !values.is_empty() {
            self.unfilled.entry(kind).or_default().extend(values);
        }
    }

    pub fn unfilled(&self, kind: WidgetKind) -> &[String] {
        self.unfilled.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_complete(&self) -> bool {
        self.unfilled.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WidgetKind, &[String])> {
        self.unfilled.iter().map(|(kind, values)| (*kind, values.as_slice()))
    }
}

/// Outcome of one pass through the filter form.
#[derive(Debug)]
pub enum Attempt {
    Submitted(FillReport),
    /// The page was in the way; a reload may help.
    Unready(&'static str),
}

/// A filter form that can be filled, and reloaded when it misbehaves.
#[async_trait]
pub trait FilterForm: Send + Sync {
    async fn attempt(&self, spec: &SearchSpecification) -> Result<Attempt>;

    async fn reload(&self) -> Result<()>;
}

/// Run `form.attempt` until it submits, reloading in between. Gives up
/// after `restarts` reloads.
pub async fn fill_with_restarts<F: FilterForm + ?Sized>(
    form: &F,
    spec: &SearchSpecification,
    restarts: u32,
) -> Result<FillReport> {
    let attempts = restarts + 1;
    for attempt in 1..=attempts {
        match form.attempt(spec).await? {
            Attempt::Submitted(report) => {
                for (kind, values) in report.iter() {
                    warn!(widget = %kind, ?values, "values could not be filled");
                }
                return Ok(report);
            }
            Attempt::Unready(reason) if attempt < attempts => {
                warn!(attempt, attempts, reason, "filter page not ready, reloading");
                form.reload().await?;
            }
            Attempt::Unready(reason) => {
                warn!(attempt, attempts, reason, "filter page not ready");
            }
        }
    }
    bail!("filter form was not submitted after {} attempts", attempts)
}

/// Turn a browser error that a reload can clear into [`Attempt::Unready`].
fn settle(outcome: Result<Attempt>) -> Result<Attempt> {
    match outcome {
        Err(e) if e.downcast_ref::<WebDriverError>().is_some_and(wait::is_transient) => {
            debug!(error = %e, "fill interrupted by the page");
            Ok(Attempt::Unready("browser interrupted the fill"))
        }
        other => other,
    }
}

/// `[today - days, today]`.
pub fn date_interval(today: NaiveDate, days: u32) -> [NaiveDate; 2] {
    let start = today
        .checked_sub_days(chrono::Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN);
    [start, today]
}

/// Indices of the `values` that occur in `label`, ignoring case.
pub fn matching_values(label: &str, values: &[String]) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, value)| text_matches(label, value))
        .map(|(i, _)| i)
        .collect()
}

fn unmatched(values: &[String], matched: &[bool]) -> Vec<String> {
    values
        .iter()
        .zip(matched)
        .filter(|(_, hit)| !**hit)
        .map(|(value, _)| value.clone())
        .collect()
}

/// Fills the filter form of one session.
pub struct FillEngine<'a> {
    driver: &'a WebDriver,
    locator: &'a Locator,
    site: &'a SiteConfig,
    timeouts: &'a TimeoutConfig,
    retry: &'a RetryConfig,
}

impl<'a> FillEngine<'a> {
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

    /// Fill `spec` into the form and submit it, leaving the session on the
    /// results page.
    pub async fn fill_and_submit(&self, spec: &SearchSpecification) -> Result<FillReport> {
        fill_with_restarts(self, spec, self.retry.fill_restarts).await
    }

    async fn fill_once(&self, spec: &SearchSpecification) -> Result<Attempt> {
        let interval = self.timeouts.poll_interval();
        self.driver.goto(self.site.filter_url.as_str()).await?;

        if !wait::dismissed(
            self.driver,
            &self.locator.loading_overlay,
            self.timeouts.overlay(),
            interval,
        )
        .await
        {
            return Ok(Attempt::Unready("loading overlay still shown"));
        }

        match tokio::time::timeout(self.timeouts.prepare(), self.prepare()).await {
            Err(_) => return Ok(Attempt::Unready("section preparation timed out")),
            Ok(Err(e)) => {
                debug!(error = %e, "section preparation failed");
                return Ok(Attempt::Unready("section preparation failed"));
            }
            Ok(Ok(())) => {}
        }

        let mut report = FillReport::default();
        for (field, entry) in spec.entries() {
            let unfilled = self.fill_entry(field, entry).await?;
            report.record(entry.widget.kind(), unfilled);
        }

        let origin = self.driver.current_url().await?;
        let Some(button) =
            find_opt_in(self.driver, By::Css(self.locator.search_button.as_str())).await?
        else {
            return Ok(Attempt::Unready("search button missing"));
        };
        if !self
            .locator
            .click_through_popup(self.driver, &button, self.timeouts.element(), interval)
            .await?
        {
            return Ok(Attempt::Unready("search button not clickable"));
        }

        if !wait::url_changed(self.driver, &origin, self.timeouts.url_change(), interval).await {
            return Ok(Attempt::Unready("results page did not open"));
        }

        let landed = self.driver.current_url().await?;
        info!(url = %landed, "search submitted");
        Ok(Attempt::Submitted(report))
    }

    // ── Preparation ────────────────────────────────────────────────────

    /// Bring every section into a fillable state. Each pass re-reads the
    /// DOM, since the previous pass re-renders the form.
    async fn prepare(&self) -> Result<()> {
        self.uncollapse_sections().await?;
        self.click_section_links(&self.locator.show_more_text, false)
            .await?;
        self.click_section_links(&self.locator.clear_all_text, true)
            .await?;
        Ok(())
    }

    async fn uncollapse_sections(&self) -> Result<()> {
        let interval = self.timeouts.poll_interval();
        for section in self.locator.sections(self.driver).await? {
            let Some(toggle) =
                find_opt(&section.element, By::Css(self.locator.collapse_toggle.as_str())).await?
            else {
                continue;
            };
            if !has_class(&toggle, &self.locator.collapsed_class).await? {
                continue;
            }
            toggle.click().await?;
            let toggle = &toggle;
            let expanded = self.locator.expanded_class.as_str();
            let flipped = wait::poll_until(self.timeouts.element(), interval, || async move {
                Ok(has_class(toggle, expanded).await?.then_some(()))
            })
            .await;
            if flipped.is_none() {
                bail!("section '{}' did not expand", section.title.trim());
            }
        }
        Ok(())
    }

    async fn click_section_links(&self, marker: &str, helpers_only: bool) -> Result<()> {
        for section in self.locator.sections(self.driver).await? {
            for link in self
                .locator
                .links_with_text(&section.element, marker, helpers_only)
                .await?
            {
                link.click().await?;
            }
        }
        Ok(())
    }

    // ── Entries ────────────────────────────────────────────────────────

    async fn fill_entry(&self, field: &str, entry: &SearchEntry) -> Result<Vec<String>> {
        let values = &entry.values;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        debug!(field, widget = %entry.widget.kind(), count = values.len(), "filling entry");

        match entry.widget {
            Widget::FreeText => self.fill_free_text(values).await,
            Widget::Grid | Widget::List => match self.locate(field, entry).await? {
                Some((_, container)) => self.fill_checkboxes(&container, values).await,
                None => Ok(values.clone()),
            },
            Widget::DateRange { days } => match self.locate(field, entry).await? {
                Some((_, container)) => self.fill_date_range(&container, values, days).await,
                None => Ok(values.clone()),
            },
            Widget::NestedTree {
                traversal: TreeTraversal::Tree,
            } => match self.locate(field, entry).await? {
                Some((_, container)) => self.fill_tree(&container, values).await,
                None => Ok(values.clone()),
            },
            Widget::NestedTree {
                traversal: TreeTraversal::Text,
            } => match self.locate(field, entry).await? {
                Some((section, _)) => self.fill_tree_by_text(&section.element, values).await,
                None => Ok(values.clone()),
            },
        }
    }

    /// Find the section and control container for `entry`, warning when
    /// either is missing.
    async fn locate(
        &self,
        field: &str,
        entry: &SearchEntry,
    ) -> Result<Option<(FilterSection, WebElement)>> {
        let Some(name) = entry.name.as_deref() else {
            warn!(field, "entry has no section name");
            return Ok(None);
        };
        let Some(section) = self.locator.section_named(self.driver, name).await? else {
            warn!(field, section = name, "filter section not found");
            return Ok(None);
        };
        match self
            .locator
            .entry_container(&section.element, &entry.widget)
            .await?
        {
            Some(container) => Ok(Some((section, container))),
            None => {
                warn!(field, section = name, "filter section has no controls");
                Ok(None)
            }
        }
    }

    /// Tick every checkbox whose label contains one of `values`. Boxes that
    /// are already ticked are left alone.
    async fn fill_checkboxes(&self, container: &WebElement, values: &[String]) -> Result<Vec<String>> {
        let mut matched = vec![false; values.len()];
        for row in container.find_all(By::Css(self.locator.grid_row.as_str())).await? {
            for cell in row.find_all(By::Css(self.locator.grid_cell.as_str())).await? {
                let Some(label) = find_opt(&cell, By::Tag("label")).await? else {
                    continue;
                };
                let hits = matching_values(&label.text().await?, values);
                if hits.is_empty() {
                    continue;
                }
                for i in hits {
                    matched[i] = true;
                }
                let Some(checkbox) = find_opt(&cell, By::Tag("input")).await? else {
                    continue;
                };
                if !checkbox.is_selected().await? {
                    label.click().await?;
                }
            }
        }
        Ok(unmatched(values, &matched))
    }

    async fn fill_date_range(
        &self,
        container: &WebElement,
        values: &[String],
        days: u32,
    ) -> Result<Vec<String>> {
        let interval = date_interval(Local::now().date_naive(), days);
        let mut matched = vec![false; values.len()];

        let Some(row) = find_opt(container, By::Css(self.locator.grid_row.as_str())).await? else {
            return Ok(values.to_vec());
        };
        for column in row.find_all(By::Css(self.locator.date_column.as_str())).await? {
            let Some(title) =
                find_opt(&column, By::Css(self.locator.date_column_title.as_str())).await?
            else {
                continue;
            };
            let hits = matching_values(&title.text().await?, values);
            if hits.is_empty() {
                continue;
            }
            let inputs = column
                .find_all(By::Css(self.locator.date_input.as_str()))
                .await?;
            for (input, date) in inputs.iter().zip(interval) {
                input.send_keys(date.format(DATE_FORMAT).to_string()).await?;
                // The calendar pop-up would cover the controls below.
                input.send_keys(Key::Escape + "").await?;
            }
            for i in hits {
                matched[i] = true;
            }
        }
        Ok(unmatched(values, &matched))
    }

    async fn fill_tree(&self, root: &WebElement, codes: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for code in codes {
            // Clicking a checkbox re-renders the tree, so start from fresh roots.
            let roots = WebTreeNode::roots(
                root,
                &self.locator.tree_expanded_class,
                self.timeouts.element(),
                self.timeouts.poll_interval(),
            )
            .await;
            match tree::find_code(roots, code).await {
                Some(node) => node.select().await?,
                None => missing.push(code.clone()),
            }
        }
        Ok(missing)
    }

    async fn fill_tree_by_text(&self, section: &WebElement, codes: &[String]) -> Result<Vec<String>> {
        let Some(input) = find_opt(section, By::Css(self.locator.tree_search_input.as_str())).await?
        else {
            warn!("code search box not found");
            return Ok(codes.to_vec());
        };

        let driver = self.driver;
        let selector = self.locator.tree_suggestion.as_str();
        let mut missing = Vec::new();
        for code in codes {
            input.clear().await?;
            input.send_keys(code.as_str()).await?;
            let wanted = code.as_str();
            let suggestion = wait::poll_until(
                self.timeouts.element(),
                self.timeouts.poll_interval(),
                || async move {
                    for item in driver.find_all(By::Css(selector)).await? {
                        if item.text().await?.contains(wanted) {
                            return Ok(Some(item));
                        }
                    }
                    Ok(None)
                },
            )
            .await;
            match suggestion {
                Some(item) => item.click().await?,
                None => missing.push(code.clone()),
            }
        }
        Ok(missing)
    }

    /// Type each phrase into the keyword box; Enter commits a phrase.
    async fn fill_free_text(&self, phrases: &[String]) -> Result<Vec<String>> {
        let Some(input) =
            find_opt_in(self.driver, By::Css(self.locator.keyword_input.as_str())).await?
        else {
            warn!("keyword input not found");
            return Ok(phrases.to_vec());
        };
        for phrase in phrases {
            input.send_keys(phrase.as_str()).await?;
            input.send_keys(Key::Enter + "").await?;
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl FilterForm for FillEngine<'_> {
    async fn attempt(&self, spec: &SearchSpecification) -> Result<Attempt> {
        settle(self.fill_once(spec).await)
    }

    async fn reload(&self) -> Result<()> {
        self.driver.refresh().await?;
        Ok(())
    }
}
