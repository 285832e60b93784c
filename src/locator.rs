//! Site-specific element lookup.
//!
//! [`Locator`] holds every selector and marker text the engine needs to
//! find its way around the tendering site. Defaults match the live site;
//! any field can be overridden from the `[locator]` config section when
//! the markup shifts.

use serde::Deserialize;
use std::time::Duration;
use thirtyfour::prelude::*;

use crate::search_spec::Widget;
use crate::wait::{self, find_opt};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Locator {
    // Filter form
    pub loading_overlay: String,
    pub filter_root: String,
    pub section: String,
    pub section_title: String,
    pub collapse_toggle: String,
    pub expanded_class: String,
    pub collapsed_class: String,
    pub settings_row: String,
    pub helpers_class: String,
    pub show_more_text: String,
    pub clear_all_text: String,
    pub list_fold_text: String,
    pub grid_row: String,
    pub grid_cell: String,
    pub date_column: String,
    pub date_column_title: String,
    pub date_input: String,
    pub tree_root: String,
    pub tree_expanded_class: String,
    pub tree_search_input: String,
    pub tree_suggestion: String,
    pub keyword_input: String,
    pub search_button: String,

    // Result listing
    pub popup_close: String,
    pub results_container: String,
    pub result_item: String,
    pub result_link: String,
    pub pager: String,
    pub page_link: String,

    // Regime-B registry page
    pub registry_header_link: String,
    pub registry_notice_param: String,
    pub platform_file_param: String,
}

impl Default for Locator {
    fn default() -> Self {
        Self {
            loading_overlay: ".preloader, .modal-backdrop".to_string(),
            filter_root: ".modal-settings-filter__main".to_string(),
            section: ".modal-settings-section".to_string(),
            section_title: ".filter-title".to_string(),
            collapse_toggle: ".filter-title .title-collapse".to_string(),
            expanded_class: "title-collapse--more".to_string(),
            collapsed_class: "title-collapse--less".to_string(),
            settings_row: ".modal-settings-row".to_string(),
            helpers_class: "filter-helpers".to_string(),
            show_more_text: "показать еще".to_string(),
            clear_all_text: "снять всё".to_string(),
            list_fold_text: "свернуть".to_string(),
            grid_row: ".grid-row".to_string(),
            grid_cell: ".grid-column-4-1".to_string(),
            date_column: ".grid-column-2".to_string(),
            date_column_title: ".form-group__title".to_string(),
            date_input: "input.datepicker".to_string(),
            tree_root: ".settings-tree > ul".to_string(),
            tree_expanded_class: "settings-tree--show".to_string(),
            tree_search_input: ".settings-tree input[type='text']".to_string(),
            tree_suggestion: ".settings-tree__suggest li".to_string(),
            keyword_input: "input[name='keywords']".to_string(),
            search_button: ".bottomCenterSearch button".to_string(),
            popup_close: ".consultation_modal .modal-close".to_string(),
            results_container: "#content".to_string(),
            result_item: ".card-item".to_string(),
            result_link: ".card-item__about a".to_string(),
            pager: "#pager".to_string(),
            page_link: "a.page-link".to_string(),
            registry_header_link: ".registry-entry__header-top__title a, .cardMainInfo__title a"
                .to_string(),
            registry_notice_param: "noticeInfoId".to_string(),
            platform_file_param: "id".to_string(),
        }
    }
}

/// A filter section of the form together with its title text.
#[derive(Debug, Clone)]
pub struct FilterSection {
    pub element: WebElement,
    pub title: String,
}

/// Case-insensitive substring test used for every label comparison.
pub fn text_matches(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Whether an element's `class` attribute contains `class`.
pub async fn has_class(elem: &WebElement, class: &str) -> WebDriverResult<bool> {
    Ok(elem
        .attr("class")
        .await?
        .map(|classes| classes.split_whitespace().any(|c| c == class))
        .unwrap_or(false))
}

impl Locator {
    /// All filter sections currently in the DOM.
    pub async fn sections(&self, driver: &WebDriver) -> WebDriverResult<Vec<FilterSection>> {
        let Some(root) = wait::find_opt_in(driver, By::Css(self.filter_root.as_str())).await?
        else {
            return Ok(Vec::new());
        };
        let mut sections = Vec::new();
        for element in root.find_all(By::Css(self.section.as_str())).await? {
            let title = match find_opt(&element, By::Css(self.section_title.as_str())).await? {
                Some(title) => title.text().await?,
                None => String::new(),
            };
            sections.push(FilterSection { element, title });
        }
        Ok(sections)
    }

    /// First section whose title contains `name`.
    pub async fn section_named(
        &self,
        driver: &WebDriver,
        name: &str,
    ) -> WebDriverResult<Option<FilterSection>> {
        Ok(self
            .sections(driver)
            .await?
            .into_iter()
            .find(|section| text_matches(&section.title, name)))
    }

    /// Links inside `section` whose text contains `marker`.
    pub async fn links_with_text(
        &self,
        section: &WebElement,
        marker: &str,
        helpers_only: bool,
    ) -> WebDriverResult<Vec<WebElement>> {
        let mut links = Vec::new();
        for row in section.find_all(By::Css(self.settings_row.as_str())).await? {
            if helpers_only && !has_class(&row, &self.helpers_class).await? {
                continue;
            }
            for link in row.find_all(By::Tag("a")).await? {
                if text_matches(&link.text().await?, marker) {
                    links.push(link);
                }
            }
        }
        Ok(links)
    }

    /// Click `elem` once it is clickable. If a popup swallows the click,
    /// close the popup and try once more.
    ///
    /// Returns `Ok(false)` when the element never became clickable.
    pub async fn click_through_popup(
        &self,
        driver: &WebDriver,
        elem: &WebElement,
        timeout: Duration,
        interval: Duration,
    ) -> WebDriverResult<bool> {
        match wait::click_when_ready(elem, timeout, interval).await {
            Err(e) if wait::is_click_intercepted(&e) => {
                tracing::debug!("click intercepted, closing popup");
                if let Some(close) =
                    wait::find_opt_in(driver, By::Css(self.popup_close.as_str())).await?
                {
                    wait::click_when_ready(&close, timeout, interval).await?;
                }
                wait::click_when_ready(elem, timeout, interval).await
            }
            other => other,
        }
    }

    /// The element holding the controls of `widget` within `section`.
    pub async fn entry_container(
        &self,
        section: &WebElement,
        widget: &Widget,
    ) -> WebDriverResult<Option<WebElement>> {
        match widget {
            Widget::Grid | Widget::DateRange { .. } => {
                for row in section.find_all(By::Css(self.settings_row.as_str())).await? {
                    if !has_class(&row, &self.helpers_class).await? {
                        return Ok(Some(row));
                    }
                }
                Ok(None)
            }
            // List widgets wrap their checkbox grid in a foldable row.
            Widget::List => {
                for row in section.find_all(By::Css(self.settings_row.as_str())).await? {
                    let Some(link) = find_opt(&row, By::Tag("a")).await? else {
                        continue;
                    };
                    if text_matches(&link.text().await?, &self.list_fold_text) {
                        return find_opt(&row, By::Css(self.settings_row.as_str())).await;
                    }
                }
                Ok(None)
            }
            Widget::NestedTree { .. } => find_opt(section, By::Css(self.tree_root.as_str())).await,
            Widget::FreeText => Ok(None),
        }
    }
}
