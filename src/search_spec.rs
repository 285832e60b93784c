//! Typed search criteria.
//!
//! A [`SearchSpecification`] is the complete filter form for one search
//! attempt, expressed as an ordered list of named [`SearchEntry`] values.
//! Each entry carries a [`Widget`] describing which kind of UI control it
//! fills; the fill engine dispatches on that variant exhaustively.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::fmt;

use crate::models::{MatchPolicy, Regime, SearchMode};

/// How a classification code is located in the nested code tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TreeTraversal {
    /// Depth-first walk over the collapsible hierarchy.
    #[default]
    Tree,
    /// Type the code into the autocomplete box and pick a suggestion.
    Text,
}

/// The UI control an entry fills, with its widget-specific parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Widget {
    Grid,
    List,
    DateRange { days: u32 },
    NestedTree { traversal: TreeTraversal },
    FreeText,
}

/// Widget discriminant, used as the key of fill reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WidgetKind {
    Grid,
    List,
    DateRange,
    NestedTree,
    FreeText,
}

impl Widget {
    pub fn kind(&self) -> WidgetKind {
        match self {
            Widget::Grid => WidgetKind::Grid,
            Widget::List => WidgetKind::List,
            Widget::DateRange { .. } => WidgetKind::DateRange,
            Widget::NestedTree { .. } => WidgetKind::NestedTree,
            Widget::FreeText => WidgetKind::FreeText,
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WidgetKind::Grid => "grid",
            WidgetKind::List => "list",
            WidgetKind::DateRange => "date_range",
            WidgetKind::NestedTree => "nested_tree",
            WidgetKind::FreeText => "free_text",
        };
        f.write_str(name)
    }
}

/// One fillable filter criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    /// Label of the filter section this entry belongs to. `None` for the
    /// free-text keyword box, which lives outside the filter sections.
    pub name: Option<String>,
    pub widget: Widget,
    /// Checkbox labels, column titles, codes or phrases depending on `widget`.
    pub values: Vec<String>,
}

impl SearchEntry {
    pub fn new(name: Option<&str>, widget: Widget, values: Vec<String>) -> Self {
        Self {
            name: name.map(str::to_string),
            widget,
            values,
        }
    }
}

// Section titles and checkbox labels as the site renders them.
const QUICK_SETTINGS: &str = "быстрые настройки";
const TRADE_PLATFORMS: &str = "торговая площадка";
const REGULATION: &str = "закон";
const DATE_FILTERS: &str = "фильтры по датам";
const PUBLISH_DATE_COLUMN: &str = "публикации";
const CLASSIFICATION: &str = "окпд2";

const MATCH_ALL_LABEL: &str = "все слова";
const MATCH_ANY_LABEL: &str = "любое из слов";

/// Everything needed to build one filter form.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub regime: Regime,
    pub mode: Option<SearchMode>,
    pub values: Vec<String>,
    pub days: u32,
    pub match_policy: MatchPolicy,
    pub traversal: TreeTraversal,
    /// Quick-settings checkboxes ticked on every search.
    pub quick_settings: Vec<String>,
    pub trade_platforms: Vec<String>,
}

/// A complete filter form, in fill order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpecification {
    entries: Vec<(&'static str, SearchEntry)>,
}

impl SearchSpecification {
    /// Build the filter form for `request`.
    ///
    /// Fails when input values are present but no search mode says how to
    /// interpret them.
    pub fn build(request: &SearchRequest) -> Result<Self> {
        let mode = match request.mode {
            Some(mode) => Some(mode),
            None if request.values.is_empty() => None,
            None => bail!(
                "{} input values given for regime {} but no search mode is set",
                request.values.len(),
                request.regime
            ),
        };

        let mut entries = Vec::new();

        let mut quick = request.quick_settings.clone();
        if mode == Some(SearchMode::Keywords) {
            let label = match request.match_policy {
                MatchPolicy::All => MATCH_ALL_LABEL,
                MatchPolicy::Any => MATCH_ANY_LABEL,
            };
            quick.push(label.to_string());
        }
        if !quick.is_empty() {
            entries.push((
                "quick_settings",
                SearchEntry::new(Some(QUICK_SETTINGS), Widget::Grid, quick),
            ));
        }

        if !request.trade_platforms.is_empty() {
            entries.push((
                "trade_platforms",
                SearchEntry::new(
                    Some(TRADE_PLATFORMS),
                    Widget::List,
                    request.trade_platforms.clone(),
                ),
            ));
        }

        entries.push((
            "regulation",
            SearchEntry::new(
                Some(REGULATION),
                Widget::Grid,
                vec![format!("{}-фз", request.regime.code())],
            ),
        ));

        entries.push((
            "publish_date",
            SearchEntry::new(
                Some(DATE_FILTERS),
                Widget::DateRange { days: request.days },
                vec![PUBLISH_DATE_COLUMN.to_string()],
            ),
        ));

        match mode {
            Some(SearchMode::Codes) => entries.push((
                "classification",
                SearchEntry::new(
                    Some(CLASSIFICATION),
                    Widget::NestedTree {
                        traversal: request.traversal,
                    },
                    request.values.clone(),
                ),
            )),
            Some(SearchMode::Keywords) => entries.push((
                "keywords",
                SearchEntry::new(None, Widget::FreeText, request.values.clone()),
            )),
            None => {}
        }

        Ok(Self { entries })
    }

    /// Entries in fill order.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &SearchEntry)> {
        self.entries.iter().map(|(field, entry)| (*field, entry))
    }

    pub fn get(&self, field: &str) -> Option<&SearchEntry> {
        self.entries
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, entry)| entry)
    }
}
