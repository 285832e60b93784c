//! Depth-first search over the classification-code tree.
//!
//! The code tree is a collapsible hierarchy whose labels are dot/digit
//! structured codes (`10`, `10.8`, `10.86`, `10.86.10.190`, ...). The
//! search is written against the [`TreeNode`] trait so it can walk both
//! the live page ([`WebTreeNode`]) and in-memory fixtures.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::debug;

use crate::locator::has_class;
use crate::wait::{displayed_within, find_opt};

/// Final digit marking a group node that shares its length with its
/// children (`10.86.10.190` groups `10.86.10.191` ...).
const GROUP_TERMINATOR: char = '0';

/// One node of a collapsible tree.
#[async_trait]
pub trait TreeNode: Send + Sync + Sized {
    /// The node's code label. `None` marks a container without a code of
    /// its own; the search passes straight through it.
    async fn label(&self) -> Result<Option<String>>;

    /// Make the node's children visible. A leaf without a toggle is fine.
    async fn expand(&self) -> Result<()>;

    /// Direct children, empty if none appear within the wait bound.
    async fn children(&self) -> Result<Vec<Self>>;
}

/// Whether a node labelled `label` lies on the path to `code`.
pub fn label_matches(label: &str, code: &str) -> bool {
    if label.is_empty() {
        return false;
    }
    if code.starts_with(label) {
        return true;
    }
    let mut code_head = code.chars();
    code_head.next_back();
    label.chars().count() == code.chars().count()
        && label.starts_with(code_head.as_str())
        && label.ends_with(GROUP_TERMINATOR)
}

/// What inspecting one node told the search.
enum Visit<N> {
    Hit,
    Descend(Vec<N>),
    Pass,
}

async fn visit<N: TreeNode>(node: &N, code: &str) -> Result<Visit<N>> {
    node.expand().await?;
    match node.label().await? {
        Some(label) => {
            let label = label.trim();
            if label == code {
                Ok(Visit::Hit)
            } else if label_matches(label, code) {
                Ok(Visit::Descend(node.children().await?))
            } else {
                Ok(Visit::Pass)
            }
        }
        None => Ok(Visit::Descend(node.children().await?)),
    }
}

/// Find the node labelled exactly `code` among `nodes` and their
/// descendants.
///
/// Each node is expanded before it is inspected. A node whose label lies
/// on the path to `code` is descended into; if that subtree does not hold
/// the code the remaining siblings are tried. A node that cannot be read
/// closes its own branch only.
pub async fn find_code<N: TreeNode>(nodes: Vec<N>, code: &str) -> Option<N> {
    let code = code.trim();
    let mut stack: Vec<std::vec::IntoIter<N>> = vec![nodes.into_iter()];

    while let Some(level) = stack.last_mut() {
        let Some(node) = level.next() else {
            stack.pop();
            continue;
        };

        match visit(&node, code).await {
            Ok(Visit::Hit) => return Some(node),
            Ok(Visit::Descend(children)) => stack.push(children.into_iter()),
            Ok(Visit::Pass) => {}
            Err(e) => debug!(code, error = %e, "tree node unreadable, skipping branch"),
        }
    }

    None
}

/// A `<li>` of the live code tree.
#[derive(Clone)]
pub struct WebTreeNode {
    item: WebElement,
    expanded_class: String,
    wait: Duration,
    interval: Duration,
}

impl WebTreeNode {
    pub fn new(item: WebElement, expanded_class: &str, wait: Duration, interval: Duration) -> Self {
        Self {
            item,
            expanded_class: expanded_class.to_string(),
            wait,
            interval,
        }
    }

    /// Top-level items under the tree's root list.
    pub async fn roots(
        root: &WebElement,
        expanded_class: &str,
        wait: Duration,
        interval: Duration,
    ) -> Vec<Self> {
        displayed_within(root, By::XPath("./li"), wait, interval)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|item| Self::new(item, expanded_class, wait, interval))
            .collect()
    }

    /// The checkbox label to click once this node is the target.
    pub async fn select(&self) -> Result<()> {
        match find_opt(&self.item, By::XPath("./label")).await? {
            Some(label) => label.click().await?,
            None => self.item.click().await?,
        }
        Ok(())
    }
}

#[async_trait]
impl TreeNode for WebTreeNode {
    async fn label(&self) -> Result<Option<String>> {
        let Some(label) = find_opt(&self.item, By::XPath("./label")).await? else {
            return Ok(None);
        };
        match find_opt(&label, By::Tag("b")).await? {
            Some(code) => Ok(Some(code.text().await?)),
            None => Ok(None),
        }
    }

    async fn expand(&self) -> Result<()> {
        if has_class(&self.item, &self.expanded_class).await? {
            return Ok(());
        }
        if let Some(toggle) = find_opt(&self.item, By::XPath("./button")).await? {
            toggle.click().await?;
        }
        Ok(())
    }

    async fn children(&self) -> Result<Vec<Self>> {
        let Some(list) = find_opt(&self.item, By::XPath("./ul")).await? else {
            return Ok(Vec::new());
        };
        let items = displayed_within(&list, By::XPath("./li"), self.wait, self.interval)
            .await
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .map(|item| Self::new(item, &self.expanded_class, self.wait, self.interval))
            .collect())
    }
}
