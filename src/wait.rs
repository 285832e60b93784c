//! Bounded waits against a live page.
//!
//! Every wait here takes an explicit timeout and reports expiry as `None`
//! or `false` rather than as an error, so callers can tell "not there
//! (yet)" apart from a broken session. Element waits go through
//! thirtyfour's query and waiter builders; [`poll_until`] covers the
//! conditions those cannot express.

use std::future::Future;
use std::time::Duration;
use thirtyfour::error::WebDriverErrorInner;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Instant};

/// Poll `probe` every `interval` until it yields `Some`, or give up after
/// `timeout`.
///
/// Errors from the probe count as "not ready yet": a single-page app
/// routinely detaches elements while it re-renders.
pub async fn poll_until<T, F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WebDriverResult<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match probe().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => tracing::trace!(error = %e, "probe failed, retrying"),
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(interval).await;
    }
}

/// First element under `parent` matching `by`, or `None` when absent.
pub async fn find_opt(parent: &WebElement, by: By) -> WebDriverResult<Option<WebElement>> {
    parent.query(by).nowait().first_opt().await
}

/// First element in the document matching `by`, or `None` when absent.
pub async fn find_opt_in(driver: &WebDriver, by: By) -> WebDriverResult<Option<WebElement>> {
    driver.query(by).nowait().first_opt().await
}

/// Wait until `css` resolves to at least one displayed element.
pub async fn displayed(
    driver: &WebDriver,
    css: &str,
    timeout: Duration,
    interval: Duration,
) -> Option<Vec<WebElement>> {
    driver
        .query(By::Css(css))
        .wait(timeout, interval)
        .and_displayed()
        .any()
        .await
        .ok()
        .filter(|found| !found.is_empty())
}

/// Wait until displayed elements matching `by` exist under `parent`.
pub async fn displayed_within(
    parent: &WebElement,
    by: By,
    timeout: Duration,
    interval: Duration,
) -> Option<Vec<WebElement>> {
    parent
        .query(by)
        .wait(timeout, interval)
        .and_displayed()
        .any()
        .await
        .ok()
        .filter(|found| !found.is_empty())
}

/// Wait until no displayed element matches `css`.
pub async fn dismissed(driver: &WebDriver, css: &str, timeout: Duration, interval: Duration) -> bool {
    driver
        .query(By::Css(css))
        .wait(timeout, interval)
        .and_displayed()
        .not_exists()
        .await
        .unwrap_or(false)
}

/// Wait until the session's URL differs from `from`.
pub async fn url_changed(
    driver: &WebDriver,
    from: &url::Url,
    timeout: Duration,
    interval: Duration,
) -> bool {
    poll_until(timeout, interval, || async move {
        let current = driver.current_url().await?;
        Ok((current != *from).then_some(()))
    })
    .await
    .is_some()
}

/// Wait until `elem` can be clicked, then click it.
///
/// Returns `Ok(false)` if it never became clickable, and the click error
/// itself if the click was rejected.
pub async fn click_when_ready(
    elem: &WebElement,
    timeout: Duration,
    interval: Duration,
) -> WebDriverResult<bool> {
    match elem.wait_until().wait(timeout, interval).clickable().await {
        Ok(()) => {}
        Err(e) if matches!(*e, WebDriverErrorInner::Timeout(_)) => return Ok(false),
        Err(e) => return Err(e),
    }
    elem.click().await?;
    Ok(true)
}

/// Whether the WebDriver rejected a click because another element covers
/// the target.
pub fn is_click_intercepted(err: &WebDriverError) -> bool {
    matches!(**err, WebDriverErrorInner::ElementClickIntercepted(_))
}

/// Whether `err` is the page being in the way rather than the session
/// being gone. A reload usually clears these.
pub fn is_transient(err: &WebDriverError) -> bool {
    matches!(
        **err,
        WebDriverErrorInner::ElementClickIntercepted(_)
            | WebDriverErrorInner::ElementNotInteractable(_)
            | WebDriverErrorInner::StaleElementReference(_)
            | WebDriverErrorInner::NoSuchElement(_)
            | WebDriverErrorInner::InvalidElementState(_)
            | WebDriverErrorInner::MoveTargetOutOfBounds(_)
            | WebDriverErrorInner::UnexpectedAlertOpen(_)
            | WebDriverErrorInner::JavascriptError(_)
            | WebDriverErrorInner::WebDriverTimeout(_)
            | WebDriverErrorInner::Timeout(_)
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thirtyfour::error::WebDriverErrorInfo;

    pub(crate) fn intercepted() -> WebDriverError {
        WebDriverError::from_inner(WebDriverErrorInner::ElementClickIntercepted(
            WebDriverErrorInfo::new("element click intercepted".to_string()),
        ))
    }

    pub(crate) fn session_gone() -> WebDriverError {
        WebDriverError::from_inner(WebDriverErrorInner::FatalError(
            "session deleted".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_ready_value() {
        let calls = AtomicU32::new(0);
        let result = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n >= 2).then_some(n)) }
        })
        .await;
        assert_eq!(result, Some(2));
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let result: Option<()> =
            poll_until(Duration::from_millis(20), Duration::from_millis(5), || async {
                Ok(None)
            })
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_poll_until_treats_errors_as_not_ready() {
        let calls = AtomicU32::new(0);
        let result = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(intercepted())
                } else {
                    Ok(Some(n))
                }
            }
        })
        .await;
        assert_eq!(result, Some(1));
    }

    #[test]
    fn test_click_intercepted_is_detected_by_kind() {
        assert!(is_click_intercepted(&intercepted()));
        assert!(!is_click_intercepted(&session_gone()));
        let stale = WebDriverError::from_inner(WebDriverErrorInner::StaleElementReference(
            WebDriverErrorInfo::new("element click intercepted".to_string()),
        ));
        assert!(!is_click_intercepted(&stale));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&intercepted()));
        assert!(is_transient(&WebDriverError::from_inner(
            WebDriverErrorInner::StaleElementReference(WebDriverErrorInfo::new(
                "stale element reference".to_string()
            ))
        )));
        assert!(!is_transient(&session_gone()));
        assert!(!is_transient(&WebDriverError::from_inner(
            WebDriverErrorInner::RequestFailed("connection refused".to_string())
        )));
    }
}
