use fantoccini::{Client, Locator, elements::Element, error::CmdError, wd::WindowHandle};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use super::Portal;
use crate::{
    config::BrowserSettings, constants::EPAC_PRIVATE_APP_URL, credentials::Credential,
    error::PortalError, pacing::Pacing, phone::extract_phone,
};

const USERNAME_INPUT: &str = r#"input[name="username"]"#;
const PASSWORD_INPUT: &str = r#"input[name="password"]"#;
const LOGIN_SUBMIT: &str = r#"button[type="submit"]"#;
const APP_FRAME: &str = "iframe[name='appArea']";
const CLAIM_INPUT: &str = "#claimNumber";
const RESULT_TABLE: &str = "#ordersList_tbody";
const RESULT_ROWS: &str = "#ordersList_tbody tr.table-row";
const SEND_BUTTON: &str = "//div[contains(concat(' ', normalize-space(@class), ' '), ' sectionButton ') and contains(normalize-space(.), 'Enviar')]";

const MENU_APPLICATIONS: &str = "Aplic. Allianz";
const MENU_SEARCH_FORM: &str = "Informe Pericial Diversos SEA";
const TREE_SECTION: &str = "HSC y FP";
const TREE_CLAIM_FILE: &str = "Ficha peritación";
const BACK_TO_SEARCH: &str = "Volver a búsqueda";

// Messages the portal renders inside the result table when a search matches nothing.
const EMPTY_RESULT_MARKERS: [&str; 4] = [
    "no se han encontrado",
    "no hay resultados",
    "sin resultados",
    "no existen registros",
];

const POLL_INTERVAL: Duration = Duration::from_millis(400);
const CLAIM_TEXT_ATTEMPTS: u32 = 3;
const MIN_CLAIM_TEXT_LEN: usize = 800;

// Finds the element holding the claim file body; falls back to the frame text.
const CLAIM_TEXT_SCRIPT: &str = r#"
const needles = ["SINIESTROS", "PERITAJE", "TELEF-1", "TELEF-2"];
const root = document.body;
if (!root) { return ""; }
const walker = document.createTreeWalker(root, NodeFilter.SHOW_ELEMENT);
while (walker.nextNode()) {
    const text = (walker.currentNode.textContent || "").trim();
    const upper = text.toUpperCase();
    let score = 0;
    for (const needle of needles) { if (upper.includes(needle)) { score++; } }
    if (score >= 2 && text.length > 800) { return text; }
}
return (root.innerText || "").trim();
"#;

fn menu_item_xpath(label: &str) -> String {
    format!("//*[@role='menuitem' and normalize-space(.)='{label}']")
}

fn tree_node_xpath(label: &str) -> String {
    format!(
        "//div[contains(concat(' ', normalize-space(@class), ' '), ' divOptionTreeMenu ') and contains(normalize-space(.), '{label}')]"
    )
}

fn button_xpath(label: &str) -> String {
    format!("//*[(self::button or self::a or @role='button') and contains(normalize-space(.), '{label}')]")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultsState {
    Rows,
    Empty,
    Loading,
}

fn results_state(row_count: usize, table_text: &str) -> ResultsState {
    if row_count > 0 {
        return ResultsState::Rows;
    }
    let text = table_text.to_lowercase();
    if EMPTY_RESULT_MARKERS.iter().any(|marker| text.contains(marker)) {
        ResultsState::Empty
    } else {
        ResultsState::Loading
    }
}

#[derive(Debug, Clone, Copy)]
enum Budget {
    Navigation,
    Submission,
}

/// ePAC session on top of one WebDriver client.
///
/// The search form and the claim file both live inside the `appArea` iframe;
/// menus live in the top-level document. The claim file may open in its own
/// window, which `return_to_search` closes again.
pub struct EpacPortal {
    client: Client,
    pacing: Pacing,
    navigation_timeout: Duration,
    submission_timeout: Duration,
    keep_open: bool,
    main_window: Option<WindowHandle>,
    claim_window_open: bool,
    on_search_form: bool,
}

impl EpacPortal {
    pub fn new(client: Client, settings: &BrowserSettings) -> Self {
        Self {
            client,
            pacing: Pacing::from_settings(settings),
            navigation_timeout: settings.navigation_timeout,
            submission_timeout: settings.submission_timeout,
            keep_open: settings.keep_open,
            main_window: None,
            claim_window_open: false,
            on_search_form: false,
        }
    }

    fn timeout_error(&self, step: &'static str, budget: Budget) -> PortalError {
        match budget {
            Budget::Navigation => PortalError::NavigationTimeout {
                step,
                budget: self.navigation_timeout,
            },
            Budget::Submission => PortalError::SubmissionTimeout {
                step,
                budget: self.submission_timeout,
            },
        }
    }

    async fn wait_for(
        &self,
        locator: Locator<'_>,
        step: &'static str,
        budget: Budget,
    ) -> Result<Element, PortalError> {
        let limit = match budget {
            Budget::Navigation => self.navigation_timeout,
            Budget::Submission => self.submission_timeout,
        };
        match self.client.wait().at_most(limit).for_element(locator).await {
            Ok(element) => Ok(element),
            Err(CmdError::WaitTimeout) => Err(self.timeout_error(step, budget)),
            Err(err) => Err(err.into()),
        }
    }

    async fn navigate(&self, url: &str, step: &'static str) -> Result<(), PortalError> {
        tracing::debug!(target: "portal_epac", step, "Navigating to {url}");
        match tokio::time::timeout(self.navigation_timeout, self.client.goto(url)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timeout_error(step, Budget::Navigation)),
        }
    }

    async fn fill(&self, element: &Element, value: &str) -> Result<(), PortalError> {
        element.click().await?;
        element.clear().await?;
        element.send_keys(value).await?;
        Ok(())
    }

    async fn enter_app_frame(&self, step: &'static str) -> Result<(), PortalError> {
        self.client.enter_frame(None).await?;
        let frame = self
            .wait_for(Locator::Css(APP_FRAME), step, Budget::Navigation)
            .await?;
        frame.enter_frame().await?;
        Ok(())
    }

    async fn try_login(&mut self, credential: &Credential) -> Result<(), PortalError> {
        self.navigate(&credential.portal_url, "open login page").await?;

        let username = self
            .wait_for(Locator::Css(USERNAME_INPUT), "login form", Budget::Navigation)
            .await?;
        self.fill(&username, &credential.username).await?;
        self.pacing.pause("username entered").await;

        let password = self.client.find(Locator::Css(PASSWORD_INPUT)).await?;
        self.fill(&password, &credential.password).await?;
        self.pacing.pause("password entered").await;

        self.client
            .find(Locator::Css(LOGIN_SUBMIT))
            .await?
            .click()
            .await?;

        let menu = menu_item_xpath(MENU_APPLICATIONS);
        self.wait_for(Locator::XPath(&menu), "post-login menu", Budget::Submission)
            .await?;
        self.main_window = Some(self.client.window().await?);
        Ok(())
    }

    /// Walks the top menu down to the claim search form.
    async fn open_search_form(&mut self) -> Result<(), PortalError> {
        self.client.enter_frame(None).await?;
        for label in [MENU_APPLICATIONS, MENU_SEARCH_FORM] {
            let xpath = menu_item_xpath(label);
            let item = self
                .wait_for(Locator::XPath(&xpath), "open search menu", Budget::Navigation)
                .await?;
            item.click().await?;
            self.pacing.pause(label).await;
        }
        self.enter_app_frame("search frame").await?;
        self.wait_for(Locator::Css(CLAIM_INPUT), "search form", Budget::Navigation)
            .await?;
        self.on_search_form = true;
        Ok(())
    }

    /// Polls the result table until rows or an empty-results message show up.
    /// `Ok(None)` only for the explicit empty state; a table that stays blank
    /// past `deadline` is a submission timeout.
    async fn result_rows(&self, deadline: Instant) -> Result<Option<Vec<Element>>, PortalError> {
        loop {
            let rows = self.client.find_all(Locator::Css(RESULT_ROWS)).await?;
            let table_text = if rows.is_empty() {
                self.client.find(Locator::Css(RESULT_TABLE)).await?.text().await?
            } else {
                String::new()
            };
            match results_state(rows.len(), &table_text) {
                ResultsState::Rows => return Ok(Some(rows)),
                ResultsState::Empty => return Ok(None),
                ResultsState::Loading if Instant::now() >= deadline => {
                    return Err(self.timeout_error("search results", Budget::Submission));
                }
                ResultsState::Loading => sleep(POLL_INTERVAL).await,
            }
        }
    }

    async fn switch_to_claim_window(&mut self, windows_before: usize) -> Result<(), PortalError> {
        let windows = self.client.windows().await?;
        if windows.len() <= windows_before {
            return Ok(());
        }
        let newest = windows
            .into_iter()
            .rev()
            .find(|handle| Some(handle) != self.main_window.as_ref());
        if let Some(handle) = newest {
            tracing::debug!(target: "portal_epac", "Claim file opened in a new window");
            self.client.switch_to_window(handle).await?;
            self.claim_window_open = true;
        }
        Ok(())
    }

    async fn claim_file_text(&self) -> Result<String, PortalError> {
        self.enter_app_frame("claim file frame").await?;
        self.wait_for(Locator::Css("body"), "claim file body", Budget::Navigation)
            .await?;

        let mut text = String::new();
        for attempt in 1..=CLAIM_TEXT_ATTEMPTS {
            let value = self.client.execute(CLAIM_TEXT_SCRIPT, Vec::new()).await?;
            text = value.as_str().unwrap_or_default().to_string();
            if text.chars().count() > MIN_CLAIM_TEXT_LEN {
                break;
            }
            tracing::debug!(target: "portal_epac", attempt, len = text.len(), "Claim file text still short");
            sleep(POLL_INTERVAL).await;
        }
        Ok(text)
    }

    async fn close_claim_window(&mut self) -> Result<(), PortalError> {
        if !self.claim_window_open {
            return Ok(());
        }
        self.client.close_window().await?;
        self.claim_window_open = false;
        if let Some(main) = self.main_window.clone() {
            self.client.switch_to_window(main).await?;
        }
        Ok(())
    }

    async fn click_back_button(&self) -> Result<bool, PortalError> {
        self.enter_app_frame("claim view frame").await?;
        let xpath = button_xpath(BACK_TO_SEARCH);
        let Some(button) = self
            .client
            .find_all(Locator::XPath(&xpath))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(false);
        };
        button.click().await?;
        self.pacing.pause(BACK_TO_SEARCH).await;
        Ok(true)
    }
}

impl Portal for EpacPortal {
    type Hit = Element;

    async fn login(&mut self, credential: &Credential) -> Result<(), PortalError> {
        tracing::info!(
            target: "portal_epac",
            url = %credential.portal_url,
            user = %credential.username,
            "Logging in to ePAC"
        );
        self.on_search_form = false;
        self.try_login(credential).await.map_err(|err| match err {
            PortalError::Login(_) => err,
            other => PortalError::Login(other.to_string()),
        })?;
        tracing::info!(target: "portal_epac", "Login completed");
        Ok(())
    }

    async fn search(&mut self, claim_id: &str) -> Result<Element, PortalError> {
        if self.on_search_form {
            self.enter_app_frame("search frame").await?;
        } else {
            self.open_search_form().await?;
        }

        let input = self
            .wait_for(Locator::Css(CLAIM_INPUT), "search form", Budget::Navigation)
            .await?;
        self.fill(&input, claim_id).await?;
        self.pacing.pause("claim id entered").await;

        self.client
            .find(Locator::XPath(SEND_BUTTON))
            .await?
            .click()
            .await?;
        self.on_search_form = false;
        let deadline = Instant::now() + self.submission_timeout;
        self.pacing.pause("claim id submitted").await;

        self.wait_for(Locator::Css(RESULT_TABLE), "search results", Budget::Submission)
            .await?;
        let Some(rows) = self.result_rows(deadline).await? else {
            tracing::debug!(target: "portal_epac", claim_id, "Portal reported no results");
            return Err(PortalError::NotFound {
                claim_id: claim_id.to_string(),
            });
        };
        for row in rows {
            if row.text().await?.contains(claim_id) {
                return Ok(row);
            }
        }
        Err(PortalError::NotFound {
            claim_id: claim_id.to_string(),
        })
    }

    async fn read_phone(&mut self, row: Element) -> Result<Option<String>, PortalError> {
        let windows_before = self.client.windows().await?.len();
        row.click().await?;
        self.pacing.pause("result row selected").await;

        for label in [TREE_SECTION, TREE_CLAIM_FILE] {
            self.enter_app_frame("claim view frame").await?;
            let xpath = tree_node_xpath(label);
            let node = self
                .wait_for(Locator::XPath(&xpath), "claim side menu", Budget::Navigation)
                .await?;
            node.click().await?;
            self.pacing.pause(label).await;
        }

        self.switch_to_claim_window(windows_before).await?;
        let text = self.claim_file_text().await?;
        if text.is_empty() {
            return Err(PortalError::Page("claim file rendered no text".to_string()));
        }
        Ok(extract_phone(&text))
    }

    async fn return_to_search(&mut self) -> Result<(), PortalError> {
        self.close_claim_window().await?;

        if self.click_back_button().await? {
            self.wait_for(Locator::Css(CLAIM_INPUT), "search form", Budget::Navigation)
                .await?;
            self.on_search_form = true;
            return Ok(());
        }

        tracing::debug!(target: "portal_epac", "No back button; reopening the search form from the menu");
        self.on_search_form = false;
        self.navigate(EPAC_PRIVATE_APP_URL, "reload private app").await?;
        self.open_search_form().await
    }

    async fn close(self) -> Result<(), PortalError> {
        if self.keep_open {
            self.client.persist().await?;
            tracing::info!(target: "portal_epac", "Leaving the browser session open");
            return Ok(());
        }
        self.client.close().await?;
        tracing::info!(target: "portal_epac", "Browser session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_items_match_exact_label() {
        assert_eq!(
            menu_item_xpath(MENU_APPLICATIONS),
            "//*[@role='menuitem' and normalize-space(.)='Aplic. Allianz']"
        );
    }

    #[test]
    fn tree_nodes_match_by_class_token() {
        let xpath = tree_node_xpath(TREE_CLAIM_FILE);
        assert!(xpath.contains("' divOptionTreeMenu '"));
        assert!(xpath.contains("'Ficha peritación'"));
    }

    #[test]
    fn rendered_rows_settle_the_search() {
        assert_eq!(results_state(2, ""), ResultsState::Rows);
        assert_eq!(results_state(1, "No se han encontrado resultados"), ResultsState::Rows);
    }

    #[test]
    fn blank_table_keeps_waiting_until_the_portal_says_empty() {
        assert_eq!(results_state(0, ""), ResultsState::Loading);
        assert_eq!(results_state(0, "   Cargando...  "), ResultsState::Loading);
        assert_eq!(
            results_state(0, "NO SE HAN ENCONTRADO REGISTROS"),
            ResultsState::Empty
        );
        assert_eq!(results_state(0, "Sin resultados"), ResultsState::Empty);
    }

    #[test]
    fn back_button_matches_buttons_and_links() {
        let xpath = button_xpath(BACK_TO_SEARCH);
        assert!(xpath.starts_with("//*[(self::button or self::a"));
        assert!(xpath.ends_with("'Volver a búsqueda')]"));
    }
}
