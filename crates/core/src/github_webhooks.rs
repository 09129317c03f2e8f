//! GitHub event router.
//!
//! Deduplicates by delivery id, classifies the payload, and dispatches to
//! the lifecycle engine or the shop store. The dedupe mark is written only
//! after the handler succeeds, so a failed handler is re-run when GitHub
//! redelivers.

use std::sync::Arc;

use serde_json::Value;

use crate::catalog::DEFAULT_CATALOG_PATH;
use crate::engine::OrderEngine;
use crate::error::{ShopError, ShopResult};
use crate::github_events::GithubEvent;
use crate::idempotency::{EventSource, IdempotencyGate};
use crate::store::ShopStore;

/// Comment command that requests a fresh payment link.
pub const RETRY_COMMAND: &str = ".gitshop retry";

/// True when any line of the comment is exactly the retry command.
pub fn is_retry_command(body: &str) -> bool {
    body.lines()
        .any(|line| line.trim().eq_ignore_ascii_case(RETRY_COMMAND))
}

pub struct GithubRouter {
    gate: Arc<dyn IdempotencyGate>,
    shops: Arc<dyn ShopStore>,
    engine: Arc<OrderEngine>,
    catalog_path: String,
}

impl GithubRouter {
    pub fn new(
        gate: Arc<dyn IdempotencyGate>,
        shops: Arc<dyn ShopStore>,
        engine: Arc<OrderEngine>,
        catalog_path: Option<String>,
    ) -> Self {
        Self {
            gate,
            shops,
            engine,
            catalog_path: catalog_path.unwrap_or_else(|| DEFAULT_CATALOG_PATH.to_string()),
        }
    }

    /// Handle one verified GitHub webhook delivery.
    pub async fn handle(
        &self,
        event_name: &str,
        delivery_id: &str,
        payload: &[u8],
    ) -> ShopResult<()> {
        if delivery_id.is_empty() {
            return Err(ShopError::MalformedEvent(
                "delivery has no delivery id".to_string(),
            ));
        }
        let payload: Value = serde_json::from_slice(payload)
            .map_err(|e| ShopError::MalformedEvent(format!("github event: {e}")))?;

        if self.gate.seen(EventSource::GitHub, delivery_id).await? {
            tracing::info!(
                delivery_id = %delivery_id,
                event = %event_name,
                "Duplicate GitHub delivery, already processed"
            );
            return Ok(());
        }

        match GithubEvent::classify(event_name, &payload)? {
            GithubEvent::IssueOpened(ev) => {
                if ev.is_order_issue() {
                    self.engine.intake(&ev).await?;
                } else {
                    tracing::debug!(
                        repo = %ev.repo_full_name,
                        issue = ev.issue_number,
                        "Issue opened is not an order issue"
                    );
                }
            }
            GithubEvent::IssueComment(ev) => {
                // Bot comments (including our own) never carry commands.
                if !ev.commenter_login.ends_with("[bot]") && is_retry_command(&ev.comment_body) {
                    self.engine.retry_payment(&ev).await?;
                }
            }
            GithubEvent::Push(ev) => {
                if ev.changed_paths.iter().any(|p| p == &self.catalog_path) {
                    // The catalog is loaded fresh on every order, so a push
                    // only needs to be noted.
                    tracing::info!(
                        repo = %ev.repo_full_name,
                        path = %self.catalog_path,
                        "Catalog file changed"
                    );
                }
            }
            GithubEvent::Installation(ev) => match ev.action.as_str() {
                "created" | "unsuspend" => {
                    for repo in &ev.repositories {
                        let shop = self
                            .shops
                            .connect_repo(ev.installation_id, repo, &ev.account_login)
                            .await?;
                        tracing::info!(
                            shop_id = %shop.id,
                            repo = %repo,
                            installation_id = ev.installation_id,
                            "Shop connected"
                        );
                    }
                }
                "deleted" | "suspend" => {
                    let count = self.shops.disconnect_installation(ev.installation_id).await?;
                    tracing::info!(
                        installation_id = ev.installation_id,
                        shops = count,
                        "Installation removed, shops disconnected"
                    );
                }
                other => {
                    tracing::debug!(action = %other, "Ignoring installation action");
                }
            },
            GithubEvent::InstallationRepositories(ev) => {
                for repo in &ev.added {
                    let shop = self
                        .shops
                        .connect_repo(ev.installation_id, repo, &ev.account_login)
                        .await?;
                    tracing::info!(shop_id = %shop.id, repo = %repo, "Shop connected");
                }
                for repo in &ev.removed {
                    self.shops
                        .disconnect_repo(ev.installation_id, repo)
                        .await?;
                    tracing::info!(repo = %repo, "Shop disconnected");
                }
            }
            GithubEvent::Unhandled { event, action } => {
                tracing::debug!(
                    event = %event,
                    action = ?action,
                    "Received unhandled GitHub event - no handler configured"
                );
            }
        }

        self.gate
            .mark_processed(EventSource::GitHub, delivery_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_command_matches_exact_line() {
        assert!(is_retry_command(".gitshop retry"));
        assert!(is_retry_command("  .gitshop retry  "));
        assert!(is_retry_command("please!\n.gitshop retry\nthanks"));
        assert!(is_retry_command(".GitShop Retry"));

        assert!(!is_retry_command("run .gitshop retry for me"));
        assert!(!is_retry_command(".gitshop retryy"));
        assert!(!is_retry_command("retry"));
    }
}
