//! Typed GitHub webhook events.
//!
//! Raw payloads are classified by the `X-GitHub-Event` header name plus the
//! payload's `action` field. Unknown types classify as [`GithubEvent::Unhandled`]
//! and are acknowledged without processing; recognized types with missing
//! required entities fail loudly.

use serde_json::Value;

use crate::error::{ShopError, ShopResult};

/// Label that marks an issue as an order issue.
pub const ORDER_ISSUE_LABEL: &str = "order";

/// Marker token in the issue body that also qualifies an issue as an order
/// issue (issue forms embed it in a hidden comment).
pub const ORDER_ISSUE_MARKER: &str = "<!-- gitshop:order -->";

#[derive(Debug, Clone)]
pub struct IssueOpened {
    pub installation_id: i64,
    pub repo_full_name: String,
    pub owner_login: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_body: String,
    pub author_login: String,
    pub labels: Vec<String>,
}

impl IssueOpened {
    /// The order-issue predicate: labeled `order` OR body carries the marker.
    pub fn is_order_issue(&self) -> bool {
        self.labels.iter().any(|l| l == ORDER_ISSUE_LABEL)
            || self.issue_body.contains(ORDER_ISSUE_MARKER)
    }
}

#[derive(Debug, Clone)]
pub struct IssueComment {
    pub installation_id: i64,
    pub repo_full_name: String,
    pub issue_number: i64,
    pub issue_author_login: String,
    pub comment_body: String,
    pub commenter_login: String,
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub repo_full_name: String,
    /// Paths added or modified across all commits in the push.
    pub changed_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InstallationEvent {
    pub action: String,
    pub installation_id: i64,
    pub account_login: String,
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InstallationRepositoriesEvent {
    pub installation_id: i64,
    pub account_login: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum GithubEvent {
    IssueOpened(IssueOpened),
    IssueComment(IssueComment),
    Push(PushEvent),
    Installation(InstallationEvent),
    InstallationRepositories(InstallationRepositoriesEvent),
    Unhandled {
        event: String,
        action: Option<String>,
    },
}

impl GithubEvent {
    /// Classify a raw payload by event name and action.
    pub fn classify(event_name: &str, payload: &Value) -> ShopResult<GithubEvent> {
        let action = payload.get("action").and_then(Value::as_str);
        match (event_name, action) {
            ("issues", Some("opened")) => Ok(GithubEvent::IssueOpened(issue_opened(payload)?)),
            ("issue_comment", Some("created")) => {
                Ok(GithubEvent::IssueComment(issue_comment(payload)?))
            }
            ("push", _) => Ok(GithubEvent::Push(push(payload)?)),
            ("installation", Some(_)) => Ok(GithubEvent::Installation(installation(payload)?)),
            ("installation_repositories", Some(_)) => Ok(GithubEvent::InstallationRepositories(
                installation_repositories(payload)?,
            )),
            _ => Ok(GithubEvent::Unhandled {
                event: event_name.to_string(),
                action: action.map(str::to_string),
            }),
        }
    }
}

fn required_str<'a>(payload: &'a Value, pointer: &str) -> ShopResult<&'a str> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| ShopError::MalformedEvent(format!("missing field {pointer}")))
}

fn required_i64(payload: &Value, pointer: &str) -> ShopResult<i64> {
    payload
        .pointer(pointer)
        .and_then(Value::as_i64)
        .ok_or_else(|| ShopError::MalformedEvent(format!("missing field {pointer}")))
}

fn issue_opened(payload: &Value) -> ShopResult<IssueOpened> {
    let labels = payload
        .pointer("/issue/labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(IssueOpened {
        installation_id: required_i64(payload, "/installation/id")?,
        repo_full_name: required_str(payload, "/repository/full_name")?.to_string(),
        owner_login: required_str(payload, "/repository/owner/login")?.to_string(),
        issue_number: required_i64(payload, "/issue/number")?,
        issue_title: payload
            .pointer("/issue/title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        issue_body: payload
            .pointer("/issue/body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author_login: required_str(payload, "/issue/user/login")?.to_string(),
        labels,
    })
}

fn issue_comment(payload: &Value) -> ShopResult<IssueComment> {
    Ok(IssueComment {
        installation_id: required_i64(payload, "/installation/id")?,
        repo_full_name: required_str(payload, "/repository/full_name")?.to_string(),
        issue_number: required_i64(payload, "/issue/number")?,
        issue_author_login: required_str(payload, "/issue/user/login")?.to_string(),
        comment_body: required_str(payload, "/comment/body")?.to_string(),
        commenter_login: required_str(payload, "/comment/user/login")?.to_string(),
    })
}

fn push(payload: &Value) -> ShopResult<PushEvent> {
    let mut changed_paths = Vec::new();
    if let Some(commits) = payload.get("commits").and_then(Value::as_array) {
        for commit in commits {
            for key in ["added", "modified"] {
                if let Some(paths) = commit.get(key).and_then(Value::as_array) {
                    changed_paths.extend(
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    );
                }
            }
        }
    }
    Ok(PushEvent {
        repo_full_name: required_str(payload, "/repository/full_name")?.to_string(),
        changed_paths,
    })
}

fn installation(payload: &Value) -> ShopResult<InstallationEvent> {
    let repositories = payload
        .get("repositories")
        .and_then(Value::as_array)
        .map(|repos| {
            repos
                .iter()
                .filter_map(|r| r.get("full_name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(InstallationEvent {
        action: required_str(payload, "/action")?.to_string(),
        installation_id: required_i64(payload, "/installation/id")?,
        account_login: required_str(payload, "/installation/account/login")?.to_string(),
        repositories,
    })
}

fn installation_repositories(payload: &Value) -> ShopResult<InstallationRepositoriesEvent> {
    let names = |key: &str| -> Vec<String> {
        payload
            .get(key)
            .and_then(Value::as_array)
            .map(|repos| {
                repos
                    .iter()
                    .filter_map(|r| r.get("full_name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(InstallationRepositoriesEvent {
        installation_id: required_i64(payload, "/installation/id")?,
        account_login: required_str(payload, "/installation/account/login")?.to_string(),
        added: names("repositories_added"),
        removed: names("repositories_removed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue_payload(labels: &[&str], body: &str) -> Value {
        json!({
            "action": "opened",
            "installation": {"id": 42},
            "repository": {"full_name": "octocat/shop", "owner": {"login": "octocat"}},
            "issue": {
                "number": 7,
                "title": "Order: coffee",
                "body": body,
                "user": {"login": "buyer"},
                "labels": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
            }
        })
    }

    #[test]
    fn classifies_issue_opened() {
        let event = GithubEvent::classify("issues", &issue_payload(&["order"], "SKU:A")).unwrap();
        match event {
            GithubEvent::IssueOpened(ev) => {
                assert_eq!(ev.issue_number, 7);
                assert_eq!(ev.repo_full_name, "octocat/shop");
                assert!(ev.is_order_issue());
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn order_issue_predicate_label_or_marker() {
        let by_label = issue_opened(&issue_payload(&["order"], "no marker")).unwrap();
        assert!(by_label.is_order_issue());

        let by_marker =
            issue_opened(&issue_payload(&[], "<!-- gitshop:order -->\nSKU:A")).unwrap();
        assert!(by_marker.is_order_issue());

        let neither = issue_opened(&issue_payload(&["bug"], "just a bug report")).unwrap();
        assert!(!neither.is_order_issue());
    }

    #[test]
    fn unknown_event_is_unhandled_not_error() {
        let event = GithubEvent::classify("watch", &json!({"action": "started"})).unwrap();
        assert!(matches!(event, GithubEvent::Unhandled { .. }));

        let edited = GithubEvent::classify("issues", &issue_payload(&["order"], "x"));
        // action mismatch also lands in Unhandled
        let edited_payload = json!({"action": "edited"});
        assert!(matches!(
            GithubEvent::classify("issues", &edited_payload).unwrap(),
            GithubEvent::Unhandled { .. }
        ));
        assert!(edited.is_ok());
    }

    #[test]
    fn missing_required_fields_fail_loudly() {
        let payload = json!({
            "action": "opened",
            "repository": {"full_name": "octocat/shop", "owner": {"login": "octocat"}},
            "issue": {"number": 7, "user": {"login": "buyer"}}
        });
        let err = GithubEvent::classify("issues", &payload).unwrap_err();
        assert!(matches!(err, ShopError::MalformedEvent(_)));
    }

    #[test]
    fn push_collects_added_and_modified_paths() {
        let payload = json!({
            "repository": {"full_name": "octocat/shop"},
            "commits": [
                {"added": ["gitshop.json"], "modified": [], "removed": ["old.txt"]},
                {"added": [], "modified": ["README.md"]}
            ]
        });
        match GithubEvent::classify("push", &payload).unwrap() {
            GithubEvent::Push(ev) => {
                assert_eq!(ev.changed_paths, vec!["gitshop.json", "README.md"]);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn installation_repositories_split_added_removed() {
        let payload = json!({
            "action": "added",
            "installation": {"id": 42, "account": {"login": "octocat"}},
            "repositories_added": [{"full_name": "octocat/shop"}],
            "repositories_removed": [{"full_name": "octocat/old-shop"}]
        });
        match GithubEvent::classify("installation_repositories", &payload).unwrap() {
            GithubEvent::InstallationRepositories(ev) => {
                assert_eq!(ev.added, vec!["octocat/shop"]);
                assert_eq!(ev.removed, vec!["octocat/old-shop"]);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
