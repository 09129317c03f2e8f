//! GitHub REST client.
//!
//! The engine only depends on the [`CodeHostClient`] trait; [`GithubClient`]
//! is the concrete implementation over the GitHub REST API, authenticated as
//! the app installation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ShopError, ShopResult};

/// Repository permission level of a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Admin,
    Maintain,
    Write,
    Triage,
    Read,
    None,
}

impl Permission {
    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => Permission::Admin,
            "maintain" => Permission::Maintain,
            "write" => Permission::Write,
            "triage" => Permission::Triage,
            "read" => Permission::Read,
            _ => Permission::None,
        }
    }

    /// Write-or-above, the bar for privileged order commands.
    pub fn can_push(&self) -> bool {
        matches!(self, Permission::Admin | Permission::Maintain | Permission::Write)
    }
}

/// An existing issue comment, as returned by the list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentRecord {
    pub id: i64,
    pub body: String,
    #[serde(rename = "user")]
    pub author: CommentAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentAuthor {
    pub login: String,
}

#[async_trait]
pub trait CodeHostClient: Send + Sync {
    async fn create_comment(&self, repo: &str, issue: i64, body: &str) -> ShopResult<()>;
    async fn add_labels(&self, repo: &str, issue: i64, labels: &[&str]) -> ShopResult<()>;
    /// Removing a label that is already gone is not an error.
    async fn remove_label(&self, repo: &str, issue: i64, label: &str) -> ShopResult<()>;
    async fn list_comments(&self, repo: &str, issue: i64) -> ShopResult<Vec<IssueCommentRecord>>;
    async fn delete_comment(&self, repo: &str, comment_id: i64) -> ShopResult<()>;
    /// Returns the new issue number.
    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        assignees: &[&str],
    ) -> ShopResult<i64>;
    async fn check_permission(&self, repo: &str, login: &str) -> ShopResult<Permission>;
    async fn get_file(&self, repo: &str, path: &str) -> ShopResult<Vec<u8>>;
}

/// GitHub REST implementation of [`CodeHostClient`].
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, "https://api.github.com")
    }

    /// Custom base URL, for GitHub Enterprise and tests.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "gitshop")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> ShopResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ShopError::CodeHost(format!("{what}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShopError::CodeHost(format!("{what}: {status} {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl CodeHostClient for GithubClient {
    async fn create_comment(&self, repo: &str, issue: i64, body: &str) -> ShopResult<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{issue}/comments"),
            )
            .json(&json!({ "body": body }));
        self.send(builder, "create comment").await?;
        Ok(())
    }

    async fn add_labels(&self, repo: &str, issue: i64, labels: &[&str]) -> ShopResult<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{issue}/labels"),
            )
            .json(&json!({ "labels": labels }));
        self.send(builder, "add labels").await?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue: i64, label: &str) -> ShopResult<()> {
        let builder = self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{repo}/issues/{issue}/labels/{label}"),
        );
        let response = builder
            .send()
            .await
            .map_err(|e| ShopError::CodeHost(format!("remove label: {e}")))?;
        // 404 means the label was never there; redelivered side effects hit this.
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ShopError::CodeHost(format!("remove label: {status} {body}")));
        }
        Ok(())
    }

    async fn list_comments(&self, repo: &str, issue: i64) -> ShopResult<Vec<IssueCommentRecord>> {
        let builder = self.request(
            reqwest::Method::GET,
            &format!("/repos/{repo}/issues/{issue}/comments?per_page=100"),
        );
        let response = self.send(builder, "list comments").await?;
        response
            .json()
            .await
            .map_err(|e| ShopError::CodeHost(format!("list comments: {e}")))
    }

    async fn delete_comment(&self, repo: &str, comment_id: i64) -> ShopResult<()> {
        let builder = self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{repo}/issues/comments/{comment_id}"),
        );
        self.send(builder, "delete comment").await?;
        Ok(())
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        assignees: &[&str],
    ) -> ShopResult<i64> {
        #[derive(Deserialize)]
        struct CreatedIssue {
            number: i64,
        }

        let builder = self
            .request(reqwest::Method::POST, &format!("/repos/{repo}/issues"))
            .json(&json!({ "title": title, "body": body, "assignees": assignees }));
        let response = self.send(builder, "create issue").await?;
        let created: CreatedIssue = response
            .json()
            .await
            .map_err(|e| ShopError::CodeHost(format!("create issue: {e}")))?;
        Ok(created.number)
    }

    async fn check_permission(&self, repo: &str, login: &str) -> ShopResult<Permission> {
        #[derive(Deserialize)]
        struct PermissionResponse {
            permission: String,
        }

        let builder = self.request(
            reqwest::Method::GET,
            &format!("/repos/{repo}/collaborators/{login}/permission"),
        );
        let response = builder
            .send()
            .await
            .map_err(|e| ShopError::CodeHost(format!("check permission: {e}")))?;
        // Non-collaborators come back as 404.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Permission::None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShopError::CodeHost(format!("check permission: {status} {body}")));
        }
        let parsed: PermissionResponse = response
            .json()
            .await
            .map_err(|e| ShopError::CodeHost(format!("check permission: {e}")))?;
        Ok(Permission::parse(&parsed.permission))
    }

    async fn get_file(&self, repo: &str, path: &str) -> ShopResult<Vec<u8>> {
        let builder = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/contents/{path}"),
            )
            .header("Accept", "application/vnd.github.raw+json");
        let response = self.send(builder, "get file").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ShopError::CodeHost(format!("get file: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_comment_posts_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/repos/octocat/shop/issues/7/comments")
            .match_header("authorization", "Bearer tok")
            .match_body(mockito::Matcher::JsonString(
                r#"{"body":"hello"}"#.to_string(),
            ))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        client.create_comment("octocat/shop", 7, "hello").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn check_permission_maps_404_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/octocat/shop/collaborators/rando/permission")
            .with_status(404)
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        let permission = client.check_permission("octocat/shop", "rando").await.unwrap();
        assert_eq!(permission, Permission::None);
        assert!(!permission.can_push());
    }

    #[tokio::test]
    async fn check_permission_parses_level() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/octocat/shop/collaborators/alice/permission")
            .with_status(200)
            .with_body(r#"{"permission":"admin","user":{"login":"alice"}}"#)
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        let permission = client.check_permission("octocat/shop", "alice").await.unwrap();
        assert!(permission.can_push());
    }

    #[tokio::test]
    async fn get_file_returns_raw_bytes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/octocat/shop/contents/gitshop.json")
            .with_status(200)
            .with_body(r#"{"products":[]}"#)
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        let bytes = client.get_file("octocat/shop", "gitshop.json").await.unwrap();
        assert_eq!(bytes, br#"{"products":[]}"#);
    }

    #[tokio::test]
    async fn remove_label_tolerates_missing_label() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/repos/octocat/shop/issues/7/labels/pending-payment")
            .with_status(404)
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        client
            .remove_label("octocat/shop", 7, "pending-payment")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_error_surfaces_as_code_host_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/repos/octocat/shop/issues/7/comments")
            .with_status(502)
            .create_async()
            .await;

        let client = GithubClient::with_base_url("tok", server.url());
        let err = client.create_comment("octocat/shop", 7, "x").await.unwrap_err();
        assert!(matches!(err, ShopError::CodeHost(_)));
        assert!(err.is_retryable());
    }
}
