// GitHub publisher: commits the patch onto a new branch through the git data
// API and opens a pull request. Nothing is pushed from the sandbox.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::PublisherSection;
use crate::error::PublishError;
use crate::reasoning::Proposal;
use crate::types::Task;

use super::{ProposalPublisher, branch_name, proposal_body, proposal_title};

/// Retries for rate-limited requests.
const MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = concat!("minion/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub struct GitHubPublisher {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    token: String,
    base_branch: String,
    branch_prefix: String,
    labels: Vec<String>,
}

impl GitHubPublisher {
    pub fn new(owner: String, repo: String, token: String, section: &PublisherSection) -> Self {
        Self {
            client: crate::http::client(),
            api_base: section.api_base.trim_end_matches('/').to_string(),
            owner,
            repo,
            token,
            base_branch: section.base_branch.clone(),
            branch_prefix: section.branch_prefix.clone(),
            labels: section.labels.clone(),
        }
    }

    fn repo_path(&self, rest: &str) -> String {
        format!("/repos/{}/{}{rest}", self.owner, self.repo)
    }

    async fn api<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, PublishError> {
        let url = format!("{}{path}", self.api_base);
        let mut delay = Duration::from_secs(1);

        for attempt in 0..=MAX_RETRIES {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", USER_AGENT)
                .header("Authorization", format!("Bearer {}", self.token));
            if let Some(body) = body {
                req = req.json(body);
            }
            debug!(%method, url = %url, attempt, "GitHub API request");

            let resp = req
                .send()
                .await
                .map_err(|e| PublishError::Network(format!("GitHub API: {e}")))?;

            if resp.status().is_success() {
                return resp
                    .json()
                    .await
                    .map_err(|e| PublishError::Network(format!("Parse response: {e}")));
            }

            let status = resp.status().as_u16();
            if (status == 403 || status == 429) && attempt < MAX_RETRIES {
                let wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map_or(delay, Duration::from_secs);
                warn!(attempt, status, wait_secs = wait.as_secs(), "Rate limited, backing off");
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(Duration::from_secs(60));
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Api { status, body });
        }

        Err(PublishError::Network(format!(
            "GitHub API: max retries exceeded for {url}"
        )))
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl ProposalPublisher for GitHubPublisher {
    fn name(&self) -> &str {
        "github"
    }

    #[instrument(skip_all, name = "github_publish", fields(task = %task.id))]
    async fn publish(&self, task: &Task, proposal: &Proposal) -> Result<String, PublishError> {
        let branch = branch_name(&self.branch_prefix, task);
        let title = proposal_title(task);

        let base: GhRef = self
            .api(
                Method::GET,
                &self.repo_path(&format!("/git/ref/heads/{}", self.base_branch)),
                None,
            )
            .await?;
        let base_commit: GhCommit = self
            .api(
                Method::GET,
                &self.repo_path(&format!("/git/commits/{}", base.object.sha)),
                None,
            )
            .await?;

        let mut entries = Vec::with_capacity(proposal.patch.len());
        for edit in proposal.patch.edits() {
            let blob: GhSha = self
                .api(
                    Method::POST,
                    &self.repo_path("/git/blobs"),
                    Some(&json!({ "content": edit.content, "encoding": "utf-8" })),
                )
                .await?;
            entries.push(json!({
                "path": edit.path.as_str(),
                "mode": "100644",
                "type": "blob",
                "sha": blob.sha,
            }));
        }

        let tree: GhSha = self
            .api(
                Method::POST,
                &self.repo_path("/git/trees"),
                Some(&json!({ "base_tree": base_commit.tree.sha, "tree": entries })),
            )
            .await?;
        let commit: GhSha = self
            .api(
                Method::POST,
                &self.repo_path("/git/commits"),
                Some(&json!({
                    "message": title,
                    "tree": tree.sha,
                    "parents": [base.object.sha],
                })),
            )
            .await?;
        let _: Value = self
            .api(
                Method::POST,
                &self.repo_path("/git/refs"),
                Some(&json!({ "ref": format!("refs/heads/{branch}"), "sha": commit.sha })),
            )
            .await?;

        let pull: GhPull = self
            .api(
                Method::POST,
                &self.repo_path("/pulls"),
                Some(&json!({
                    "title": title,
                    "head": branch,
                    "base": self.base_branch,
                    "body": proposal_body(task, proposal, Utc::now()),
                    "draft": false,
                })),
            )
            .await?;

        // Labels and reviewers are best effort.
        if !self.labels.is_empty() {
            if let Err(e) = self
                .api::<Value>(
                    Method::POST,
                    &self.repo_path(&format!("/issues/{}/labels", pull.number)),
                    Some(&json!({ "labels": self.labels })),
                )
                .await
            {
                warn!(error = %e, pr = pull.number, "Could not add labels");
            }
        }
        if !task.reviewers.is_empty() {
            if let Err(e) = self
                .api::<Value>(
                    Method::POST,
                    &self.repo_path(&format!("/pulls/{}/requested_reviewers", pull.number)),
                    Some(&json!({ "reviewers": task.reviewers })),
                )
                .await
            {
                warn!(error = %e, pr = pull.number, "Could not request reviewers");
            }
        }

        info!(pr = pull.number, url = %pull.html_url, branch = %branch, "Pull request opened");
        Ok(pull.html_url)
    }
}

// ── GitHub API Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhSha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    object: GhSha,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    tree: GhSha,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    html_url: String,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Push URL of the repository's default remote, if it points at GitHub.
pub fn detect_github_remote(repo_path: &Path) -> Option<String> {
    let repo = gix::open(repo_path).ok()?;
    let remote = repo
        .find_default_remote(gix::remote::Direction::Push)?
        .ok()?;
    let url = remote.url(gix::remote::Direction::Push)?;
    let url_str = url.to_bstring().to_string();
    url_str.contains("github.com").then_some(url_str)
}

/// Parse "owner/repo" from a GitHub URL (SSH or HTTPS).
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let rest = if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest
    } else {
        url.split_once("github.com/")?.1
    };
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let (owner, repo) = rest.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}
