/**
 * GITHUB ISSUE BUS - Journal porté par les commentaires d'une issue
 *
 * RÔLE : Implémentation réelle du bus. Chaque message est un commentaire ;
 * l'id du commentaire sert de position (croissant à l'append) et `created_at`
 * d'horodatage hôte.
 *
 * FONCTIONNEMENT :
 * - append : POST /repos/{owner}/{repo}/issues/{n}/comments
 * - lecture : GET paginé (100 par page) puis décodage local
 * - 5xx / 429 / rate limit / erreurs réseau => `Unreachable` (rejouable)
 * - autres 4xx => `Rejected` (non rejouable)
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{BusError, MessageBus, WorkItem};
use crate::config::GithubConf;
use crate::message::{self, LogPosition, Message, MessageBody, RawEntry};

const PER_PAGE: usize = 100;
const USER_AGENT: &str = concat!("hive-kernel/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct Comment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GithubIssueBus {
    client: Client,
    conf: GithubConf,
}

impl GithubIssueBus {
    pub fn new(conf: GithubConf) -> Result<Self, BusError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BusError::Rejected(format!("http client: {e}")))?;
        Ok(Self { client, conf })
    }

    fn issue_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/issues/{}",
            self.conf.api_url.trim_end_matches('/'),
            self.conf.owner,
            self.conf.repo,
            self.conf.issue
        )
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.conf.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BusError> {
        let response = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))?;
        check_status(response).await
    }

    async fn fetch_comments(&self) -> Result<Vec<RawEntry>, BusError> {
        let url = format!("{}/comments", self.issue_url());
        let mut entries = Vec::new();
        let mut page = 1usize;
        loop {
            let req = self
                .client
                .get(&url)
                .query(&[("per_page", PER_PAGE), ("page", page)]);
            let batch: Vec<Comment> = self
                .send(req)
                .await?
                .json()
                .await
                .map_err(|e| BusError::Unreachable(format!("comment page {page}: {e}")))?;
            let last_page = batch.len() < PER_PAGE;
            entries.extend(batch.into_iter().map(|c| RawEntry {
                position: LogPosition(c.id),
                observed_at: c.created_at,
                text: c.body.unwrap_or_default(),
            }));
            if last_page {
                break;
            }
            page += 1;
        }
        debug!("[bus] fetched {} comment(s) over {} page(s)", entries.len(), page);
        Ok(entries)
    }
}

async fn check_status(response: Response) -> Result<Response, BusError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let rate_limited = response
        .headers()
        .get("x-ratelimit-remaining")
        .is_some_and(|v| v.as_bytes() == b"0");
    let detail = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {}", detail.chars().take(200).collect::<String>());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || rate_limited {
        Err(BusError::Unreachable(detail))
    } else {
        Err(BusError::Rejected(detail))
    }
}

#[async_trait]
impl MessageBus for GithubIssueBus {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
        let text = message::encode(sender, body)?;
        let req = self
            .client
            .post(format!("{}/comments", self.issue_url()))
            .json(&serde_json::json!({ "body": text }));
        let created: Comment = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| BusError::Unreachable(format!("append response: {e}")))?;
        debug!("[bus] appended {} as comment {}", body.kind().as_str(), created.id);
        Ok(LogPosition(created.id))
    }

    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
        let entries = self.fetch_comments().await?;
        Ok(message::decode_entries(
            entries.iter().filter(|e| e.position > after),
        ))
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        let issue: Issue = self
            .send(self.client.get(self.issue_url()))
            .await?
            .json()
            .await
            .map_err(|e| BusError::Unreachable(format!("issue: {e}")))?;
        Ok(Some(WorkItem {
            title: issue.title,
            body: issue.body.unwrap_or_default(),
        }))
    }
}
