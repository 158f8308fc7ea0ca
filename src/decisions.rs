//! Implicit architecture decisions mined from agent transcripts.
//!
//! Phrases such as "chose X over Y" or "replaced X with Y" in the
//! conversation or in lines added by the diff become draft ADRs for a human
//! to review. Each captured option runs to the end of its clause.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use aira_common::models::{Adr, AdrConsequences, AdrStatus};
use aira_common::store::AdrStore;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::ExtractionError;

pub const CONTEXT_PREFIX: &str = "Automatically detected from agent conversation: ";
pub const REVIEW_NOTE: &str = "Extracted automatically; requires human review.";

/// A trailing capture ends at clause punctuation or at a connective that
/// starts a justification ("for", "because", ...).
const CLAUSE_END: &str = r"(?:\s+(?:for|because|since|due|which|so|as)\b|\s*[.,;:!?]|\s*$)";

static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bchose\s+(?P<chosen>[^.,;]+?)\s+over\s+(?P<rejected>[^.,;:!?]+?)",
        r"(?i)\bdecided\s+to\s+(?:use|go\s+with|adopt|implement)\s+(?P<chosen>[^.,;:!?]+?)",
        r"(?i)\bswitched\s+from\s+(?P<rejected>[^.,;]+?)\s+to\s+(?P<chosen>[^.,;:!?]+?)",
        r"(?i)\bselected\s+(?P<chosen>[^.,;]+?)\s+instead\s+of\s+(?P<rejected>[^.,;:!?]+?)",
        r"(?i)\breplaced\s+(?P<rejected>[^.,;]+?)\s+with\s+(?P<chosen>[^.,;:!?]+?)",
    ]
    .iter()
    .map(|p| Regex::new(&format!("{p}{CLAUSE_END}")).unwrap())
    .collect()
});

/// One detected decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicitDecision {
    pub chosen: String,
    pub rejected: Option<String>,
    /// The line it was found in.
    pub source: String,
}

impl ImplicitDecision {
    pub fn title(&self) -> String {
        match &self.rejected {
            Some(rejected) => format!("Use {} instead of {}", self.chosen, rejected),
            None => format!("Use {}", self.chosen),
        }
    }

    fn into_adr(self, tenant_id: Uuid, project_id: Uuid, session_id: Uuid, sequence: i64) -> Adr {
        let title = self.title();
        let mut options = vec![self.chosen.clone()];
        options.extend(self.rejected.clone());
        Adr {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            sequence,
            title,
            status: AdrStatus::Draft,
            context: format!("{CONTEXT_PREFIX}{}", self.source),
            decision: format!("Use {}", self.chosen),
            drivers: Vec::new(),
            options,
            consequences: AdrConsequences {
                neutral: vec![REVIEW_NOTE.to_string()],
                ..AdrConsequences::default()
            },
            agent_session_id: Some(session_id),
            created_at: Utc::now(),
        }
    }
}

pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn capture(caps: &regex::Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Scan the conversation and the added lines of `diff`, keeping the first
/// decision per normalized choice.
pub fn detect_decisions(conversation: &[String], diff: &str) -> Vec<ImplicitDecision> {
    let added = diff
        .lines()
        .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
        .map(|l| &l[1..]);
    let lines = conversation.iter().map(String::as_str).chain(added);

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for line in lines {
        for pattern in PATTERNS.iter() {
            for caps in pattern.captures_iter(line) {
                let Some(chosen) = capture(&caps, "chosen") else {
                    continue;
                };
                if !seen.insert(normalize(&chosen)) {
                    continue;
                }
                found.push(ImplicitDecision {
                    chosen,
                    rejected: capture(&caps, "rejected"),
                    source: line.trim().to_string(),
                });
            }
        }
    }
    found
}

/// Records detected decisions as draft ADRs.
pub struct DecisionExtractor {
    adrs: Arc<dyn AdrStore>,
}

impl DecisionExtractor {
    pub fn new(adrs: Arc<dyn AdrStore>) -> Self {
        Self { adrs }
    }

    /// Persist every new decision found in a session's transcript. A
    /// decision whose title matches an existing ADR of the project is
    /// skipped. Returns how many ADRs were created.
    pub async fn extract(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        session_id: Uuid,
        conversation: &[String],
        diff: &str,
    ) -> Result<usize, ExtractionError> {
        let decisions = detect_decisions(conversation, diff);
        if decisions.is_empty() {
            return Ok(0);
        }

        let existing: HashSet<String> = self
            .adrs
            .list_adrs_by_project(tenant_id, project_id)
            .await
            .map_err(|source| ExtractionError { created: 0, source })?
            .iter()
            .map(|adr| normalize(&adr.title))
            .collect();

        let mut created = 0;
        for decision in decisions {
            if existing.contains(&normalize(&decision.title())) {
                debug!(%project_id, chosen = %decision.chosen, "decision already recorded");
                continue;
            }
            let sequence = self
                .adrs
                .next_adr_sequence(tenant_id, project_id)
                .await
                .map_err(|source| ExtractionError { created, source })?;
            let adr = decision.into_adr(tenant_id, project_id, session_id, sequence);
            let adr = self
                .adrs
                .create_adr(adr)
                .await
                .map_err(|source| ExtractionError { created, source })?;
            created += 1;
            info!(
                %tenant_id,
                %project_id,
                %session_id,
                sequence = adr.sequence,
                title = %adr.title,
                "draft ADR recorded"
            );
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aira_common::StoreError;
    use async_trait::async_trait;

    use crate::store::MemoryStore;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_each_phrase() {
        let conversation = lines(&[
            "We chose PostgreSQL over MySQL for JSON support.",
            "I decided to go with Axum. It is lighter.",
            "Switched from REST to gRPC.",
            "Selected Redis instead of Memcached",
            "Replaced log4j with tracing.",
        ]);
        let found = detect_decisions(&conversation, "");
        let pairs: Vec<(&str, Option<&str>)> = found
            .iter()
            .map(|d| (d.chosen.as_str(), d.rejected.as_deref()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("PostgreSQL", Some("MySQL")),
                ("Axum", None),
                ("gRPC", Some("REST")),
                ("Redis", Some("Memcached")),
                ("tracing", Some("log4j")),
            ]
        );
        assert_eq!(found[0].source, "We chose PostgreSQL over MySQL for JSON support.");
    }

    #[test]
    fn test_case_insensitive_and_deduped() {
        let conversation = lines(&[
            "DECIDED TO USE sqlx.",
            "Later we decided to adopt SQLx.",
        ]);
        let found = detect_decisions(&conversation, "");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chosen, "sqlx");
    }

    #[test]
    fn test_diff_only_added_lines() {
        let diff = "\
+++ b/docs/chose a over b.md
--- a/README.md
-We chose Flask over Django.
+We chose FastAPI over Flask.
 context: decided to use nothing.
";
        let found = detect_decisions(&[], diff);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chosen, "FastAPI");
        assert_eq!(found[0].source, "We chose FastAPI over Flask.");
    }

    #[test]
    fn test_no_phrases() {
        assert!(detect_decisions(&lines(&["All tests pass.", ""]), "").is_empty());
    }

    #[test]
    fn test_title_forms() {
        let d = ImplicitDecision {
            chosen: "PostgreSQL".into(),
            rejected: Some("MySQL".into()),
            source: String::new(),
        };
        assert_eq!(d.title(), "Use PostgreSQL instead of MySQL");
        let d = ImplicitDecision {
            rejected: None,
            ..d
        };
        assert_eq!(d.title(), "Use PostgreSQL");
    }

    #[tokio::test]
    async fn test_extract_records_draft() {
        let store = Arc::new(MemoryStore::new());
        let extractor = DecisionExtractor::new(store.clone());
        let (tenant, project, session) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let created = extractor
            .extract(
                tenant,
                project,
                session,
                &lines(&["Decided to implement retries with backoff."]),
                "",
            )
            .await
            .unwrap();
        assert_eq!(created, 1);

        let adrs = store.list_adrs_by_project(tenant, project).await.unwrap();
        let adr = &adrs[0];
        assert_eq!(adr.sequence, 1);
        assert_eq!(adr.status, AdrStatus::Draft);
        assert_eq!(adr.title, "Use retries with backoff");
        assert_eq!(adr.options, vec!["retries with backoff"]);
        assert_eq!(
            adr.context,
            "Automatically detected from agent conversation: Decided to implement retries with backoff."
        );
        assert_eq!(adr.consequences.neutral, vec![REVIEW_NOTE]);
        assert_eq!(adr.agent_session_id, Some(session));

        // A second run finds the same decision already recorded.
        let again = extractor
            .extract(
                tenant,
                project,
                session,
                &lines(&["decided to implement Retries With Backoff."]),
                "",
            )
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    struct FailingAdrs {
        inner: MemoryStore,
        fail_on_create: usize,
        creates: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl AdrStore for FailingAdrs {
        async fn create_adr(&self, adr: Adr) -> Result<Adr, StoreError> {
            let n = {
                let mut creates = self.creates.lock().unwrap();
                *creates += 1;
                *creates
            };
            if n == self.fail_on_create {
                return Err(anyhow::anyhow!("disk full").into());
            }
            self.inner.create_adr(adr).await
        }
        async fn get_adr(&self, tenant_id: Uuid, id: Uuid) -> Result<Adr, StoreError> {
            self.inner.get_adr(tenant_id, id).await
        }
        async fn list_adrs_by_project(
            &self,
            tenant_id: Uuid,
            project_id: Uuid,
        ) -> Result<Vec<Adr>, StoreError> {
            self.inner.list_adrs_by_project(tenant_id, project_id).await
        }
        async fn next_adr_sequence(
            &self,
            tenant_id: Uuid,
            project_id: Uuid,
        ) -> Result<i64, StoreError> {
            self.inner.next_adr_sequence(tenant_id, project_id).await
        }
        async fn update_adr_status(
            &self,
            tenant_id: Uuid,
            id: Uuid,
            status: AdrStatus,
        ) -> Result<Adr, StoreError> {
            self.inner.update_adr_status(tenant_id, id, status).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_reports_progress() {
        let store = Arc::new(FailingAdrs {
            inner: MemoryStore::new(),
            fail_on_create: 2,
            creates: std::sync::Mutex::new(0),
        });
        let extractor = DecisionExtractor::new(store.clone());
        let err = extractor
            .extract(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                &lines(&["Chose A over B.", "Chose C over D.", "Chose E over F."]),
                "",
            )
            .await
            .unwrap_err();
        assert_eq!(err.created, 1);
        assert!(matches!(err.source, StoreError::Backend(_)));
    }
}
