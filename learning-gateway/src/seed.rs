//! Seed library loading
//!
//! Reads nuggets and narrative nodes from a YAML or JSON document and installs
//! them into a store at startup.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use narrative_engine::{Choice, NarrativeNode, NarrativeStore, Nugget, NuggetStatus, StoreError};

/// Errors from seed loading
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("Failed to read seed library: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML seed library: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON seed library: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inconsistent seed library: {0}")]
    Invalid(String),

    #[error("Failed to store seed entry: {0}")]
    Store(#[from] StoreError),
}

/// Document format of a seed library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedFormat {
    Yaml,
    Json,
}

impl SeedFormat {
    /// Guess from the file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SeedFormat::Json,
            _ => SeedFormat::Yaml,
        }
    }
}

/// Top-level seed document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedLibrary {
    /// Tenant applied to entries that do not name one
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub nuggets: Vec<SeedNugget>,
    #[serde(default)]
    pub nodes: Vec<SeedNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedNugget {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default = "ready")]
    pub status: NuggetStatus,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn ready() -> NuggetStatus {
    NuggetStatus::Ready
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedNode {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub nugget_id: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub adapts_to: Vec<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

/// Counts of installed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeedSummary {
    pub nuggets: usize,
    pub nodes: usize,
}

impl SeedLibrary {
    pub fn parse(text: &str, format: SeedFormat) -> Result<Self, SeedError> {
        Ok(match format {
            SeedFormat::Yaml => serde_yaml::from_str(text)?,
            SeedFormat::Json => serde_json::from_str(text)?,
        })
    }

    /// Resolve tenants and check references inside the document.
    ///
    /// Every node must wrap a nugget of the library and every choice must
    /// target a node of the library.
    pub fn resolve(self) -> Result<(Vec<Nugget>, Vec<NarrativeNode>), SeedError> {
        let tenant_of = |own: Option<String>, kind: &str, id: &str| {
            own.or_else(|| self.tenant_id.clone())
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| SeedError::Invalid(format!("{} {} has no tenantId", kind, id)))
        };

        let mut nuggets = Vec::with_capacity(self.nuggets.len());
        for n in &self.nuggets {
            nuggets.push(Nugget {
                id: n.id.clone(),
                tenant_id: tenant_of(n.tenant_id.clone(), "nugget", &n.id)?,
                title: n.title.clone(),
                content: n.content.clone(),
                status: n.status,
                image_url: n.image_url.clone(),
                audio_url: n.audio_url.clone(),
                tags: n.tags.clone(),
            });
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for n in &self.nodes {
            nodes.push(NarrativeNode {
                id: n.id.clone(),
                tenant_id: tenant_of(n.tenant_id.clone(), "node", &n.id)?,
                nugget_id: n.nugget_id.clone(),
                prerequisites: n.prerequisites.clone(),
                adapts_to: n.adapts_to.clone(),
                choices: n.choices.clone(),
            });
        }

        let nugget_ids: HashSet<&str> = nuggets.iter().map(|n| n.id.as_str()).collect();
        let node_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        if node_ids.len() != nodes.len() {
            return Err(SeedError::Invalid("duplicate node id".into()));
        }
        for node in &nodes {
            if !nugget_ids.contains(node.nugget_id.as_str()) {
                return Err(SeedError::Invalid(format!(
                    "node {} wraps unknown nugget {}",
                    node.id, node.nugget_id
                )));
            }
            if let Some(choice) = node
                .choices
                .iter()
                .find(|c| !node_ids.contains(c.target_node_id.as_str()))
            {
                return Err(SeedError::Invalid(format!(
                    "choice {} of node {} targets unknown node {}",
                    choice.id, node.id, choice.target_node_id
                )));
            }
        }

        Ok((nuggets, nodes))
    }

    /// Write the library into `store`.
    pub async fn install(self, store: &dyn NarrativeStore) -> Result<SeedSummary, SeedError> {
        let (nuggets, nodes) = self.resolve()?;
        let summary = SeedSummary {
            nuggets: nuggets.len(),
            nodes: nodes.len(),
        };

        for nugget in nuggets {
            if !nugget.is_ready() {
                warn!(nugget_id = %nugget.id, status = ?nugget.status, "Seeding nugget that is not ready");
            }
            store.insert_nugget(nugget).await?;
        }
        for node in nodes {
            store.insert_node(node).await?;
        }

        Ok(summary)
    }
}

/// Load a seed file and install it.
pub async fn load_file(path: &Path, store: &dyn NarrativeStore) -> Result<SeedSummary, SeedError> {
    let text = tokio::fs::read_to_string(path).await?;
    let library = SeedLibrary::parse(&text, SeedFormat::from_path(path))?;
    let summary = library.install(store).await?;
    info!(
        path = %path.display(),
        nuggets = summary.nuggets,
        nodes = summary.nodes,
        "Seed library loaded"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use narrative_engine::MemoryStore;

    const LIBRARY: &str = r#"
tenantId: acme
nuggets:
  - id: g-own
    title: Ownership
    content: Every value has one owner.
    tags: [rust, memory]
  - id: g-draft
    tenantId: other
    title: Draft
    content: Not yet.
    status: pending
nodes:
  - id: intro
    nuggetId: g-own
    choices:
      - id: again
        text: Read it again
        targetNodeId: intro
        revealsGap: [ownership]
"#;

    #[tokio::test]
    async fn test_install_yaml_library() {
        let store = MemoryStore::new();
        let library = SeedLibrary::parse(LIBRARY, SeedFormat::Yaml).unwrap();
        let summary = tokio_test::assert_ok!(library.install(&store).await);
        assert_eq!(summary, SeedSummary { nuggets: 2, nodes: 1 });

        let node = store.get_node("intro").await.unwrap();
        assert_eq!(node.tenant_id, "acme");
        assert!(node.choices[0].reveals_gap.contains("ownership"));

        let draft = store.get_nugget("g-draft").await.unwrap();
        assert_eq!(draft.tenant_id, "other");
        assert_eq!(draft.status, NuggetStatus::Pending);
        assert!(store.get_nugget("g-own").await.unwrap().is_ready());
    }

    #[test]
    fn test_dangling_references_rejected() {
        let yaml = r#"
tenantId: acme
nuggets: [{id: g, title: T, content: C}]
nodes:
  - id: a
    nuggetId: g
    choices: [{id: c, text: go, targetNodeId: nowhere}]
"#;
        let err = SeedLibrary::parse(yaml, SeedFormat::Yaml)
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        let yaml = "nodes: [{id: a, tenantId: t, nuggetId: missing}]";
        let err = SeedLibrary::parse(yaml, SeedFormat::Yaml)
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let json = r#"{"nuggets": [{"id": "g", "title": "T", "content": "C"}]}"#;
        let err = SeedLibrary::parse(json, SeedFormat::Json)
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(matches!(err, SeedError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(
            &path,
            r#"{"tenantId": "acme",
                "nuggets": [{"id": "g", "title": "T", "content": "C"}],
                "nodes": [{"id": "n", "nuggetId": "g"}]}"#,
        )
        .unwrap();
        assert_eq!(SeedFormat::from_path(&path), SeedFormat::Json);

        let store = MemoryStore::new();
        let summary = load_file(&path, &store).await.unwrap();
        assert_eq!(summary.nodes, 1);
        assert_eq!(store.nodes_in_scope("acme").await.unwrap().len(), 1);
    }
}
