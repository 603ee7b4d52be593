//! Built-in tutor tools.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use tutor_agent::ToolDefinition;

use super::question_log::{QuestionEntry, QuestionLog};
use super::registry::{ToolHandler, ToolRegistry};
use super::types::ToolContext;
use crate::error::{EngineError, Result};
use crate::mastery::MasteryTracker;
use crate::model::{DeliveryMode, Nugget};
use crate::navigator::NarrativeNavigator;
use crate::store::{NarrativeStore, StoreError};

/// Default `search_nuggets` result count.
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Collaborators the built-in tools operate on.
#[derive(Clone)]
pub struct ToolServices {
    pub store: Arc<dyn NarrativeStore>,
    pub tracker: Arc<MasteryTracker>,
    pub navigator: Arc<NarrativeNavigator>,
    pub questions: Arc<QuestionLog>,
    /// Ceiling for `search_nuggets` limit
    pub search_limit_max: usize,
}

/// Register the fixed tutor tool set.
pub async fn register_builtin_tools(registry: &ToolRegistry, services: ToolServices) {
    let handlers: Vec<Arc<dyn ToolHandler>> = vec![
        Arc::new(DeliverNugget {
            store: Arc::clone(&services.store),
        }),
        Arc::new(AskQuestion {
            questions: Arc::clone(&services.questions),
        }),
        Arc::new(UpdateMastery {
            tracker: Arc::clone(&services.tracker),
        }),
        Arc::new(AdaptNarrative {
            navigator: Arc::clone(&services.navigator),
        }),
        Arc::new(ShowMedia),
        Arc::new(SearchNuggets {
            store: Arc::clone(&services.store),
            limit_max: services.search_limit_max.max(1),
        }),
        Arc::new(GetLearnerProgress {
            tracker: Arc::clone(&services.tracker),
        }),
        Arc::new(IdentifyGaps {
            tracker: services.tracker,
        }),
    ];
    for handler in handlers {
        registry.register_handler(handler).await;
    }
}

/// Decode a tool's argument object.
fn parse_args<T: DeserializeOwned>(tool: &str, args: &Value) -> Result<T> {
    // Models occasionally send `null` for tools without parameters.
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args)
        .map_err(|e| EngineError::Validation(format!("{}: invalid arguments: {}", tool, e)))
}

fn require_text(tool: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!(
            "{}: {} must not be empty",
            tool, field
        )));
    }
    Ok(())
}

// ============================================================================
// deliver_nugget
// ============================================================================

/// Output format of `deliver_nugget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NuggetFormat {
    Text,
    Audio,
    Multimedia,
}

impl NuggetFormat {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "text" => Ok(NuggetFormat::Text),
            "audio" => Ok(NuggetFormat::Audio),
            "multimedia" => Ok(NuggetFormat::Multimedia),
            other => Err(EngineError::Validation(format!(
                "deliver_nugget: unsupported format '{}'",
                other
            ))),
        }
    }

    fn for_mode(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::Text => NuggetFormat::Text,
            DeliveryMode::Voice => NuggetFormat::Audio,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            NuggetFormat::Text => "text",
            NuggetFormat::Audio => "audio",
            NuggetFormat::Multimedia => "multimedia",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliverNuggetArgs {
    nugget_id: String,
    #[serde(default)]
    format: Option<String>,
}

struct DeliverNugget {
    store: Arc<dyn NarrativeStore>,
}

fn render_nugget(nugget: &Nugget, format: NuggetFormat) -> Value {
    let mut body = json!({
        "nuggetId": nugget.id,
        "title": nugget.title,
        "content": nugget.content,
        "format": format.as_str(),
    });
    let include_image = format == NuggetFormat::Multimedia;
    let include_audio = matches!(format, NuggetFormat::Audio | NuggetFormat::Multimedia);
    if let Value::Object(map) = &mut body {
        if let (true, Some(url)) = (include_image, &nugget.image_url) {
            map.insert("imageUrl".into(), json!(url));
        }
        if let (true, Some(url)) = (include_audio, &nugget.audio_url) {
            map.insert("audioUrl".into(), json!(url));
        }
    }
    body
}

#[async_trait::async_trait]
impl ToolHandler for DeliverNugget {
    fn name(&self) -> &'static str {
        "deliver_nugget"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Deliver a learning nugget to the learner.",
            json!({
                "type": "object",
                "properties": {
                    "nuggetId": {"type": "string", "description": "Id of the nugget to deliver"},
                    "format": {
                        "type": "string",
                        "enum": ["text", "audio", "multimedia"],
                        "description": "Delivery format; defaults to the session mode"
                    }
                },
                "required": ["nuggetId"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let args: DeliverNuggetArgs = parse_args(self.name(), args)?;
        require_text(self.name(), "nuggetId", &args.nugget_id)?;
        let format = match args.format.as_deref() {
            Some(raw) => NuggetFormat::parse(raw)?,
            None => NuggetFormat::for_mode(ctx.mode),
        };

        let nugget = match self.store.get_nugget(&args.nugget_id).await {
            Ok(n) => n,
            Err(StoreError::NotFound(_)) => {
                return Err(EngineError::ResourceNotFound(format!(
                    "nugget {}",
                    args.nugget_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if nugget.tenant_id != ctx.tenant_id {
            return Err(EngineError::PermissionDenied(format!(
                "nugget {} belongs to another tenant",
                nugget.id
            )));
        }
        if !nugget.is_ready() {
            return Err(EngineError::InvalidState(format!(
                "nugget {} is not ready ({:?})",
                nugget.id, nugget.status
            )));
        }

        debug!(session_id = %ctx.session_id, nugget_id = %nugget.id, format = format.as_str(), "Nugget delivered");
        Ok(render_nugget(&nugget, format))
    }
}

// ============================================================================
// ask_question
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskQuestionArgs {
    question: String,
    context: String,
    #[serde(default)]
    expected_answer: Option<String>,
}

struct AskQuestion {
    questions: Arc<QuestionLog>,
}

#[async_trait::async_trait]
impl ToolHandler for AskQuestion {
    fn name(&self) -> &'static str {
        "ask_question"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Pose a comprehension question to the learner.",
            json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "context": {"type": "string", "description": "What the question checks"},
                    "expectedAnswer": {"type": "string"}
                },
                "required": ["question", "context"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let args: AskQuestionArgs = parse_args(self.name(), args)?;
        require_text(self.name(), "question", &args.question)?;

        let entry = QuestionEntry {
            question_id: format!("q_{}", uuid::Uuid::new_v4().simple()),
            session_id: ctx.session_id.clone(),
            learner_id: ctx.learner_id.clone(),
            question: args.question,
            context: args.context,
            expected_answer: args.expected_answer,
            asked_at: Utc::now(),
        };
        let body = json!({
            "questionId": entry.question_id,
            "question": entry.question,
            "context": entry.context,
            "expectedAnswer": entry.expected_answer,
        });
        self.questions.record(entry).await;
        Ok(body)
    }
}

// ============================================================================
// update_mastery
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMasteryArgs {
    concept_id: String,
    mastery_level: f64,
    evidence: String,
}

struct UpdateMastery {
    tracker: Arc<MasteryTracker>,
}

#[async_trait::async_trait]
impl ToolHandler for UpdateMastery {
    fn name(&self) -> &'static str {
        "update_mastery"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Record the learner's mastery of a concept (0-100) with supporting evidence.",
            json!({
                "type": "object",
                "properties": {
                    "conceptId": {"type": "string"},
                    "masteryLevel": {"type": "number", "minimum": 0, "maximum": 100},
                    "evidence": {"type": "string"}
                },
                "required": ["conceptId", "masteryLevel", "evidence"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let args: UpdateMasteryArgs = parse_args(self.name(), args)?;
        require_text(self.name(), "conceptId", &args.concept_id)?;

        let delta = self
            .tracker
            .apply_update(&ctx.learner_id, &args.concept_id, args.mastery_level, &args.evidence)
            .await?;
        serde_json::to_value(delta)
            .map_err(|e| EngineError::System(format!("update_mastery: {}", e)))
    }
}

// ============================================================================
// adapt_narrative
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdaptNarrativeArgs {
    reason: String,
    #[serde(default)]
    new_path: Option<Vec<String>>,
}

struct AdaptNarrative {
    navigator: Arc<NarrativeNavigator>,
}

#[async_trait::async_trait]
impl ToolHandler for AdaptNarrative {
    fn name(&self) -> &'static str {
        "adapt_narrative"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Change the learner's path. The first nugget of newPath becomes the current node.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"},
                    "newPath": {"type": "array", "items": {"type": "string"}, "description": "Nugget ids"}
                },
                "required": ["reason"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let args: AdaptNarrativeArgs = parse_args(self.name(), args)?;
        let path = args.new_path.unwrap_or_default();

        if path.is_empty() {
            info!(session_id = %ctx.session_id, reason = %args.reason, "Narrative adaptation without a new path");
            return Ok(json!({"adapted": false, "reason": args.reason}));
        }

        let result = self.navigator.override_path(&ctx.session_id, &path).await?;
        Ok(json!({
            "adapted": true,
            "reason": args.reason,
            "appended": path.len(),
            "currentNodeId": result.session.current_node_id,
            "jumpedTo": result.jumped_to.map(|n| n.id),
        }))
    }
}

// ============================================================================
// show_media
// ============================================================================

#[derive(Deserialize)]
struct ShowMediaArgs {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    caption: Option<String>,
}

struct ShowMedia;

#[async_trait::async_trait]
impl ToolHandler for ShowMedia {
    fn name(&self) -> &'static str {
        "show_media"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Show an image or video to the learner.",
            json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["image", "video"]},
                    "url": {"type": "string"},
                    "caption": {"type": "string"}
                },
                "required": ["type", "url"]
            }),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let args: ShowMediaArgs = parse_args(self.name(), args)?;
        if !matches!(args.kind.as_str(), "image" | "video") {
            return Err(EngineError::Validation(format!(
                "show_media: type must be image or video, got '{}'",
                args.kind
            )));
        }
        require_text(self.name(), "url", &args.url)?;
        Ok(json!({"type": args.kind, "url": args.url, "caption": args.caption}))
    }
}

// ============================================================================
// search_nuggets
// ============================================================================

#[derive(Deserialize)]
struct SearchNuggetsArgs {
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

struct SearchNuggets {
    store: Arc<dyn NarrativeStore>,
    limit_max: usize,
}

#[async_trait::async_trait]
impl ToolHandler for SearchNuggets {
    fn name(&self) -> &'static str {
        "search_nuggets"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Search ready learning nuggets by keyword.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "default": DEFAULT_SEARCH_LIMIT}
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let args: SearchNuggetsArgs = parse_args(self.name(), args)?;
        let limit = args
            .limit
            .map(|l| l.clamp(1, self.limit_max as i64) as usize)
            .unwrap_or(DEFAULT_SEARCH_LIMIT.min(self.limit_max));

        let hits = self
            .store
            .search_nuggets(&ctx.tenant_id, &args.query, limit)
            .await?;
        let results: Vec<Value> = hits
            .iter()
            .map(|n| json!({"nuggetId": n.id, "title": n.title, "tags": n.tags}))
            .collect();
        Ok(json!({"query": args.query, "count": results.len(), "results": results}))
    }
}

// ============================================================================
// get_learner_progress / identify_gaps
// ============================================================================

struct GetLearnerProgress {
    tracker: Arc<MasteryTracker>,
}

#[async_trait::async_trait]
impl ToolHandler for GetLearnerProgress {
    fn name(&self) -> &'static str {
        "get_learner_progress"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Get the learner's mastery scores, knowledge gaps and recent updates.",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<Value> {
        let progress = self.tracker.get_progress(&ctx.learner_id).await?;
        serde_json::to_value(progress)
            .map_err(|e| EngineError::System(format!("get_learner_progress: {}", e)))
    }
}

struct IdentifyGaps {
    tracker: Arc<MasteryTracker>,
}

#[async_trait::async_trait]
impl ToolHandler for IdentifyGaps {
    fn name(&self) -> &'static str {
        "identify_gaps"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Recompute the learner's knowledge gaps from current mastery scores.",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<Value> {
        let gaps = self.tracker.identify_gaps(&ctx.learner_id).await?;
        Ok(json!({"gaps": gaps}))
    }
}
