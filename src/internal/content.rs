//! Typed content payloads.
//!
//! Every commit carries exactly one content payload, serialized to
//! canonical JSON with an explicit `content_type` discriminator so the
//! blob hash is unambiguous. The variants map onto the message roles an
//! LLM API expects; `Session` is the one variant that never reaches the
//! compiled message stream (it only appears in history views).
//!
//! | Variant | Compiled role | Default priority |
//! |---|---|---|
//! | `Instruction` | `system` | pinned |
//! | `Dialogue` | `user` / `assistant` | normal |
//! | `ToolIo` | `assistant` (call) / `tool` (result) | normal |
//! | `Reasoning` | `assistant` | skip |
//! | `Artifact` | `user` | normal |
//! | `Output` | `assistant` | normal |
//! | `Freeform` | carried role | normal |
//! | `Session` | not emitted | normal |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::internal::annotations::Priority;
use crate::llm::Message;

/// Speaker role for dialogue content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    User,
    Assistant,
}

impl DialogueRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DialogueRole::User => "user",
            DialogueRole::Assistant => "assistant",
        }
    }
}

/// Direction of a tool interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolIoRole {
    ToolCall,
    ToolResult,
}

/// Kind of session boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Start,
    End,
    Handoff,
    Checkpoint,
}

fn default_reasoning_format() -> String {
    "text".to_string()
}

/// The content payload of a commit, discriminated by `content_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum Content {
    /// System-prompt-like instruction.
    Instruction { text: String },

    /// A user or assistant turn.
    Dialogue {
        role: DialogueRole,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// One half of a tool interaction. A call carries `arguments`, a
    /// result carries `result`; both reference the same `tool_call_id`.
    ToolIo {
        role: ToolIoRole,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        tool_call_id: String,
    },

    /// Chain-of-thought trace, excluded from compilation by default.
    Reasoning {
        text: String,
        #[serde(default = "default_reasoning_format")]
        format: String,
    },

    /// An opaque attachment (document, code listing, fetched page).
    Artifact {
        media_type: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },

    /// A final answer, distinguished from dialogue for audit.
    Output { text: String },

    /// Escape hatch: arbitrary text under an arbitrary role.
    Freeform { text: String, role: String },

    /// Multi-agent boundary marker; recorded in history, never compiled.
    Session {
        session_type: SessionType,
        summary: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        decisions: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_approaches: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        next_steps: Vec<String>,
    },
}

impl Content {
    /// The discriminator string used in canonical JSON and storage.
    pub const fn content_type(&self) -> &'static str {
        match self {
            Content::Instruction { .. } => "instruction",
            Content::Dialogue { .. } => "dialogue",
            Content::ToolIo { .. } => "tool_io",
            Content::Reasoning { .. } => "reasoning",
            Content::Artifact { .. } => "artifact",
            Content::Output { .. } => "output",
            Content::Freeform { .. } => "freeform",
            Content::Session { .. } => "session",
        }
    }

    /// Default priority assigned when no annotation exists.
    pub const fn default_priority(&self) -> Priority {
        match self {
            Content::Instruction { .. } => Priority::Pinned,
            Content::Reasoning { .. } => Priority::Skip,
            _ => Priority::Normal,
        }
    }

    /// Validate payload invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            Content::ToolIo {
                role,
                name,
                arguments,
                result,
                tool_call_id,
            } => {
                if name.is_empty() {
                    return Err(TractError::ContentValidation(
                        "tool_io requires a tool name".into(),
                    ));
                }
                if tool_call_id.is_empty() {
                    return Err(TractError::ContentValidation(
                        "tool_io requires a tool_call_id".into(),
                    ));
                }
                match role {
                    ToolIoRole::ToolCall if arguments.is_none() => {
                        return Err(TractError::ContentValidation(
                            "tool_call requires arguments".into(),
                        ));
                    }
                    ToolIoRole::ToolResult if result.is_none() => {
                        return Err(TractError::ContentValidation(
                            "tool_result requires a result".into(),
                        ));
                    }
                    _ => {}
                }
                Ok(())
            }
            Content::Freeform { role, .. } => {
                if role.is_empty() || role.chars().any(char::is_whitespace) {
                    return Err(TractError::ContentValidation(format!(
                        "freeform role `{role}` must be a single non-empty token"
                    )));
                }
                Ok(())
            }
            Content::Artifact { media_type, .. } => {
                if media_type.is_empty() {
                    return Err(TractError::ContentValidation(
                        "artifact requires a media_type".into(),
                    ));
                }
                Ok(())
            }
            Content::Reasoning { format, .. } => {
                if format.is_empty() {
                    return Err(TractError::ContentValidation(
                        "reasoning format cannot be empty".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Serialize to the payload shape that is hashed and stored.
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a stored payload back into a typed variant.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let content: Content = serde_json::from_value(payload.clone())
            .map_err(|e| TractError::ContentValidation(format!("malformed payload: {e}")))?;
        content.validate()?;
        Ok(content)
    }

    /// The primary human-readable text of this payload. Used by merge
    /// conflict surfaces, compression prompts and diffs.
    pub fn primary_text(&self) -> String {
        match self {
            Content::Instruction { text }
            | Content::Output { text }
            | Content::Freeform { text, .. }
            | Content::Reasoning { text, .. }
            | Content::Dialogue { text, .. } => text.clone(),
            Content::ToolIo {
                role,
                name,
                arguments,
                result,
                ..
            } => match role {
                ToolIoRole::ToolCall => format!(
                    "{name}({})",
                    arguments
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_default()
                ),
                ToolIoRole::ToolResult => result.clone().unwrap_or_default(),
            },
            Content::Artifact { body, .. } => body.clone(),
            Content::Session { summary, .. } => summary.clone(),
        }
    }

    /// Rebuild this payload with its primary text replaced. Used when a
    /// merge resolution or edit rewrites a message in place.
    pub fn with_primary_text(&self, text: impl Into<String>) -> Content {
        let text = text.into();
        let mut updated = self.clone();
        match &mut updated {
            Content::Instruction { text: t }
            | Content::Output { text: t }
            | Content::Freeform { text: t, .. }
            | Content::Reasoning { text: t, .. }
            | Content::Dialogue { text: t, .. } => *t = text,
            Content::ToolIo { result, .. } => *result = Some(text),
            Content::Artifact { body, .. } => *body = text,
            Content::Session { summary, .. } => *summary = text,
        }
        updated
    }

    /// Project this payload to a compiled message.
    ///
    /// Returns `None` for session boundaries, which are deliberately
    /// elided from the compiled stream.
    pub fn to_message(&self) -> Option<Message> {
        match self {
            Content::Instruction { text } => Some(Message::new("system", text.clone())),
            Content::Dialogue { role, text, name } => {
                let mut message = Message::new(role.as_str(), text.clone());
                message.name = name.clone();
                Some(message)
            }
            Content::ToolIo {
                role,
                name,
                arguments,
                result,
                tool_call_id,
            } => match role {
                ToolIoRole::ToolCall => {
                    let mut message = Message::new("assistant", String::new());
                    message.tool_calls = Some(vec![serde_json::json!({
                        "id": tool_call_id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": arguments.clone().unwrap_or(Value::Null).to_string(),
                        },
                    })]);
                    Some(message)
                }
                ToolIoRole::ToolResult => {
                    let mut message =
                        Message::new("tool", result.clone().unwrap_or_default());
                    message.tool_call_id = Some(tool_call_id.clone());
                    message.name = Some(name.clone());
                    Some(message)
                }
            },
            Content::Reasoning { text, .. } => Some(Message::new("assistant", text.clone())),
            Content::Artifact {
                media_type, body, ..
            } => Some(Message::new(
                "user",
                format!("[artifact:{media_type}]\n{body}"),
            )),
            Content::Output { text } => Some(Message::new("assistant", text.clone())),
            Content::Freeform { text, role } => Some(Message::new(role.clone(), text.clone())),
            Content::Session { .. } => None,
        }
    }
}
