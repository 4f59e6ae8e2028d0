//! Transcript blocks and the ordered transcript

use serde::{Deserialize, Serialize};
use tether_protocol::Usage;

/// Where a block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Created by this controller while streaming
    Live,
    /// Loaded from durable storage of previously committed turns
    Persisted,
}

/// A tool invocation and, once it arrives, its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_id: String,
    pub name: String,
    /// Raw input text; only expected to be valid JSON once input is complete
    pub input: String,
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
    pub result_pending: bool,
    #[serde(default)]
    pub collapsed: bool,
}

impl ToolCall {
    /// Parse the input buffer as JSON
    pub fn parsed_input(&self) -> Option<serde_json::Value> {
        if self.input.trim().is_empty() {
            return Some(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.input).ok()
    }
}

/// Block payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    User {
        text: String,
    },
    Text {
        content: String,
    },
    Thinking {
        content: String,
        signed: bool,
        collapsed: bool,
    },
    ToolCall(ToolCall),
    System {
        content: String,
    },
    Compaction {
        summary: String,
        pre_tokens: Option<u64>,
        trigger: Option<String>,
        collapsed: bool,
    },
    Interrupted,
    Error {
        message: String,
    },
    EmptyResponse,
}

/// One ordered unit of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    /// Creation time (unix millis)
    pub created_at: i64,
    pub origin: Origin,
    /// Cost attribution; only ever set on the last block of a turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub kind: BlockKind,
}

impl Block {
    /// Create a block streamed in this session
    pub fn live(kind: BlockKind) -> Self {
        Self::with_origin(kind, Origin::Live)
    }

    /// Create a block loaded from durable storage
    pub fn persisted(kind: BlockKind) -> Self {
        Self::with_origin(kind, Origin::Persisted)
    }

    fn with_origin(kind: BlockKind, origin: Origin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            origin,
            usage: None,
            kind,
        }
    }

    pub fn is_live(&self) -> bool {
        self.origin == Origin::Live
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, BlockKind::User { .. })
    }

    /// Structural view without identity, timestamps or origin.
    pub fn shape(&self) -> (&BlockKind, Option<&Usage>) {
        (&self.kind, self.usage.as_ref())
    }
}

/// Ordered list of blocks; insertion order is display order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    blocks: Vec<Block>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from blocks loaded out of durable storage
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    /// Append a block and return its position
    pub fn push(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn get(&self, position: usize) -> Option<&Block> {
        self.blocks.get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut Block> {
        self.blocks.get_mut(position)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    /// Whether any block was created by a live session in this process
    pub fn has_live_blocks(&self) -> bool {
        self.blocks.iter().any(Block::is_live)
    }

    /// Position of the last user prompt
    pub fn last_user_position(&self) -> Option<usize> {
        self.blocks.iter().rposition(Block::is_user)
    }

    /// Remove and return every block after the last user prompt.
    ///
    /// Without a user prompt nothing is removed.
    pub fn strip_after_last_user(&mut self) -> Vec<Block> {
        match self.last_user_position() {
            Some(pos) => self.blocks.split_off(pos + 1),
            None => Vec::new(),
        }
    }

    /// Remove the blocks at the given positions.
    pub fn remove_positions(&mut self, positions: &[usize]) -> Vec<Block> {
        let mut sorted: Vec<usize> = positions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut removed = Vec::with_capacity(sorted.len());
        for pos in sorted.into_iter().rev() {
            if pos < self.blocks.len() {
                removed.push(self.blocks.remove(pos));
            }
        }
        removed.reverse();
        removed
    }

    /// Position of the tool call block with the given id (latest first)
    pub fn find_tool_call(&self, tool_id: &str) -> Option<usize> {
        self.blocks.iter().rposition(
            |b| matches!(&b.kind, BlockKind::ToolCall(call) if call.tool_id == tool_id),
        )
    }

    /// Sum of usage attributed to the given blocks
    pub fn usage_of(blocks: &[Block]) -> Usage {
        let mut total = Usage::default();
        for usage in blocks.iter().filter_map(|b| b.usage.as_ref()) {
            total.add(usage);
        }
        total
    }
}
