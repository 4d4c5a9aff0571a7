//! Request/response payload schemas for the built-in agents.
//!
//! | Agent | Input                                   | Output                          |
//! |-------|-----------------------------------------|---------------------------------|
//! | chat  | `{user_input, history?}`                | `{assistant_response}`          |
//! | pdf   | raw PDF bytes                           | `{text, images}`                |
//! | sheet | `{input_columns, output_columns, sheet_data, sheet_name}` | `{input, output}` |
//! | train | `{input_data, output_data, hidden_layers?, epochs?, lr?, batch_size?}` | same + `{model, loss}` |
//!
//! Every JSON reply may additionally carry the request's `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_HIDDEN_LAYERS: [usize; 2] = [32, 16];
pub const DEFAULT_EPOCHS: usize = 100;
pub const DEFAULT_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_BATCH_SIZE: usize = 16;

// ── chat ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Also accepted as `text`, so a PDF agent's reply can feed a chat agent.
    #[serde(alias = "text")]
    pub user_input: String,
    /// Prior turns, oldest first. The worker keeps no conversation state
    /// of its own, so callers that want context send it here.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub assistant_response: String,
}

// ── pdf ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfResponse {
    pub text: String,
    pub images: String,
}

// ── sheet ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRequest {
    #[serde(default)]
    pub input_columns: Vec<String>,
    #[serde(default)]
    pub output_columns: Vec<String>,
    /// Base64-encoded file contents
    pub sheet_data: String,
    /// File name; its extension selects the format
    pub sheet_name: String,
}

/// Column name → column values, in the column order of the request.
pub type ColumnTable = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetResponse {
    pub input: ColumnTable,
    pub output: ColumnTable,
}

// ── train ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Feature name → samples. Also accepted as `input`, so a sheet
    /// agent's reply can feed a train agent.
    #[serde(alias = "input")]
    pub input_data: Map<String, Value>,
    /// Target name → samples. Also accepted as `output`.
    #[serde(alias = "output")]
    pub output_data: Map<String, Value>,
    #[serde(default = "default_hidden_layers")]
    pub hidden_layers: Vec<usize>,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_hidden_layers() -> Vec<usize> {
    DEFAULT_HIDDEN_LAYERS.to_vec()
}

fn default_epochs() -> usize {
    DEFAULT_EPOCHS
}

fn default_lr() -> f64 {
    DEFAULT_LEARNING_RATE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResponse {
    pub input_data: Map<String, Value>,
    pub output_data: Map<String, Value>,
    pub hidden_layers: Vec<usize>,
    pub epochs: usize,
    pub lr: f64,
    pub batch_size: usize,
    /// Base64 of the JSON-serialized model
    pub model: String,
    /// Mean squared error over the training set after the last epoch,
    /// in standardized units
    pub loss: f64,
}
