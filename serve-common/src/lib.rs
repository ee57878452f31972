//! llm-serve Common Types
//!
//! OpenAI wire types shared by the gateway and its clients.

pub mod chat;
pub mod error;
pub mod models;

pub use chat::{
    new_completion_id, unix_now, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatDelta, ChatMessage, Choice, ChunkChoice, StopSequences,
    StreamOptions, Usage,
};
pub use error::{ErrorResponse, StreamError};
pub use models::{ModelCard, ModelList};
