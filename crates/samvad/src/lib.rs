pub mod abort;
pub mod chat;
pub mod config;
pub mod crawl;
pub mod error;
pub mod intent;
pub mod llm;
pub mod persistence;
pub mod presets;
pub mod prompt;
pub mod retrieval;
pub mod search;
pub mod tools;
pub mod types;

// Re-export primary types for convenience
pub use abort::{AbortController, AbortSignal};
pub use chat::{ChatEngine, EventEmitter, NoopEmitter, SendOutcome, SessionState, Strategy};
pub use config::ChatConfig;
pub use crawl::{CrawlResult, WebsiteCrawler};
pub use error::ChatError;
pub use llm::{
    ChatResponse, CompletionProvider, CompletionRequest, OpenAiCompatProvider, ProviderMessage,
    TokenStream,
};
pub use persistence::{InMemoryMessageStore, MessageStore};
pub use retrieval::{NoRetrieval, RetrievalService};
pub use search::{SearchResult, WebSearchClient};
pub use tools::ToolInvoker;
pub use types::{Chat, ChatMessage, ChatPayload, ChatSettings, Message, Profile, Role};

pub use uuid::Uuid;
