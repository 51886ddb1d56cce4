//! HTTP generation backends.
//!
//! - [`chat`]: [`ChatCompletionsClient`], a stateless OpenRouter chat
//!   completions backend.
//! - [`responses`]: [`ResponsesClient`], the OpenAI Responses API with
//!   server-side state and native `/responses/compact`.
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) and
//!   exponential backoff shared by both clients.
//! - [`usage`]: provider usage-block parsing into a
//!   [`UsageReport`](crate::ledger::UsageReport).

pub mod chat;
pub mod responses;
pub mod retry;
pub mod usage;

pub use chat::ChatCompletionsClient;
pub use responses::ResponsesClient;
pub use retry::RetryConfig;
pub use usage::usage_from_payload;
