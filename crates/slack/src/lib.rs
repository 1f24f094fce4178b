//! Slack integration for the TARS assistant.
//!
//! - **Web API** (`api`) - `conversations.*`, `users.info`, `chat.postMessage`
//! - **Events** (`events`) - Events API parsing and the listener's ingress decision
//! - **History** (`history`) - thread fetcher producing the `{from, message}` story
//! - **Signatures** (`signature`) - `X-Slack-Signature` verification
//! - **mrkdwn** (`mrkdwn`) - Markdown conversion for outbound answers
//!
//! ```text
//! Slack Events → signature check → EventDispatcher → IngressService
//!                                                      ├─ evaluate now
//!                                                      └─ defer (queue)
//! ```

pub mod api;
pub mod events;
pub mod history;
pub mod mrkdwn;
pub mod signature;
pub mod users;

pub use api::{SlackApi, SlackApiError, SlackWebClient};
pub use history::{ThreadHistoryFetcher, ThreadSnapshot};
pub use mrkdwn::markdown_to_mrkdwn;
pub use signature::SignatureVerifier;
