//! External collaborators of the relay: the completion service, the IM
//! callback and the knowledge-base files.  The coordinator only sees the
//! `ModelClient` and `Notifier` traits.

pub mod knowledge;
pub mod model;
pub mod notifier;

pub use self::knowledge::KnowledgeBase;
pub use self::model::{ModelClient, ModelSettings, OpenAiCompatClient};
pub use self::notifier::{ImNotifier, Notifier};
