//! Two-way sync of highlights and saved articles with remote services.

mod articles;
mod debounce;
mod engine;
mod highlights;
mod remote;
mod state;

pub use debounce::Debouncer;
pub use engine::{FlowOutcome, SyncEngine, SyncOptions};
pub use remote::{ArticlesRemote, HighlightPage, HighlightsRemote, RemoteHighlight};
pub use state::UploadReport;
