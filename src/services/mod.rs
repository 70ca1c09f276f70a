mod hypothesis;
mod library_api;
mod pocket;

pub use hypothesis::HypothesisClient;
pub use library_api::{LibraryApiClient, LibraryRemote, PatchOperation, PendingMutation, PullResponse};
pub use pocket::PocketClient;
