//! Change propagation from committed write transactions to long-lived
//! observers: query subscriptions and prefix watches.

mod notifier;
mod subscription;
mod watch;

pub use notifier::ChangeNotifier;
pub use subscription::Subscription;
pub use watch::{PrefixChange, PrefixWatch};
