pub mod center;
pub mod counter;
pub mod events;
pub mod models;
pub mod services;

#[cfg(test)]
mod testing;

pub use center::{NotificationCenter, Tracking};
pub use counter::{UnreadCounter, UnreadSnapshot};
pub use services::NotificationService;
