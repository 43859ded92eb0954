pub mod discovery_service;
pub mod match_service;
pub mod proposal_service;
pub mod swipe_service;

pub use discovery_service::{DiscoveryQuery, DiscoveryService};
pub use match_service::MatchService;
pub use proposal_service::{ProposalChange, ProposalService};
pub use swipe_service::SwipeService;
