//! Campaign module
//!
//! The discover-pair-probe loop that drives every measurement.

mod engine;

pub use engine::{
    download_from_peer, ping_peer, Campaign, CampaignConfig, Dispatch, Iteration, SkipReason,
};
