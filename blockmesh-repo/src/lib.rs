#![allow(dead_code)]

mod file;
mod repo;
mod store;

pub use file::FileLayout;
pub use repo::{
    BlockGets, BlockVisibleState, CommitOutcome, CommitRequest, GetContext, GetResult, IRepo,
    MissingTransform, PendOutcome, PendPolicy, PendRequest, PendingConflict, Repo, TrxBlocks,
};
pub use store::{Atomic, BlockStore, Tracker};
