pub mod callbacks;
pub mod gateway;
pub mod reconciliation;
pub mod stk;
pub mod token_cache;
