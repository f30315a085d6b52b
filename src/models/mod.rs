pub mod claims;
pub mod policy;
pub mod token;
pub mod verdict;
