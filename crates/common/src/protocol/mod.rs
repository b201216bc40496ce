// Wire protocols shared by the check-in client crates.

pub mod events;
