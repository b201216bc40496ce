// checkin-common: wire types shared by the check-in client crates

pub mod identity;
pub mod notice;
pub mod protocol;
