// marginalia-common: wire protocol and identifiers shared by the relay and its clients

pub mod protocol;
pub mod types;
