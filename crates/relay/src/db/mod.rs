// Postgres plumbing for the document-access lookup.

pub mod pool;
