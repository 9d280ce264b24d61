//! Status and classification events published to front ends.
//!
//! Everything here is serde-serialisable with camelCase field names so the
//! terminal front end can print it as JSON lines (`--json`).

pub mod events;
