//! Row-level operations, grouped by table.

mod devices;
mod entries;
mod profiles;
mod sync_log;
mod users;
